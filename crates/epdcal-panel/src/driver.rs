//! Segmented driver for the 12.48" B panel.
//!
//! The glass is addressed as four quadrant controllers on one SPI bus:
//!
//! ```text
//!     0        648      1304
//!   0 +--------+--------+
//!     |   S2   |   M2   |
//! 492 +--------+--------+
//!     |   M1   |   S1   |
//! 984 +--------+--------+
//! ```
//!
//! Each quadrant has its own chip select and busy line; M1/S1 and M2/S2
//! share a data/command line and a reset line. Every byte on the bus is
//! individually framed: DC level, CS assert, one byte shifted, CS release.
//! CS is released even when the transfer fails.

use embedded_hal::{
    delay::DelayNs,
    digital::{InputPin, OutputPin},
    spi::SpiBus,
};
use tracing::{debug, info};

use crate::error::{BusTarget, PanelError, PanelResult};
use crate::lut::LUT_UPLOADS;
use crate::pack::{PlanePair, PLANE_SIZE};

/// Cooperative cancellation for long bus operations (plane streaming and
/// busy-waits poll this between frames).
pub trait CancelToken {
    fn is_cancelled(&self) -> bool;
}

impl<F: Fn() -> bool> CancelToken for F {
    fn is_cancelled(&self) -> bool {
        self()
    }
}

/// A token that never cancels.
pub struct NeverCancel;

impl CancelToken for NeverCancel {
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// One of the four quadrant controllers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quadrant {
    M1,
    S1,
    M2,
    S2,
}

impl std::fmt::Display for Quadrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::M1 => "M1",
            Self::S1 => "S1",
            Self::M2 => "M2",
            Self::S2 => "S2",
        };
        f.write_str(name)
    }
}

/// Driver lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanelState {
    Uninitialized,
    Ready,
    Displaying,
    Asleep,
    /// Terminal: a bus error occurred. Re-create the driver to recover.
    Faulted,
}

// Chip-select bitmask, one bit per quadrant.
type Cs = u8;
const CS_M1: Cs = 0b0001;
const CS_S1: Cs = 0b0010;
const CS_M2: Cs = 0b0100;
const CS_S2: Cs = 0b1000;
const CS_M1M2: Cs = CS_M1 | CS_M2;
const CS_ALL: Cs = CS_M1 | CS_S1 | CS_M2 | CS_S2;

const REG_PANEL_SETTING: u8 = 0x00;
const REG_POWER_SETTING: u8 = 0x01;
const REG_POWER_OFF: u8 = 0x02;
const REG_POWER_ON: u8 = 0x04;
const REG_BOOSTER_SOFT_START: u8 = 0x06;
const REG_DEEP_SLEEP: u8 = 0x07;
const REG_DATA_BLACK: u8 = 0x10;
const REG_DISPLAY_REFRESH: u8 = 0x12;
const REG_DATA_RED: u8 = 0x13;
const REG_DUAL_SPI: u8 = 0x15;
const REG_PLL: u8 = 0x30;
const REG_VCOM_INTERVAL: u8 = 0x50;
const REG_TCON: u8 = 0x60;
const REG_RESOLUTION: u8 = 0x61;
const REG_GET_STATUS: u8 = 0x71;
const REG_POWER_SAVING: u8 = 0xE3;
const REG_POWER_MODE: u8 = 0xE0;
const REG_VCOM_DC: u8 = 0x82;

fn target_of(cs: Cs) -> BusTarget {
    match cs {
        CS_M1 => BusTarget::One(Quadrant::M1),
        CS_S1 => BusTarget::One(Quadrant::S1),
        CS_M2 => BusTarget::One(Quadrant::M2),
        CS_S2 => BusTarget::One(Quadrant::S2),
        CS_M1M2 => BusTarget::M1M2,
        _ => BusTarget::Broadcast,
    }
}

/// The bus and GPIO lines the driver owns.
pub struct PanelPeripherals<SPI, OUT, IN> {
    /// Shared SPI bus (mode 0, <= 2 MHz, 8-bit, MSB-first).
    pub spi: SPI,
    pub m1_cs: OUT,
    pub s1_cs: OUT,
    pub m2_cs: OUT,
    pub s2_cs: OUT,
    /// Data/command line shared by M1 and S1.
    pub m1s1_dc: OUT,
    /// Data/command line shared by M2 and S2.
    pub m2s2_dc: OUT,
    pub m1s1_rst: OUT,
    pub m2s2_rst: OUT,
    pub m1_busy: IN,
    pub s1_busy: IN,
    pub m2_busy: IN,
    pub s2_busy: IN,
}

/// Object-safe view of the driver for the orchestrator, which owns the one
/// physical panel behind a `Box<dyn PanelDevice>`.
pub trait PanelDevice: Send {
    fn init(&mut self) -> PanelResult<()>;
    fn display(&mut self, planes: &PlanePair, cancel: &dyn CancelToken) -> PanelResult<()>;
    fn clear(&mut self, cancel: &dyn CancelToken) -> PanelResult<()>;
    fn sleep(&mut self) -> PanelResult<()>;
    fn state(&self) -> PanelState;
}

/// Driver for the four-quadrant panel.
pub struct PanelDriver<SPI, OUT, IN, DELAY> {
    peris: PanelPeripherals<SPI, OUT, IN>,
    delay: DELAY,
    state: PanelState,
}

impl<SPI, OUT, IN, DELAY> PanelDriver<SPI, OUT, IN, DELAY>
where
    SPI: SpiBus<u8>,
    OUT: OutputPin,
    IN: InputPin,
    DELAY: DelayNs,
{
    /// Wraps the peripherals. The panel is untouched until [`init`](Self::init).
    pub fn new(peris: PanelPeripherals<SPI, OUT, IN>, delay: DELAY) -> Self {
        Self {
            peris,
            delay,
            state: PanelState::Uninitialized,
        }
    }

    /// Releases the peripherals.
    pub fn into_peripherals(self) -> PanelPeripherals<SPI, OUT, IN> {
        self.peris
    }

    pub fn state(&self) -> PanelState {
        self.state
    }

    /// Hard reset + full register/LUT bring-up. Legal from every state
    /// except Faulted; a sleeping panel is woken by the reset.
    pub fn init(&mut self) -> PanelResult<()> {
        if self.state == PanelState::Faulted {
            return Err(PanelError::protocol("driver is faulted; re-create the handle"));
        }

        self.release_bus()?;
        self.hard_reset()?;
        self.state = PanelState::Uninitialized;

        // Panel setting: the masters carry the LUT-from-register bit.
        self.cmd_with_data(CS_M1, REG_PANEL_SETTING, &[0x2F])?;
        self.cmd_with_data(CS_S1, REG_PANEL_SETTING, &[0x2F])?;
        self.cmd_with_data(CS_M2, REG_PANEL_SETTING, &[0x23])?;
        self.cmd_with_data(CS_S2, REG_PANEL_SETTING, &[0x23])?;

        // Power setting, masters only.
        self.cmd_with_data(CS_M1, REG_POWER_SETTING, &[0x07, 0x17, 0x3F, 0x3F, 0x0D])?;
        self.cmd_with_data(CS_M2, REG_POWER_SETTING, &[0x07, 0x17, 0x3F, 0x3F, 0x0D])?;

        self.cmd_with_data(CS_M1, REG_BOOSTER_SOFT_START, &[0x17, 0x17, 0x39, 0x17])?;
        self.cmd_with_data(CS_M2, REG_BOOSTER_SOFT_START, &[0x17, 0x17, 0x39, 0x17])?;

        // Per-quadrant resolution: 648x492 on the outer pair, 656x492 on
        // the inner pair.
        self.cmd_with_data(CS_M1, REG_RESOLUTION, &[0x02, 0x88, 0x01, 0xEC])?;
        self.cmd_with_data(CS_S1, REG_RESOLUTION, &[0x02, 0x90, 0x01, 0xEC])?;
        self.cmd_with_data(CS_M2, REG_RESOLUTION, &[0x02, 0x90, 0x01, 0xEC])?;
        self.cmd_with_data(CS_S2, REG_RESOLUTION, &[0x02, 0x88, 0x01, 0xEC])?;

        self.cmd_with_data(CS_ALL, REG_DUAL_SPI, &[0x20])?;
        self.cmd_with_data(CS_ALL, REG_PLL, &[0x08])?;
        self.cmd_with_data(CS_ALL, REG_VCOM_INTERVAL, &[0x31, 0x07])?;
        self.cmd_with_data(CS_ALL, REG_TCON, &[0x22])?;

        self.cmd_with_data(CS_M1, REG_POWER_MODE, &[0x01])?;
        self.cmd_with_data(CS_M2, REG_POWER_MODE, &[0x01])?;
        self.cmd_with_data(CS_ALL, REG_POWER_SAVING, &[0x00])?;
        self.cmd_with_data(CS_M1, REG_VCOM_DC, &[0x1C])?;
        self.cmd_with_data(CS_M2, REG_VCOM_DC, &[0x1C])?;

        for (reg, table) in LUT_UPLOADS {
            self.cmd_with_data(CS_ALL, reg, table)?;
        }

        info!("panel initialized");
        self.state = PanelState::Ready;
        Ok(())
    }

    /// Streams a frame and refreshes the glass. Blocks through the refresh
    /// busy period; poll cadence is 200 ms and the token is consulted
    /// between polls.
    pub fn display(&mut self, planes: &PlanePair, cancel: &dyn CancelToken) -> PanelResult<()> {
        self.ensure_ready("display")?;
        if planes.black.len() != PLANE_SIZE || planes.red.len() != PLANE_SIZE {
            return Err(PanelError::geometry(format!(
                "plane buffers must be {PLANE_SIZE} bytes"
            )));
        }

        self.state = PanelState::Displaying;
        let res = self.display_inner(planes, cancel);
        match res {
            Ok(()) => {
                self.state = PanelState::Ready;
                Ok(())
            }
            Err(PanelError::Cancelled) => {
                // Aborted between frames; the bus itself is healthy.
                self.state = PanelState::Ready;
                Err(PanelError::Cancelled)
            }
            Err(e) => Err(e),
        }
    }

    fn display_inner(&mut self, planes: &PlanePair, cancel: &dyn CancelToken) -> PanelResult<()> {
        // Quadrant windows in (rows, byte columns) of the packed planes.
        const WINDOWS: [(Cs, std::ops::Range<usize>, std::ops::Range<usize>); 4] = [
            (CS_S2, 0..492, 0..81),
            (CS_M2, 0..492, 81..163),
            (CS_S1, 492..984, 81..163),
            (CS_M1, 492..984, 0..81),
        ];

        for (cs, rows, cols) in WINDOWS {
            self.stream_window(cs, REG_DATA_BLACK, &planes.black, rows.clone(), cols.clone(), false, cancel)?;
            // Red register polarity is inverted on this controller lot.
            self.stream_window(cs, REG_DATA_RED, &planes.red, rows, cols, true, cancel)?;
        }

        self.refresh(cancel)
    }

    fn stream_window(
        &mut self,
        cs: Cs,
        reg: u8,
        plane: &[u8],
        rows: std::ops::Range<usize>,
        cols: std::ops::Range<usize>,
        invert: bool,
        cancel: &dyn CancelToken,
    ) -> PanelResult<()> {
        self.cmd(cs, reg)?;
        for y in rows {
            if cancel.is_cancelled() {
                return Err(PanelError::Cancelled);
            }
            for x in cols.clone() {
                let byte = plane[y * 163 + x];
                self.data(cs, if invert { !byte } else { byte }, reg)?;
            }
        }
        Ok(())
    }

    fn refresh(&mut self, cancel: &dyn CancelToken) -> PanelResult<()> {
        self.cmd(CS_M1M2, REG_POWER_ON)?;
        self.delay.delay_ms(300);

        self.cmd(CS_ALL, REG_DISPLAY_REFRESH)?;

        for q in [Quadrant::M1, Quadrant::S1, Quadrant::M2, Quadrant::S2] {
            self.wait_quadrant_ready(q, cancel)?;
        }
        debug!("panel refresh complete");
        Ok(())
    }

    /// Streams an all-white frame and refreshes.
    pub fn clear(&mut self, cancel: &dyn CancelToken) -> PanelResult<()> {
        self.ensure_ready("clear")?;
        self.state = PanelState::Displaying;

        let res = (|| {
            const WINDOWS: [(Cs, usize, usize); 4] = [
                (CS_S2, 492, 81),
                (CS_M2, 492, 82),
                (CS_S1, 492, 82),
                (CS_M1, 492, 81),
            ];
            for (cs, rows, cols) in WINDOWS {
                self.fill_window(cs, REG_DATA_BLACK, 0xFF, rows * cols, cancel)?;
                self.fill_window(cs, REG_DATA_RED, 0x00, rows * cols, cancel)?;
            }
            self.refresh(cancel)
        })();

        match res {
            Ok(()) => {
                self.state = PanelState::Ready;
                Ok(())
            }
            Err(PanelError::Cancelled) => {
                self.state = PanelState::Ready;
                Err(PanelError::Cancelled)
            }
            Err(e) => Err(e),
        }
    }

    fn fill_window(
        &mut self,
        cs: Cs,
        reg: u8,
        value: u8,
        count: usize,
        cancel: &dyn CancelToken,
    ) -> PanelResult<()> {
        self.cmd(cs, reg)?;
        for i in 0..count {
            if i % 163 == 0 && cancel.is_cancelled() {
                return Err(PanelError::Cancelled);
            }
            self.data(cs, value, reg)?;
        }
        Ok(())
    }

    /// Powers off and enters deep sleep. Only a hard reset (via
    /// [`init`](Self::init)) wakes the panel again.
    pub fn sleep(&mut self) -> PanelResult<()> {
        self.ensure_ready("sleep")?;

        self.cmd(CS_ALL, REG_POWER_OFF)?;
        self.delay.delay_ms(300);
        self.cmd_with_data(CS_ALL, REG_DEEP_SLEEP, &[0xA5])?;
        self.delay.delay_ms(300);

        info!("panel asleep");
        self.state = PanelState::Asleep;
        Ok(())
    }

    fn ensure_ready(&self, op: &str) -> PanelResult<()> {
        match self.state {
            PanelState::Ready => Ok(()),
            state => Err(PanelError::protocol(format!(
                "{op} requires Ready state, driver is {state:?}"
            ))),
        }
    }

    /// Polls one quadrant until its busy line releases. The controller
    /// wants a status request before each read.
    fn wait_quadrant_ready(&mut self, q: Quadrant, cancel: &dyn CancelToken) -> PanelResult<()> {
        let cs = match q {
            Quadrant::M1 => CS_M1,
            Quadrant::S1 => CS_S1,
            Quadrant::M2 => CS_M2,
            Quadrant::S2 => CS_S2,
        };

        loop {
            if cancel.is_cancelled() {
                return Err(PanelError::Cancelled);
            }
            self.cmd(cs, REG_GET_STATUS)?;
            if self.busy_released(q)? {
                break;
            }
            self.delay.delay_ms(200);
        }
        self.delay.delay_ms(200);
        Ok(())
    }

    /// Busy lines read low while the controller is processing.
    fn busy_released(&mut self, q: Quadrant) -> PanelResult<bool> {
        let result = match q {
            Quadrant::M1 => self.peris.m1_busy.is_high(),
            Quadrant::S1 => self.peris.s1_busy.is_high(),
            Quadrant::M2 => self.peris.m2_busy.is_high(),
            Quadrant::S2 => self.peris.s2_busy.is_high(),
        };
        result.map_err(|e| {
            self.state = PanelState::Faulted;
            PanelError::bus(REG_GET_STATUS, BusTarget::One(q), e)
        })
    }

    /// RST high 200 ms, low 10 ms, high 200 ms (both reset lines).
    fn hard_reset(&mut self) -> PanelResult<()> {
        self.set_resets(true)?;
        self.delay.delay_ms(200);
        self.set_resets(false)?;
        self.delay.delay_ms(10);
        self.set_resets(true)?;
        self.delay.delay_ms(200);
        Ok(())
    }

    fn set_resets(&mut self, high: bool) -> PanelResult<()> {
        let res = if high {
            self.peris
                .m1s1_rst
                .set_high()
                .and_then(|_| self.peris.m2s2_rst.set_high())
        } else {
            self.peris
                .m1s1_rst
                .set_low()
                .and_then(|_| self.peris.m2s2_rst.set_low())
        };
        res.map_err(|e| {
            self.state = PanelState::Faulted;
            PanelError::protocol(format!("reset line failed: {e:?}"))
        })
    }

    fn cmd(&mut self, cs: Cs, reg: u8) -> PanelResult<()> {
        self.frame(cs, false, reg, reg)
    }

    fn data(&mut self, cs: Cs, byte: u8, reg: u8) -> PanelResult<()> {
        self.frame(cs, true, byte, reg)
    }

    fn cmd_with_data(&mut self, cs: Cs, reg: u8, data: &[u8]) -> PanelResult<()> {
        self.cmd(cs, reg)?;
        for &byte in data {
            self.data(cs, byte, reg)?;
        }
        Ok(())
    }

    /// One framed byte: DC level, CS assert, shift, CS release. CS is
    /// released even when the shift fails; any failure faults the driver.
    fn frame(&mut self, cs: Cs, data: bool, byte: u8, reg: u8) -> PanelResult<()> {
        if self.state == PanelState::Faulted {
            return Err(PanelError::protocol("driver is faulted"));
        }

        if let Err(e) = self.set_frame_lines(cs, data) {
            let _ = self.deassert_all_cs();
            self.state = PanelState::Faulted;
            return Err(PanelError::Bus {
                register: reg,
                target: target_of(cs),
                detail: e,
            });
        }

        let shifted = self.peris.spi.write(&[byte]);
        let released = self.deassert_all_cs();

        if let Err(e) = shifted {
            self.state = PanelState::Faulted;
            return Err(PanelError::bus(reg, target_of(cs), e));
        }
        if let Err(e) = released {
            self.state = PanelState::Faulted;
            return Err(PanelError::Bus {
                register: reg,
                target: target_of(cs),
                detail: e,
            });
        }
        Ok(())
    }

    fn set_frame_lines(&mut self, cs: Cs, data: bool) -> Result<(), String> {
        let set_dc = |pin: &mut OUT| -> Result<(), String> {
            let r = if data { pin.set_high() } else { pin.set_low() };
            r.map_err(|e| format!("{e:?}"))
        };

        // Both DC lines of an addressed pair move together; a broadcast
        // drives both pairs identically.
        if cs & (CS_M1 | CS_S1) != 0 {
            set_dc(&mut self.peris.m1s1_dc)?;
        }
        if cs & (CS_M2 | CS_S2) != 0 {
            set_dc(&mut self.peris.m2s2_dc)?;
        }

        // CS is active low; all addressed selects assert before the shift.
        let assert = |pin: &mut OUT| -> Result<(), String> {
            pin.set_low().map_err(|e| format!("{e:?}"))
        };
        if cs & CS_M1 != 0 {
            assert(&mut self.peris.m1_cs)?;
        }
        if cs & CS_S1 != 0 {
            assert(&mut self.peris.s1_cs)?;
        }
        if cs & CS_M2 != 0 {
            assert(&mut self.peris.m2_cs)?;
        }
        if cs & CS_S2 != 0 {
            assert(&mut self.peris.s2_cs)?;
        }
        Ok(())
    }

    fn deassert_all_cs(&mut self) -> Result<(), String> {
        let mut first_err = None;
        for pin in [
            &mut self.peris.m1_cs,
            &mut self.peris.s1_cs,
            &mut self.peris.m2_cs,
            &mut self.peris.s2_cs,
        ] {
            if let Err(e) = pin.set_high() {
                first_err.get_or_insert(format!("{e:?}"));
            }
        }
        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    fn release_bus(&mut self) -> PanelResult<()> {
        self.deassert_all_cs().map_err(|e| {
            self.state = PanelState::Faulted;
            PanelError::protocol(format!("chip selects stuck: {e}"))
        })
    }
}

impl<SPI, OUT, IN, DELAY> PanelDevice for PanelDriver<SPI, OUT, IN, DELAY>
where
    SPI: SpiBus<u8> + Send,
    OUT: OutputPin + Send,
    IN: InputPin + Send,
    DELAY: DelayNs + Send,
{
    fn init(&mut self) -> PanelResult<()> {
        PanelDriver::init(self)
    }

    fn display(&mut self, planes: &PlanePair, cancel: &dyn CancelToken) -> PanelResult<()> {
        PanelDriver::display(self, planes, cancel)
    }

    fn clear(&mut self, cancel: &dyn CancelToken) -> PanelResult<()> {
        PanelDriver::clear(self, cancel)
    }

    fn sleep(&mut self) -> PanelResult<()> {
        PanelDriver::sleep(self)
    }

    fn state(&self) -> PanelState {
        PanelDriver::state(self)
    }
}

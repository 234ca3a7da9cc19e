//! Concrete hardware wiring for the panel.
//!
//! The driver itself is generic over embedded-hal traits; this module
//! binds it to the Raspberry Pi's SPI0 bus and the HAT's BCM pins.

use epdcal_panel::PanelDevice;

/// Opens the SPI bus and GPIO lines and brings the panel up.
///
/// Errors are strings so the caller can log them and fall back to
/// render-only operation on hosts without the hardware.
#[cfg(target_os = "linux")]
pub fn open_panel() -> Result<Box<dyn PanelDevice>, String> {
    use epdcal_panel::{pins, PanelDriver, PanelPeripherals};
    use rppal::gpio::Gpio;
    use rppal::hal::Delay;
    use rppal::spi::{Bus, Mode, SlaveSelect, Spi};

    // Mode 0, 2 MHz, 8-bit MSB-first; CS is driven manually per quadrant.
    let spi = Spi::new(Bus::Spi0, SlaveSelect::Ss0, 2_000_000, Mode::Mode0)
        .map_err(|e| format!("SPI open: {e}"))?;

    let gpio = Gpio::new().map_err(|e| format!("GPIO open: {e}"))?;
    let output = |bcm: u8| -> Result<rppal::gpio::OutputPin, String> {
        Ok(gpio
            .get(bcm)
            .map_err(|e| format!("GPIO {bcm}: {e}"))?
            .into_output_high())
    };
    let busy_input = |bcm: u8| -> Result<rppal::gpio::InputPin, String> {
        Ok(gpio
            .get(bcm)
            .map_err(|e| format!("GPIO {bcm}: {e}"))?
            .into_input_pullup())
    };

    let peris = PanelPeripherals {
        spi,
        m1_cs: output(pins::CS_M1)?,
        s1_cs: output(pins::CS_S1)?,
        m2_cs: output(pins::CS_M2)?,
        s2_cs: output(pins::CS_S2)?,
        m1s1_dc: output(pins::DC_M1S1)?,
        m2s2_dc: output(pins::DC_M2S2)?,
        m1s1_rst: output(pins::RST_M1S1)?,
        m2s2_rst: output(pins::RST_M2S2)?,
        m1_busy: busy_input(pins::BUSY_M1)?,
        s1_busy: busy_input(pins::BUSY_S1)?,
        m2_busy: busy_input(pins::BUSY_M2)?,
        s2_busy: busy_input(pins::BUSY_S2)?,
    };

    let mut driver = PanelDriver::new(peris, Delay::new());
    driver.init().map_err(|e| format!("panel init: {e}"))?;
    Ok(Box::new(driver))
}

#[cfg(not(target_os = "linux"))]
pub fn open_panel() -> Result<Box<dyn PanelDevice>, String> {
    Err("panel hardware is only supported on Linux".to_string())
}

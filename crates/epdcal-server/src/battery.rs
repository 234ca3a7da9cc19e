//! Battery status for the Web UI.
//!
//! The target hardware carries a PiSugar-style controller on I2C; hosts
//! without one (development machines, CI) get a mock reader so the API
//! stays functional everywhere.

use serde::Serialize;
use tracing::debug;

use crate::error::ServerResult;

/// Current battery status.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BatteryStatus {
    /// Charge level, 0..=100.
    pub percent: u8,
    /// Pack voltage in millivolts; 0 when unknown.
    pub voltage_mv: u16,
}

/// How battery information is obtained.
pub trait BatteryReader: Send + Sync {
    fn read(&self) -> ServerResult<BatteryStatus>;
}

/// Development reader: pseudo-random percentage, no voltage.
pub struct MockBatteryReader;

impl BatteryReader for MockBatteryReader {
    fn read(&self) -> ServerResult<BatteryStatus> {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos();
        Ok(BatteryStatus {
            percent: 20 + (nanos % 81) as u8,
            voltage_mv: 0,
        })
    }
}

/// PiSugar3 register map: voltage high/low bytes and percent.
#[cfg(target_os = "linux")]
mod pisugar {
    use super::*;
    use crate::error::ServerError;

    const REG_VOLTAGE_HIGH: u8 = 0x22;
    const REG_VOLTAGE_LOW: u8 = 0x23;
    const REG_PERCENT: u8 = 0x2A;

    fn i2c_err(e: impl std::fmt::Display) -> ServerError {
        ServerError::config(format!("battery I2C: {e}"))
    }

    /// I2C-backed reader. The bus is opened per read; battery polling is
    /// rare (30 s snapshot TTL) and this keeps the handle from pinning
    /// the bus.
    pub struct PiSugarReader {
        addr: u16,
    }

    impl PiSugarReader {
        pub const DEFAULT_ADDR: u16 = 0x57;

        pub fn new(addr: u16) -> Self {
            Self { addr }
        }
    }

    impl BatteryReader for PiSugarReader {
        fn read(&self) -> ServerResult<BatteryStatus> {
            let mut bus = rppal::i2c::I2c::new().map_err(i2c_err)?;
            bus.set_slave_address(self.addr).map_err(i2c_err)?;

            let mut read_reg = |reg: u8| -> ServerResult<u8> {
                let mut buf = [0u8; 1];
                bus.write_read(&[reg], &mut buf).map_err(i2c_err)?;
                Ok(buf[0])
            };

            let high = read_reg(REG_VOLTAGE_HIGH)?;
            let low = read_reg(REG_VOLTAGE_LOW)?;
            let percent = read_reg(REG_PERCENT)?.min(100);

            Ok(BatteryStatus {
                percent,
                voltage_mv: u16::from(high) << 8 | u16::from(low),
            })
        }
    }
}

#[cfg(target_os = "linux")]
pub use pisugar::PiSugarReader;

/// Picks the best available reader: real I2C when a probe read succeeds,
/// otherwise the mock.
pub fn default_reader() -> Box<dyn BatteryReader> {
    #[cfg(target_os = "linux")]
    {
        let reader = PiSugarReader::new(PiSugarReader::DEFAULT_ADDR);
        if reader.read().is_ok() {
            debug!("using PiSugar I2C battery reader");
            return Box::new(reader);
        }
    }
    debug!("battery hardware unavailable, using mock reader");
    Box::new(MockBatteryReader)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_reader_stays_in_range() {
        let reader = MockBatteryReader;
        for _ in 0..100 {
            let status = reader.read().unwrap();
            assert!((20..=100).contains(&status.percent));
            assert_eq!(status.voltage_mv, 0);
        }
    }

    #[test]
    fn default_reader_always_works() {
        let reader = default_reader();
        assert!(reader.read().is_ok());
    }
}

//! BCM pin assignments for the panel HAT.
//!
//! SCK/MOSI are owned by the SPI peripheral and listed for documentation.

pub const SCK: u8 = 11;
pub const MOSI: u8 = 10;

pub const CS_M1: u8 = 8;
pub const CS_S1: u8 = 7;
pub const CS_M2: u8 = 17;
pub const CS_S2: u8 = 18;

pub const DC_M1S1: u8 = 13;
pub const DC_M2S2: u8 = 22;

pub const RST_M1S1: u8 = 6;
pub const RST_M2S2: u8 = 23;

pub const BUSY_M1: u8 = 5;
pub const BUSY_S1: u8 = 19;
pub const BUSY_M2: u8 = 27;
pub const BUSY_S2: u8 = 24;

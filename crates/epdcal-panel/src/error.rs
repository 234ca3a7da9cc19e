//! Panel error types.

use thiserror::Error;

use crate::driver::Quadrant;

/// A specialized Result type for panel operations.
pub type PanelResult<T> = Result<T, PanelError>;

/// Errors from the plane packer and the panel driver.
#[derive(Debug, Error)]
pub enum PanelError {
    /// SPI/GPIO failure during a command or data frame. The driver is
    /// Faulted after this and must be re-created.
    #[error("bus error on register 0x{register:02X} ({target}): {detail}")]
    Bus {
        register: u8,
        target: BusTarget,
        detail: String,
    },

    /// The operation is not legal in the driver's current state.
    #[error("panel protocol violation: {0}")]
    Protocol(String),

    /// Input raster does not match the panel geometry contract.
    #[error("image geometry: {0}")]
    ImageGeometry(String),

    /// Operation was cancelled before completion.
    #[error("panel operation cancelled")]
    Cancelled,
}

/// The chip-select scope a failing frame was addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusTarget {
    One(Quadrant),
    M1M2,
    Broadcast,
}

impl std::fmt::Display for BusTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::One(q) => write!(f, "{q}"),
            Self::M1M2 => write!(f, "M1+M2"),
            Self::Broadcast => write!(f, "broadcast"),
        }
    }
}

impl PanelError {
    pub(crate) fn bus<E: std::fmt::Debug>(register: u8, target: BusTarget, cause: E) -> Self {
        Self::Bus {
            register,
            target,
            detail: format!("{cause:?}"),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    pub fn geometry(message: impl Into<String>) -> Self {
        Self::ImageGeometry(message.into())
    }
}

//! Waveshare 12.48" B (1304x984, black/white/red) panel support.
//!
//! [`pack`] turns a captured NRGBA raster into the panel's two 1-bpp color
//! planes; [`driver`] clocks those planes out to the four quadrant
//! controllers over a shared SPI bus and walks the refresh state machine.

pub mod driver;
pub mod error;
pub mod lut;
pub mod pack;
pub mod pins;

pub use driver::{CancelToken, PanelDevice, PanelDriver, PanelPeripherals, PanelState, Quadrant};
pub use error::{PanelError, PanelResult};
pub use pack::{pack_planes, ClassifyThresholds, PlanePair, PANEL_HEIGHT, PANEL_WIDTH, PLANE_SIZE};

//! Command-line interface definition.

use std::path::PathBuf;

use clap::Parser;

/// epdcal - calendar on a tri-color e-paper panel
#[derive(Debug, Parser)]
#[command(name = "epdcal")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, env = "EPDCAL_CONFIG", default_value = epdcal_server::DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// HTTP listen address (overrides config if set)
    #[arg(long)]
    pub listen: Option<String>,

    /// Run one refresh cycle and exit
    #[arg(long)]
    pub once: bool,

    /// Render only; do not touch display hardware
    #[arg(long)]
    pub render_only: bool,

    /// Write black.bin and red.bin next to the preview PNG
    #[arg(long)]
    pub dump: bool,

    /// Debug mode: use ./config.yaml and ./cache instead of /etc and /var/lib
    #[arg(long)]
    pub debug: bool,
}

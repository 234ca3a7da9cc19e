//! Application configuration: YAML file with first-run creation.
//!
//! Unknown or empty values normalize to defaults so configs written by
//! older versions keep working. The file is created with mode 0600 on
//! first run and rewritten atomically (temp file + rename).

use std::path::{Path, PathBuf};

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::warn;

use epdcal_core::Source;

use crate::error::{ServerError, ServerResult};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/epdcal/config.yaml";
const DEFAULT_LISTEN: &str = "127.0.0.1:8080";
const DEFAULT_TIMEZONE: &str = "Asia/Seoul";
const DEFAULT_REFRESH: &str = "*/15 * * * *";
const DEFAULT_HORIZON_DAYS: i64 = 7;
const DEFAULT_ROTATION: u32 = 90;

/// One subscribed ICS source.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IcsSourceConfig {
    /// Subscription endpoint.
    #[serde(default)]
    pub url: String,
    /// Internal identifier for de-dup and log context.
    #[serde(default)]
    pub id: String,
    /// Human-friendly label shown in the UI.
    #[serde(default)]
    pub name: String,
}

/// HTTP Basic Auth credentials for the Web UI/API.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BasicAuthConfig {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl BasicAuthConfig {
    /// Empty credentials disable auth entirely.
    pub fn is_enabled(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// HTTP listen address.
    pub listen: String,
    /// IANA display timezone.
    pub timezone: String,
    /// First day of the week: "monday" or "sunday".
    pub week_start: String,
    /// Cron-style refresh schedule.
    pub refresh: String,
    /// Days of future events to display.
    pub horizon_days: i64,
    /// Show the all-day section in the rendered view.
    pub show_all_day: bool,
    /// Keywords that render an event in red.
    pub highlight_red: Vec<String>,
    /// Raster rotation applied when packing (90 or 270).
    pub rotation: u32,
    /// Subscribed ICS sources.
    pub ics: Vec<IcsSourceConfig>,
    /// Basic auth for everything except /health, when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub basic_auth: Option<BasicAuthConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            timezone: DEFAULT_TIMEZONE.to_string(),
            week_start: "monday".to_string(),
            refresh: DEFAULT_REFRESH.to_string(),
            horizon_days: DEFAULT_HORIZON_DAYS,
            show_all_day: true,
            highlight_red: Vec::new(),
            rotation: DEFAULT_ROTATION,
            ics: Vec::new(),
            basic_auth: None,
        }
    }
}

impl Config {
    /// Fills missing or nonsensical values with defaults.
    pub fn normalize(&mut self) {
        let defaults = Config::default();
        if self.listen.is_empty() {
            self.listen = defaults.listen;
        }
        if self.timezone.is_empty() {
            self.timezone = defaults.timezone;
        }
        match self.week_start.as_str() {
            "monday" | "sunday" => {}
            other => {
                if !other.is_empty() {
                    warn!(week_start = other, "unknown week_start, using monday");
                }
                self.week_start = "monday".to_string();
            }
        }
        if self.refresh.is_empty() {
            self.refresh = defaults.refresh;
        }
        if self.horizon_days <= 0 {
            self.horizon_days = defaults.horizon_days;
        }
        if self.rotation != 90 && self.rotation != 270 {
            self.rotation = DEFAULT_ROTATION;
        }
    }

    /// The display timezone, falling back to UTC on an unknown name.
    pub fn display_tz(&self) -> Tz {
        self.timezone.parse().unwrap_or_else(|_| {
            warn!(timezone = %self.timezone, "unknown timezone, falling back to UTC");
            Tz::UTC
        })
    }

    /// Builds the fetchable source list; entries without a URL are skipped
    /// and missing ids fall back to the name, then the URL.
    pub fn sources(&self) -> Vec<Source> {
        self.ics
            .iter()
            .filter(|s| !s.url.is_empty())
            .map(|s| {
                let id = if !s.id.is_empty() {
                    s.id.clone()
                } else if !s.name.is_empty() {
                    s.name.clone()
                } else {
                    s.url.clone()
                };
                Source::new(id, s.url.clone())
            })
            .collect()
    }

    /// True when basic auth is configured with non-empty credentials.
    pub fn basic_auth_enabled(&self) -> bool {
        self.basic_auth.as_ref().is_some_and(|a| a.is_enabled())
    }

    /// Loads configuration from a YAML file.
    ///
    /// A missing file is a first run: the defaults are written out (mode
    /// 0600) and returned.
    pub fn load(path: impl AsRef<Path>) -> ServerResult<Self> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(ServerError::config("config path is empty"));
        }

        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let cfg = Config::default();
                cfg.save(path)?;
                return Ok(cfg);
            }
            Err(e) => return Err(e.into()),
        };

        let mut cfg: Config = serde_yaml::from_slice(&data)
            .map_err(|e| ServerError::config(format!("invalid YAML: {e}")))?;
        cfg.normalize();
        Ok(cfg)
    }

    /// Writes the configuration atomically with mode 0600.
    pub fn save(&self, path: impl AsRef<Path>) -> ServerResult<()> {
        let path = path.as_ref();
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;
        set_mode(dir, 0o700)?;

        let mut cfg = self.clone();
        cfg.normalize();
        let data = serde_yaml::to_string(&cfg)
            .map_err(|e| ServerError::config(format!("failed to encode YAML: {e}")))?;

        let tmp = dir.join(format!(
            ".epdcal-config-{}.tmp",
            std::process::id()
        ));
        std::fs::write(&tmp, data)?;
        set_mode(&tmp, 0o600)?;
        if let Err(e) = std::fs::rename(&tmp, path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

/// Disk cache root for ICS bodies.
pub fn ics_cache_dir(debug: bool) -> PathBuf {
    if debug {
        PathBuf::from("./cache/ics-cache")
    } else {
        PathBuf::from("/var/lib/epdcal/ics-cache")
    }
}

/// Where the last rendered PNG lives.
pub fn preview_path(debug: bool) -> PathBuf {
    if debug {
        PathBuf::from("./cache/preview.png")
    } else {
        PathBuf::from("/var/lib/epdcal/preview.png")
    }
}

//! User settings for bisque-vm.
//!
//! Read from `<config dir>/settings.toml`. Every key is optional:
//!
//! ```toml
//! vm_root = "/Volumes/Fast/vms"   # default: <data dir>/vms
//! stop_timeout_secs = 30
//!
//! [defaults]
//! cpus = 4
//! memory_gib = 8
//! disk_gib = 64
//! ```
//!
//! A missing file yields the defaults. A malformed file is reported with a
//! warning and the defaults are used.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};

pub const SETTINGS_FILE: &str = "settings.toml";

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct Settings {
    pub vm_root: Option<PathBuf>,
    pub stop_timeout_secs: u64,
    pub defaults: InitDefaults,
}

/// Sizes used by `init` when no flag overrides them.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct InitDefaults {
    pub cpus: u32,
    pub memory_gib: u64,
    pub disk_gib: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            vm_root: None,
            stop_timeout_secs: 30,
            defaults: InitDefaults::default(),
        }
    }
}

impl Default for InitDefaults {
    fn default() -> Self {
        Self {
            cpus: 4,
            memory_gib: 8,
            disk_gib: 64,
        }
    }
}

impl Settings {
    /// Load `settings.toml` from `config_dir`, falling back to defaults.
    pub fn load(config_dir: &Path) -> Self {
        let path = config_dir.join(SETTINGS_FILE);
        match std::fs::read_to_string(&path) {
            Ok(content) => Self::from_toml(&content).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "malformed settings; using defaults");
                Self::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no settings file; using defaults");
                Self::default()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable settings; using defaults");
                Self::default()
            }
        }
    }

    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

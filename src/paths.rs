//! Application directory structure for bisque-vm.
//!
//! Follows macOS conventions:
//!
//! - Config:    `~/.config/bisque-vm/`  (human-editable, XDG-style)
//! - Data:      `~/Library/Application Support/com.fullyparsed.bisque-vm/`
//! - VMs:       `<data>/vms/`
//! - Logs:      `~/Library/Logs/bisque-vm/`
//! - Trash:     `~/.Trash/`
//!
//! On non-macOS, falls back to XDG paths.

use std::path::{Path, PathBuf};
use tracing::{debug, info};

const BUNDLE_ID: &str = "com.fullyparsed.bisque-vm";
const APP_NAME: &str = "bisque-vm";

/// All resolved application directory paths.
#[derive(Debug, Clone)]
pub struct AppPaths {
    /// Human-editable config: `~/.config/bisque-vm/`
    pub config: PathBuf,
    /// Machine-managed application data root
    pub data: PathBuf,
    /// Default VM root; one bundle directory per VM
    pub vms: PathBuf,
    /// Where deleted bundles are moved
    pub trash: PathBuf,
    pub logs: PathBuf,
}

impl AppPaths {
    /// Resolve all paths from the user's home directory.
    /// Does not create any directories; call `ensure()` for that.
    pub fn resolve() -> Option<Self> {
        let home = std::env::var("HOME").ok().map(PathBuf::from)?;
        let data = resolve_data_dir(&home);

        Some(Self {
            config: resolve_config_dir(&home),
            vms: data.join("vms"),
            data,
            trash: resolve_trash_dir(&home),
            logs: resolve_log_dir(&home),
        })
    }

    /// Create all directories that don't already exist.
    /// Excludes the VM root from Time Machine on macOS.
    pub fn ensure(&self) -> std::io::Result<()> {
        for dir in [&self.config, &self.data, &self.vms, &self.logs] {
            if !dir.is_dir() {
                std::fs::create_dir_all(dir)?;
                info!("created directory: {}", dir.display());
            } else {
                debug!("directory exists: {}", dir.display());
            }
        }

        #[cfg(target_os = "macos")]
        exclude_from_time_machine(&self.vms);

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Platform-specific path resolution
// ---------------------------------------------------------------------------

fn resolve_config_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".config").join(APP_NAME)
    }
}

#[cfg(target_os = "macos")]
fn resolve_data_dir(home: &Path) -> PathBuf {
    home.join("Library")
        .join("Application Support")
        .join(BUNDLE_ID)
}

#[cfg(not(target_os = "macos"))]
fn resolve_data_dir(home: &Path) -> PathBuf {
    xdg_data_home(home).join(APP_NAME)
}

#[cfg(target_os = "macos")]
fn resolve_log_dir(home: &Path) -> PathBuf {
    home.join("Library").join("Logs").join(APP_NAME)
}

#[cfg(not(target_os = "macos"))]
fn resolve_log_dir(home: &Path) -> PathBuf {
    xdg_data_home(home).join(APP_NAME).join("logs")
}

#[cfg(target_os = "macos")]
fn resolve_trash_dir(home: &Path) -> PathBuf {
    home.join(".Trash")
}

#[cfg(not(target_os = "macos"))]
fn resolve_trash_dir(home: &Path) -> PathBuf {
    xdg_data_home(home).join("Trash").join("files")
}

#[cfg(not(target_os = "macos"))]
fn xdg_data_home(home: &Path) -> PathBuf {
    match std::env::var("XDG_DATA_HOME") {
        Ok(xdg) => PathBuf::from(xdg),
        Err(_) => home.join(".local").join("share"),
    }
}

// ---------------------------------------------------------------------------
// Time Machine exclusion (macOS only)
// ---------------------------------------------------------------------------

#[cfg(target_os = "macos")]
fn exclude_from_time_machine(path: &Path) {
    use std::process::Command;
    use tracing::warn;
    match Command::new("tmutil")
        .args(["addexclusion", &path.to_string_lossy()])
        .output()
    {
        Ok(output) if output.status.success() => {
            debug!("TM-excluded: {}", path.display());
        }
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("tmutil addexclusion failed for {}: {}", path.display(), stderr.trim());
        }
        Err(e) => {
            warn!("failed to run tmutil for {}: {e}", path.display());
        }
    }
}

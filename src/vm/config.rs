//! Persisted VM metadata (`config.json`) and its atomic store.
//!
//! Paths inside a [`StoredConfig`] are kept in canonical form:
//!
//! - disk and identity blobs are **bundle-relative**, so a bundle can be moved
//!   or renamed without rewriting its config;
//! - the restore image and the shared folder are **host-absolute**.
//!
//! [`load`] normalizes whatever is on disk and immediately re-saves when the
//! canonical form differs, so the file converges after the first load that
//! follows a format or path change. [`save`] writes sorted-key JSON to a
//! temporary file in the bundle and renames it over the target.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, VmError};
use crate::vm::bundle::{self, BundleLayout};

/// Current on-disk format version.
pub const CONFIG_VERSION: u32 = 1;

/// Versioned metadata of one VM bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredConfig {
    #[serde(default)]
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub cpus: u32,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
    pub restore_image_path: PathBuf,
    #[serde(default = "default_hardware_model_path")]
    pub hardware_model_path: PathBuf,
    #[serde(default = "default_machine_identifier_path")]
    pub machine_identifier_path: PathBuf,
    #[serde(default = "default_auxiliary_storage_path")]
    pub auxiliary_storage_path: PathBuf,
    #[serde(default = "default_disk_path")]
    pub disk_path: PathBuf,
    #[serde(default)]
    pub shared_folder_path: Option<PathBuf>,
    #[serde(default)]
    pub shared_folder_read_only: bool,
    #[serde(default)]
    pub installed: bool,
    #[serde(default)]
    pub last_install_build: Option<String>,
    #[serde(default)]
    pub last_install_version: Option<String>,
    #[serde(default)]
    pub last_install_date: Option<DateTime<Utc>>,
}

fn default_hardware_model_path() -> PathBuf {
    PathBuf::from(bundle::HARDWARE_MODEL_FILE)
}

fn default_machine_identifier_path() -> PathBuf {
    PathBuf::from(bundle::MACHINE_IDENTIFIER_FILE)
}

fn default_auxiliary_storage_path() -> PathBuf {
    PathBuf::from(bundle::AUXILIARY_STORAGE_FILE)
}

fn default_disk_path() -> PathBuf {
    PathBuf::from(bundle::DISK_FILE)
}

impl StoredConfig {
    /// Fresh, not-yet-installed config for a bundle created now.
    pub fn new(cpus: u32, memory_bytes: u64, disk_bytes: u64, restore_image: &Path) -> Self {
        let now = Utc::now();
        Self {
            version: CONFIG_VERSION,
            created_at: now,
            modified_at: now,
            cpus,
            memory_bytes,
            disk_bytes,
            restore_image_path: restore_image.to_path_buf(),
            hardware_model_path: default_hardware_model_path(),
            machine_identifier_path: default_machine_identifier_path(),
            auxiliary_storage_path: default_auxiliary_storage_path(),
            disk_path: default_disk_path(),
            shared_folder_path: None,
            shared_folder_read_only: false,
            installed: false,
            last_install_build: None,
            last_install_version: None,
            last_install_date: None,
        }
    }

    /// Canonical form of this config for the bundle at `layout`.
    ///
    /// Idempotent: `c.normalized(l).normalized(l) == c.normalized(l)`.
    pub fn normalized(&self, layout: &BundleLayout) -> Self {
        let root = layout.root();
        Self {
            version: self.version.max(CONFIG_VERSION),
            restore_image_path: host_absolute(&self.restore_image_path, root),
            hardware_model_path: bundle_relative(&self.hardware_model_path, root),
            machine_identifier_path: bundle_relative(&self.machine_identifier_path, root),
            auxiliary_storage_path: bundle_relative(&self.auxiliary_storage_path, root),
            disk_path: bundle_relative(&self.disk_path, root),
            shared_folder_path: self
                .shared_folder_path
                .as_deref()
                .map(|p| host_absolute(p, root)),
            ..self.clone()
        }
    }

    /// Host path of a bundle-relative artifact path stored in this config.
    pub fn resolve(&self, layout: &BundleLayout, stored: &Path) -> PathBuf {
        if stored.is_absolute() {
            stored.to_path_buf()
        } else {
            layout.root().join(stored)
        }
    }

    /// Record a completed installation.
    pub fn mark_installed(&mut self, build: Option<String>, version: Option<String>) {
        self.installed = true;
        self.last_install_build = build;
        self.last_install_version = version;
        self.last_install_date = Some(Utc::now());
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Read, normalize and (when needed) re-save the bundle's config.
pub fn load(layout: &BundleLayout) -> Result<StoredConfig> {
    let path = layout.config_path();
    let bytes = match std::fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(VmError::NotFound(format!(
                "no VM config at {}",
                path.display()
            )));
        }
        Err(e) => return Err(VmError::io(format!("read {}", path.display()), e)),
    };

    let stored: StoredConfig = serde_json::from_slice(&bytes).map_err(|e| VmError::Decode {
        path: path.clone(),
        message: e.to_string(),
    })?;

    let normalized = stored.normalized(layout);
    if normalized != stored {
        debug!(bundle = %layout.root().display(), "config not in canonical form; re-saving");
        return save(layout, &normalized);
    }
    Ok(stored)
}

/// Persist `config`, returning exactly what was written.
///
/// Stamps `modifiedAt`, re-normalizes paths, and replaces the file
/// atomically so a concurrent reader sees either the old or the new config.
pub fn save(layout: &BundleLayout, config: &StoredConfig) -> Result<StoredConfig> {
    let mut config = config.normalized(layout);
    config.modified_at = Utc::now();

    let bytes = to_canonical_json(&config)?;
    write_atomically(&layout.config_path(), &bytes)?;
    debug!(bundle = %layout.root().display(), "config saved");
    Ok(config)
}

/// Pretty JSON with object keys in sorted order.
fn to_canonical_json(config: &StoredConfig) -> Result<Vec<u8>> {
    let encode_err = |e: serde_json::Error| VmError::Validation(format!("encode config: {e}"));

    let value = serde_json::to_value(config).map_err(encode_err)?;
    let sorted: BTreeMap<String, serde_json::Value> = match value {
        serde_json::Value::Object(map) => map.into_iter().collect(),
        other => {
            return Err(VmError::Validation(format!(
                "config encoded as non-object: {other}"
            )));
        }
    };
    let mut bytes = serde_json::to_vec_pretty(&sorted).map_err(encode_err)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Write `bytes` to a sibling temp file, fsync it, then rename over `path`.
pub(crate) fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| VmError::io(format!("create temp file in {}", dir.display()), e))?;
    tmp.write_all(bytes)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| VmError::io(format!("write {}", tmp.path().display()), e))?;
    tmp.persist(path)
        .map_err(|e| VmError::io(format!("replace {}", path.display()), e.error))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Path normalization
// ---------------------------------------------------------------------------

/// Store `path` relative to the bundle root.
///
/// Absolute paths inside the bundle lose the root prefix. Absolute paths
/// elsewhere (a bundle that was moved) and relative paths escaping the bundle
/// are reduced to their file name, since every artifact lives at the top of
/// the bundle.
fn bundle_relative(path: &Path, root: &Path) -> PathBuf {
    let clean = lexical_clean(path);
    if clean.is_absolute() {
        if let Ok(rel) = clean.strip_prefix(lexical_clean(root)) {
            if !rel.as_os_str().is_empty() {
                return rel.to_path_buf();
            }
        }
        return file_name_or(&clean);
    }
    if clean.components().any(|c| matches!(c, Component::ParentDir)) {
        return file_name_or(&clean);
    }
    clean
}

/// Store `path` as a clean absolute host path, expanding `~/` and resolving
/// relative paths against the bundle root.
fn host_absolute(path: &Path, root: &Path) -> PathBuf {
    if path.as_os_str().is_empty() {
        return PathBuf::new();
    }
    let expanded = match path.strip_prefix("~") {
        Ok(rest) => match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    };
    let absolute = if expanded.is_absolute() {
        expanded
    } else {
        root.join(expanded)
    };
    lexical_clean(&absolute)
}

fn file_name_or(path: &Path) -> PathBuf {
    path.file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| path.to_path_buf())
}

/// Remove `.` components and fold `..` without touching the filesystem.
fn lexical_clean(path: &Path) -> PathBuf {
    let mut out: Vec<Component<'_>> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.last() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(component),
            },
            other => out.push(other),
        }
    }
    if out.is_empty() {
        return PathBuf::from(".");
    }
    out.iter().collect()
}

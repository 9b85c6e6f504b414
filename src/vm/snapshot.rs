//! Coarse-grained snapshots of a bundle's persisted files.
//!
//! A snapshot is a directory under `snapshots/` holding verbatim copies of
//! the five artifacts. Snapshots are never modified after creation.
//!
//! Revert protocol:
//!
//! ```text
//! 1. mkdir <bundle>/.revert-backup-<timestamp>
//! 2. per artifact: copy live → backup (if present), then snapshot → live
//! 3. rm -r backup once every artifact is restored
//! ```
//!
//! A failure in step 2 leaves the backup on disk (its path is named in the
//! error) so the pre-revert state can be restored by hand. There is no
//! automatic rollback.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::error::{Result, VmError};
use crate::vm::bundle::{Artifact, BundleLayout};
use crate::vm::lock;

const BACKUP_PREFIX: &str = ".revert-backup-";

/// Summary of one snapshot on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub name: String,
    pub created_at: DateTime<Utc>,
    /// Total size of the captured files.
    pub size_bytes: u64,
}

/// Snapshot names become directory names.
pub fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(VmError::Validation("snapshot name must not be empty".into()));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(VmError::Validation(format!(
            "snapshot name {name:?} must not contain path separators"
        )));
    }
    if name.starts_with('.') {
        return Err(VmError::Validation(format!(
            "snapshot name {name:?} must not start with '.'"
        )));
    }
    Ok(())
}

/// Capture the bundle's artifacts as snapshot `name`.
///
/// Every precondition is checked before the snapshot directory is created;
/// a copy failure removes the partial snapshot.
pub fn create(layout: &BundleLayout, name: &str) -> Result<SnapshotInfo> {
    validate_name(name)?;
    if !layout.exists() {
        return Err(VmError::NotFound(format!(
            "no VM bundle at {}",
            layout.root().display()
        )));
    }
    lock::ensure_not_running(layout)?;

    let dir = layout.snapshot_dir(name);
    if dir.exists() {
        return Err(VmError::Conflict(format!("snapshot {name:?} already exists")));
    }
    for artifact in Artifact::ALL {
        let live = layout.artifact_path(artifact);
        if !live.is_file() {
            return Err(VmError::NotFound(format!(
                "bundle artifact missing: {}",
                live.display()
            )));
        }
    }

    let snapshots = layout.snapshots_dir();
    std::fs::create_dir_all(&snapshots)
        .map_err(|e| VmError::io(format!("create {}", snapshots.display()), e))?;
    std::fs::create_dir(&dir).map_err(|e| VmError::io(format!("create {}", dir.display()), e))?;

    if let Err(e) = copy_artifacts(layout, &dir) {
        if let Err(cleanup) = std::fs::remove_dir_all(&dir) {
            warn!(snapshot = %dir.display(), error = %cleanup, "failed to remove partial snapshot");
        }
        return Err(e);
    }

    info!(bundle = %layout.root().display(), snapshot = name, "snapshot created");
    describe(&dir, name)
}

fn copy_artifacts(layout: &BundleLayout, dir: &Path) -> Result<()> {
    for artifact in Artifact::ALL {
        let src = layout.artifact_path(artifact);
        let dst = dir.join(artifact.file_name());
        std::fs::copy(&src, &dst).map_err(|e| {
            VmError::io(format!("copy {} to {}", src.display(), dst.display()), e)
        })?;
    }
    Ok(())
}

/// Overwrite the live artifacts with snapshot `name`.
pub fn revert(layout: &BundleLayout, name: &str) -> Result<()> {
    validate_name(name)?;
    let dir = layout.snapshot_dir(name);
    if !dir.is_dir() {
        return Err(VmError::NotFound(format!("snapshot {name:?} does not exist")));
    }
    lock::ensure_not_running(layout)?;

    for artifact in Artifact::ALL {
        let captured = dir.join(artifact.file_name());
        if !captured.is_file() {
            return Err(VmError::NotFound(format!(
                "snapshot {name:?} is incomplete: missing {}",
                artifact.file_name()
            )));
        }
    }

    let backup = backup_dir(layout);
    std::fs::create_dir(&backup)
        .map_err(|e| VmError::io(format!("create {}", backup.display()), e))?;

    for artifact in Artifact::ALL {
        if let Err(e) = restore_artifact(layout, &dir, &backup, artifact) {
            warn!(backup = %backup.display(), error = %e, "revert failed; backup left in place");
            return Err(VmError::Io {
                context: format!(
                    "revert to {name:?} failed while restoring {}; pre-revert files are preserved in {}",
                    artifact.file_name(),
                    backup.display()
                ),
                source: match e {
                    VmError::Io { source, .. } => source,
                    other => std::sync::Arc::new(std::io::Error::other(other.to_string())),
                },
            });
        }
    }

    if let Err(e) = std::fs::remove_dir_all(&backup) {
        warn!(backup = %backup.display(), error = %e, "failed to remove revert backup");
    }
    info!(bundle = %layout.root().display(), snapshot = name, "reverted to snapshot");
    Ok(())
}

fn restore_artifact(layout: &BundleLayout, dir: &Path, backup: &Path, artifact: Artifact) -> Result<()> {
    let live = layout.artifact_path(artifact);
    if live.exists() {
        let saved = backup.join(artifact.file_name());
        std::fs::copy(&live, &saved)
            .map_err(|e| VmError::io(format!("back up {}", live.display()), e))?;
    }
    let captured = dir.join(artifact.file_name());
    std::fs::copy(&captured, &live)
        .map_err(|e| VmError::io(format!("restore {}", live.display()), e))?;
    Ok(())
}

fn backup_dir(layout: &BundleLayout) -> PathBuf {
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
    layout.root().join(format!("{BACKUP_PREFIX}{stamp}"))
}

/// Snapshots of the bundle, sorted by name.
pub fn list(layout: &BundleLayout) -> Result<Vec<SnapshotInfo>> {
    let snapshots = layout.snapshots_dir();
    let entries = match std::fs::read_dir(&snapshots) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(VmError::io(format!("read {}", snapshots.display()), e)),
    };

    let mut infos = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| VmError::io(format!("read {}", snapshots.display()), e))?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || !path.is_dir() {
            continue;
        }
        infos.push(describe(&path, &name)?);
    }
    infos.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(infos)
}

/// Remove snapshot `name`.
pub fn delete(layout: &BundleLayout, name: &str) -> Result<()> {
    validate_name(name)?;
    let dir = layout.snapshot_dir(name);
    if !dir.is_dir() {
        return Err(VmError::NotFound(format!("snapshot {name:?} does not exist")));
    }
    lock::ensure_not_running(layout)?;
    std::fs::remove_dir_all(&dir).map_err(|e| VmError::io(format!("remove {}", dir.display()), e))?;
    info!(bundle = %layout.root().display(), snapshot = name, "snapshot deleted");
    Ok(())
}

fn describe(dir: &Path, name: &str) -> Result<SnapshotInfo> {
    let meta = std::fs::metadata(dir).map_err(|e| VmError::io(format!("stat {}", dir.display()), e))?;
    let created = meta
        .created()
        .or_else(|_| meta.modified())
        .map_err(|e| VmError::io(format!("stat {}", dir.display()), e))?;

    let mut size_bytes = 0;
    for artifact in Artifact::ALL {
        if let Ok(m) = std::fs::metadata(dir.join(artifact.file_name())) {
            size_bytes += m.len();
        }
    }

    Ok(SnapshotInfo {
        name: name.to_string(),
        created_at: DateTime::<Utc>::from(created),
        size_bytes,
    })
}

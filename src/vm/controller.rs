//! Public lifecycle operations over the bundles under one VM root.
//!
//! Every mutating operation checks the ownership lock first; the lock is the
//! only thing that decides whether a bundle is running.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::{Result, VmError};
use crate::vm::bundle::BundleLayout;
use crate::vm::config::{self, StoredConfig};
use crate::vm::filesystem;
use crate::vm::hypervisor::{
    Hypervisor, InstallProgressSender, InstallReport, MachineSpec, MinimumRequirements,
};
use crate::vm::lock::{self, OwnerKind, OwnershipLock, StopOutcome};
use crate::vm::session::VmSession;
use crate::vm::snapshot::{self, SnapshotInfo};

pub const GIB: u64 = 1 << 30;

/// Floor used when the engine cannot report requirements (e.g. the restore
/// image has since been moved).
const FALLBACK_REQUIREMENTS: (u32, u64) = (1, GIB);

/// `8589934592` → `"8.0 GiB"`.
pub fn format_gib(bytes: u64) -> String {
    format!("{:.1} GiB", bytes as f64 / GIB as f64)
}

/// Whole GiB to bytes, rejecting overflow.
pub fn gib_to_bytes(gib: u64) -> Result<u64> {
    gib.checked_mul(GIB)
        .ok_or_else(|| VmError::Validation(format!("{gib} GiB is too large")))
}

/// Bundle names become directory names.
pub fn validate_vm_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(VmError::Validation("VM name must not be empty".into()));
    }
    if name.contains('/') || name.contains('\\') || name.starts_with('.') {
        return Err(VmError::Validation(format!(
            "invalid VM name {name:?}: no path separators or leading '.'"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Inputs and reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitOptions {
    pub cpus: u32,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
    pub restore_image: PathBuf,
}

/// Fields to change in a stopped VM's config. `None` leaves a field as is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettingsUpdate {
    pub cpus: Option<u32>,
    pub memory_bytes: Option<u64>,
    /// `Some(None)` removes the shared folder.
    pub shared_folder: Option<Option<PathBuf>>,
    pub shared_folder_read_only: Option<bool>,
}

impl SettingsUpdate {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Whether a bundle is running, as decided by its lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Stopped,
    Running { owner: OwnerKind, pid: u32 },
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Stopped => f.write_str("stopped"),
            RunState::Running { owner, pid } => write!(f, "running ({owner}, pid {pid})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VmStatus {
    pub name: String,
    pub path: PathBuf,
    pub state: RunState,
    pub cpus: u32,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
    pub installed: bool,
    pub last_install_build: Option<String>,
    pub last_install_version: Option<String>,
    pub last_install_date: Option<DateTime<Utc>>,
    pub restore_image: PathBuf,
    pub shared_folder: Option<PathBuf>,
    pub shared_folder_read_only: bool,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl VmStatus {
    fn new(layout: &BundleLayout, config: &StoredConfig, state: RunState) -> Self {
        Self {
            name: layout.name(),
            path: layout.root().to_path_buf(),
            state,
            cpus: config.cpus,
            memory_bytes: config.memory_bytes,
            disk_bytes: config.disk_bytes,
            installed: config.installed,
            last_install_build: config.last_install_build.clone(),
            last_install_version: config.last_install_version.clone(),
            last_install_date: config.last_install_date,
            restore_image: config.restore_image_path.clone(),
            shared_folder: config.shared_folder_path.clone(),
            shared_folder_read_only: config.shared_folder_read_only,
            created_at: config.created_at,
            modified_at: config.modified_at,
        }
    }
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "name:          {}", self.name)?;
        writeln!(f, "path:          {}", self.path.display())?;
        writeln!(f, "state:         {}", self.state)?;
        writeln!(f, "cpus:          {}", self.cpus)?;
        writeln!(f, "memory:        {}", format_gib(self.memory_bytes))?;
        writeln!(f, "disk:          {}", format_gib(self.disk_bytes))?;
        writeln!(f, "installed:     {}", self.installed)?;
        if let Some(version) = &self.last_install_version {
            writeln!(f, "version:       {version}")?;
        }
        if let Some(build) = &self.last_install_build {
            writeln!(f, "build:         {build}")?;
        }
        if let Some(date) = &self.last_install_date {
            writeln!(f, "installed at:  {}", date.to_rfc3339())?;
        }
        writeln!(f, "restore image: {}", self.restore_image.display())?;
        match &self.shared_folder {
            Some(path) => writeln!(
                f,
                "shared folder: {} ({})",
                path.display(),
                if self.shared_folder_read_only { "read-only" } else { "read-write" }
            )?,
            None => writeln!(f, "shared folder: none")?,
        }
        writeln!(f, "created:       {}", self.created_at.to_rfc3339())?;
        write!(f, "modified:      {}", self.modified_at.to_rfc3339())
    }
}

/// One line of `list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmSummary {
    pub name: String,
    pub state: RunState,
    pub cpus: u32,
    pub memory_bytes: u64,
    pub installed: bool,
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

pub struct VmController {
    root: PathBuf,
    trash: PathBuf,
    owner: OwnerKind,
    hypervisor: Arc<dyn Hypervisor>,
}

impl VmController {
    /// Controller for the bundles under `root`, acting as a CLI owner.
    pub fn new(root: impl Into<PathBuf>, trash: impl Into<PathBuf>, hypervisor: Arc<dyn Hypervisor>) -> Self {
        Self {
            root: root.into(),
            trash: trash.into(),
            owner: OwnerKind::Cli,
            hypervisor,
        }
    }

    /// Record sessions started through this controller as `owner`.
    pub fn with_owner(mut self, owner: OwnerKind) -> Self {
        self.owner = owner;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn layout(&self, name: &str) -> Result<BundleLayout> {
        validate_vm_name(name)?;
        Ok(BundleLayout::in_root(&self.root, name))
    }

    fn existing(&self, name: &str) -> Result<BundleLayout> {
        let layout = self.layout(name)?;
        if !layout.exists() {
            return Err(VmError::NotFound(format!("VM {name:?} does not exist")));
        }
        Ok(layout)
    }

    // -----------------------------------------------------------------------
    // init / install
    // -----------------------------------------------------------------------

    /// Create a new, not-yet-installed bundle.
    ///
    /// The bundle is assembled in a hidden staging directory and renamed into
    /// place, so a failure never leaves a partial bundle at the target path.
    pub async fn init(&self, name: &str, options: &InitOptions) -> Result<VmStatus> {
        let layout = self.layout(name)?;
        if layout.exists() {
            return Err(VmError::Conflict(format!(
                "{} already exists",
                layout.root().display()
            )));
        }
        if options.cpus == 0 || options.memory_bytes == 0 || options.disk_bytes == 0 {
            return Err(VmError::Validation(
                "cpus, memory and disk size must all be greater than zero".into(),
            ));
        }
        let restore_image = std::path::absolute(&options.restore_image)
            .map_err(|e| VmError::io(format!("resolve {}", options.restore_image.display()), e))?;
        if !restore_image.is_file() {
            return Err(VmError::Validation(format!(
                "restore image not found: {}",
                restore_image.display()
            )));
        }

        let requirements = self
            .hypervisor
            .minimum_requirements(&restore_image)
            .await
            .map_err(VmError::engine)?;
        check_minimums(&requirements, options.cpus, options.memory_bytes)?;

        std::fs::create_dir_all(&self.root)
            .map_err(|e| VmError::io(format!("create {}", self.root.display()), e))?;
        let staging = BundleLayout::new(
            self.root
                .join(format!(".{name}.init-{}", uuid::Uuid::new_v4().simple())),
        );
        std::fs::create_dir(staging.root())
            .map_err(|e| VmError::io(format!("create {}", staging.root().display()), e))?;

        let populated = self
            .populate(&staging, options, &restore_image, &requirements)
            .and_then(|()| {
                std::fs::rename(staging.root(), layout.root()).map_err(|e| {
                    VmError::io(format!("move bundle into {}", layout.root().display()), e)
                })
            });
        if let Err(e) = populated {
            if let Err(cleanup) = std::fs::remove_dir_all(staging.root()) {
                warn!(staging = %staging.root().display(), error = %cleanup, "failed to remove staged bundle");
            }
            return Err(e);
        }

        info!(bundle = %layout.root().display(), cpus = options.cpus, "VM bundle created");
        self.status(name)
    }

    fn populate(
        &self,
        staging: &BundleLayout,
        options: &InitOptions,
        restore_image: &Path,
        requirements: &MinimumRequirements,
    ) -> Result<()> {
        let write = |path: PathBuf, bytes: &[u8]| {
            std::fs::write(&path, bytes).map_err(|e| VmError::io(format!("write {}", path.display()), e))
        };
        write(staging.hardware_model_path(), &requirements.hardware_model)?;
        write(
            staging.machine_identifier_path(),
            &self.hypervisor.new_machine_identifier(),
        )?;
        self.hypervisor
            .create_auxiliary_storage(&staging.auxiliary_storage_path(), &requirements.hardware_model)
            .map_err(VmError::engine)?;

        let disk = staging.disk_path();
        filesystem::create_disk_image(&disk, options.disk_bytes)
            .map_err(|e| VmError::io(format!("create disk image {}", disk.display()), e))?;

        let config = StoredConfig::new(
            options.cpus,
            options.memory_bytes,
            options.disk_bytes,
            restore_image,
        );
        let config = config::save(staging, &config)?;

        self.hypervisor
            .validate_configuration(&MachineSpec::from_config(staging, &config))
            .map_err(|e| VmError::Validation(format!("{e:#}")))
    }

    /// Install the configured restore image onto the bundle's disk.
    ///
    /// Holds the ownership lock for the whole installation.
    pub async fn install(&self, name: &str, progress: InstallProgressSender) -> Result<InstallReport> {
        let layout = self.existing(name)?;
        let mut stored = config::load(&layout)?;
        if !stored.restore_image_path.is_file() {
            return Err(VmError::NotFound(format!(
                "restore image not found: {}",
                stored.restore_image_path.display()
            )));
        }

        let lock = OwnershipLock::acquire(&layout, self.owner)?;
        let spec = MachineSpec::from_config(&layout, &stored);
        info!(vm = name, engine = self.hypervisor.name(), "installing");

        let outcome = match self
            .hypervisor
            .install(&spec, &stored.restore_image_path, progress)
            .await
        {
            Ok(report) => {
                stored.mark_installed(report.build.clone(), report.version.clone());
                config::save(&layout, &stored).map(|_| report)
            }
            Err(e) => Err(VmError::engine(e)),
        };

        if let Err(e) = lock.release() {
            warn!(vm = name, error = %e, "failed to release lock after install");
        }
        if outcome.is_ok() {
            info!(vm = name, "installation complete");
        }
        outcome
    }

    // -----------------------------------------------------------------------
    // start / stop / status
    // -----------------------------------------------------------------------

    /// Build an unstarted session for an installed bundle.
    pub fn session(&self, name: &str) -> Result<VmSession> {
        let layout = self.existing(name)?;
        let stored = config::load(&layout)?;
        if !stored.installed {
            return Err(VmError::Validation(format!(
                "VM {name:?} is not installed; run `bisque-vm install {name}` first"
            )));
        }

        let spec = MachineSpec::from_config(&layout, &stored);
        self.hypervisor
            .validate_configuration(&spec)
            .map_err(|e| VmError::Validation(format!("{e:#}")))?;

        Ok(VmSession::new(
            Arc::clone(&self.hypervisor),
            layout,
            spec,
            self.owner,
        ))
    }

    /// Start the VM and return its running session.
    pub async fn start(&self, name: &str) -> Result<VmSession> {
        let session = self.session(name)?;
        session.start().await?;
        Ok(session)
    }

    /// Stop the VM owned by another (CLI) process.
    pub async fn stop(&self, name: &str, timeout: Duration) -> Result<StopOutcome> {
        let layout = self.existing(name)?;
        lock::stop_owner(&layout, timeout).await
    }

    /// Config plus live state. Stale locks are cleared on the way.
    pub fn status(&self, name: &str) -> Result<VmStatus> {
        let layout = self.existing(name)?;
        let stored = config::load(&layout)?;
        let state = run_state(&layout)?;
        Ok(VmStatus::new(&layout, &stored, state))
    }

    // -----------------------------------------------------------------------
    // settings / list / delete
    // -----------------------------------------------------------------------

    pub async fn edit_settings(&self, name: &str, update: &SettingsUpdate) -> Result<VmStatus> {
        let layout = self.existing(name)?;
        let mut stored = config::load(&layout)?;
        lock::ensure_not_running(&layout)?;

        if let Some(cpus) = update.cpus {
            stored.cpus = cpus;
        }
        if let Some(memory_bytes) = update.memory_bytes {
            stored.memory_bytes = memory_bytes;
        }
        if let Some(folder) = &update.shared_folder {
            stored.shared_folder_path = match folder {
                Some(path) => {
                    let path = std::path::absolute(path)
                        .map_err(|e| VmError::io(format!("resolve {}", path.display()), e))?;
                    if !path.is_dir() {
                        return Err(VmError::Validation(format!(
                            "shared folder is not a directory: {}",
                            path.display()
                        )));
                    }
                    Some(path)
                }
                None => None,
            };
        }
        if let Some(read_only) = update.shared_folder_read_only {
            stored.shared_folder_read_only = read_only;
        }

        let requirements = match self
            .hypervisor
            .minimum_requirements(&stored.restore_image_path)
            .await
        {
            Ok(requirements) => requirements,
            Err(e) => {
                debug!(vm = name, error = %format!("{e:#}"), "engine requirements unavailable; using floor");
                MinimumRequirements {
                    cpus: FALLBACK_REQUIREMENTS.0,
                    memory_bytes: FALLBACK_REQUIREMENTS.1,
                    hardware_model: Vec::new(),
                }
            }
        };
        check_minimums(&requirements, stored.cpus, stored.memory_bytes)?;

        let saved = config::save(&layout, &stored)?;
        info!(vm = name, cpus = saved.cpus, memory = %format_gib(saved.memory_bytes), "settings updated");
        Ok(VmStatus::new(&layout, &saved, RunState::Stopped))
    }

    /// Every readable bundle under the root, sorted by name.
    pub fn list_vms(&self) -> Result<Vec<VmSummary>> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(VmError::io(format!("read {}", self.root.display()), e)),
        };

        let mut summaries = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !entry.path().is_dir() {
                continue;
            }
            let layout = BundleLayout::new(entry.path());
            let summary = config::load(&layout).and_then(|stored| {
                Ok(VmSummary {
                    name: name.clone(),
                    state: run_state(&layout)?,
                    cpus: stored.cpus,
                    memory_bytes: stored.memory_bytes,
                    installed: stored.installed,
                })
            });
            match summary {
                Ok(summary) => summaries.push(summary),
                Err(e) => warn!(bundle = %entry.path().display(), error = %e, "skipping unreadable bundle"),
            }
        }
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(summaries)
    }

    /// Move the bundle to the trash. Returns where it went.
    pub fn delete(&self, name: &str) -> Result<PathBuf> {
        let layout = self.existing(name)?;
        lock::ensure_not_running(&layout)?;

        std::fs::create_dir_all(&self.trash)
            .map_err(|e| VmError::io(format!("create {}", self.trash.display()), e))?;
        let mut target = self.trash.join(name);
        if target.exists() {
            target = self
                .trash
                .join(format!("{name} {}", Utc::now().format("%Y-%m-%d %H.%M.%S")));
        }
        std::fs::rename(layout.root(), &target).map_err(|e| {
            VmError::io(
                format!("move {} to {}", layout.root().display(), target.display()),
                e,
            )
        })?;
        info!(vm = name, trash = %target.display(), "VM moved to trash");
        Ok(target)
    }

    // -----------------------------------------------------------------------
    // snapshots
    // -----------------------------------------------------------------------

    pub fn create_snapshot(&self, name: &str, snapshot_name: &str) -> Result<SnapshotInfo> {
        snapshot::create(&self.existing(name)?, snapshot_name)
    }

    pub fn revert_snapshot(&self, name: &str, snapshot_name: &str) -> Result<()> {
        snapshot::revert(&self.existing(name)?, snapshot_name)
    }

    pub fn list_snapshots(&self, name: &str) -> Result<Vec<SnapshotInfo>> {
        snapshot::list(&self.existing(name)?)
    }

    pub fn delete_snapshot(&self, name: &str, snapshot_name: &str) -> Result<()> {
        snapshot::delete(&self.existing(name)?, snapshot_name)
    }
}

fn run_state(layout: &BundleLayout) -> Result<RunState> {
    Ok(match lock::probe(layout)? {
        Some(record) => RunState::Running {
            owner: record.owner,
            pid: record.pid,
        },
        None => RunState::Stopped,
    })
}

fn check_minimums(requirements: &MinimumRequirements, cpus: u32, memory_bytes: u64) -> Result<()> {
    if cpus < requirements.cpus {
        return Err(VmError::Validation(format!(
            "at least {} CPUs are required, got {cpus}",
            requirements.cpus
        )));
    }
    if memory_bytes < requirements.memory_bytes {
        return Err(VmError::Validation(format!(
            "at least {} of memory is required, got {}",
            format_gib(requirements.memory_bytes),
            format_gib(memory_bytes)
        )));
    }
    Ok(())
}

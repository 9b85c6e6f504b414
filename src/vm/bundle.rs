//! On-disk layout of a VM bundle.
//!
//! ```text
//! <root>/<name>/
//!     config.json            StoredConfig (see `config`)
//!     disk.img               raw disk image
//!     HardwareModel          platform identity blob
//!     MachineIdentifier      platform identity blob
//!     AuxiliaryStorage       boot storage (EFI variable store)
//!     vm.lock                ownership record while running
//!     snapshots/<snapshot>/  verbatim copies of the five artifacts above
//! ```
//!
//! Resolution is pure: nothing here touches the filesystem except the
//! `exists`/`is_initialized` probes.

use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "config.json";
pub const DISK_FILE: &str = "disk.img";
pub const HARDWARE_MODEL_FILE: &str = "HardwareModel";
pub const MACHINE_IDENTIFIER_FILE: &str = "MachineIdentifier";
pub const AUXILIARY_STORAGE_FILE: &str = "AuxiliaryStorage";
pub const LOCK_FILE: &str = "vm.lock";
/// Pid of the engine helper process, written beside the lock while it runs.
pub const HELPER_PID_FILE: &str = "vm.helper.pid";
pub const SNAPSHOTS_DIR: &str = "snapshots";

/// One of the persisted files captured by a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Artifact {
    Config,
    Disk,
    HardwareModel,
    MachineIdentifier,
    AuxiliaryStorage,
}

impl Artifact {
    /// Every artifact, in the order snapshots copy them.
    pub const ALL: [Artifact; 5] = [
        Artifact::Config,
        Artifact::Disk,
        Artifact::HardwareModel,
        Artifact::MachineIdentifier,
        Artifact::AuxiliaryStorage,
    ];

    pub fn file_name(self) -> &'static str {
        match self {
            Artifact::Config => CONFIG_FILE,
            Artifact::Disk => DISK_FILE,
            Artifact::HardwareModel => HARDWARE_MODEL_FILE,
            Artifact::MachineIdentifier => MACHINE_IDENTIFIER_FILE,
            Artifact::AuxiliaryStorage => AUXILIARY_STORAGE_FILE,
        }
    }
}

/// Resolved paths of a single bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleLayout {
    root: PathBuf,
}

impl BundleLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Layout of the bundle called `name` under the VM root directory.
    pub fn in_root(vm_root: &Path, name: &str) -> Self {
        Self::new(vm_root.join(name))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory name of the bundle, used as the VM's display name.
    pub fn name(&self) -> String {
        self.root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.root.display().to_string())
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    pub fn disk_path(&self) -> PathBuf {
        self.root.join(DISK_FILE)
    }

    pub fn hardware_model_path(&self) -> PathBuf {
        self.root.join(HARDWARE_MODEL_FILE)
    }

    pub fn machine_identifier_path(&self) -> PathBuf {
        self.root.join(MACHINE_IDENTIFIER_FILE)
    }

    pub fn auxiliary_storage_path(&self) -> PathBuf {
        self.root.join(AUXILIARY_STORAGE_FILE)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    pub fn helper_pid_path(&self) -> PathBuf {
        self.root.join(HELPER_PID_FILE)
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.root.join(SNAPSHOTS_DIR)
    }

    pub fn snapshot_dir(&self, snapshot: &str) -> PathBuf {
        self.snapshots_dir().join(snapshot)
    }

    pub fn artifact_path(&self, artifact: Artifact) -> PathBuf {
        self.root.join(artifact.file_name())
    }

    pub fn exists(&self) -> bool {
        self.root.exists()
    }

    /// True when every required artifact is present.
    pub fn is_initialized(&self) -> bool {
        Artifact::ALL
            .iter()
            .all(|a| self.artifact_path(*a).is_file())
    }
}

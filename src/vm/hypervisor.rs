//! Hypervisor engine contract.
//!
//! The engine boots and runs the guest; the core only orchestrates it. Engine
//! failures are plain `anyhow` errors and are passed through to callers
//! verbatim as [`crate::VmError::Engine`].
//!
//! Asynchronous stop notifications flow back through an [`EngineObserver`]
//! registered when the session is constructed, never through callbacks bound
//! to the machine object itself.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::vm::bundle::BundleLayout;
use crate::vm::config::StoredConfig;

/// Minimum resources the engine needs for a given restore image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinimumRequirements {
    pub cpus: u32,
    pub memory_bytes: u64,
    /// Opaque hardware-model blob written into new bundles.
    pub hardware_model: Vec<u8>,
}

/// Installation progress, `0.0..=1.0`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InstallProgress {
    pub fraction_completed: f64,
}

pub type InstallProgressSender = mpsc::UnboundedSender<InstallProgress>;

/// What the engine installed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
    pub build: Option<String>,
    pub version: Option<String>,
}

/// Host folder shared into the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedFolder {
    pub path: PathBuf,
    pub read_only: bool,
}

/// Everything the engine needs to boot one bundle, with host paths resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineSpec {
    pub name: String,
    pub cpus: u32,
    pub memory_bytes: u64,
    pub disk_path: PathBuf,
    pub hardware_model_path: PathBuf,
    pub machine_identifier_path: PathBuf,
    pub auxiliary_storage_path: PathBuf,
    pub shared_folder: Option<SharedFolder>,
}

impl MachineSpec {
    pub fn from_config(layout: &BundleLayout, config: &StoredConfig) -> Self {
        Self {
            name: layout.name(),
            cpus: config.cpus,
            memory_bytes: config.memory_bytes,
            disk_path: config.resolve(layout, &config.disk_path),
            hardware_model_path: config.resolve(layout, &config.hardware_model_path),
            machine_identifier_path: config.resolve(layout, &config.machine_identifier_path),
            auxiliary_storage_path: config.resolve(layout, &config.auxiliary_storage_path),
            shared_folder: config.shared_folder_path.as_ref().map(|path| SharedFolder {
                path: path.clone(),
                read_only: config.shared_folder_read_only,
            }),
        }
    }
}

/// Receives asynchronous notifications about a running machine.
pub trait EngineObserver: Send + Sync {
    /// The guest halted on its own, or a requested stop completed.
    fn on_guest_stopped(&self);

    /// The machine failed while running.
    fn on_error(&self, error: String);
}

/// A machine the engine has started.
#[async_trait]
pub trait MachineInstance: Send + Sync {
    /// Ask the guest to power off. Fails if the machine is not running.
    async fn request_graceful_stop(&self) -> Result<()>;

    /// Stop the machine immediately. Resolves once it is stopped.
    async fn force_stop(&self) -> Result<()>;

    /// Pid of the helper process running the guest, when the engine uses
    /// one. It must lead its own process group.
    fn helper_pid(&self) -> Option<u32> {
        None
    }
}

/// Unified engine abstraction.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    fn name(&self) -> &str;

    async fn minimum_requirements(&self, restore_image: &Path) -> Result<MinimumRequirements>;

    /// Fresh machine-identifier blob for a new bundle.
    fn new_machine_identifier(&self) -> Vec<u8>;

    /// Create the auxiliary boot storage at `path`.
    fn create_auxiliary_storage(&self, path: &Path, hardware_model: &[u8]) -> Result<()>;

    fn validate_configuration(&self, spec: &MachineSpec) -> Result<()>;

    /// Install the restore image onto the machine's disk, reporting progress.
    async fn install(
        &self,
        spec: &MachineSpec,
        restore_image: &Path,
        progress: InstallProgressSender,
    ) -> Result<InstallReport>;

    /// Boot the machine. Resolves once it is running or has failed to start.
    async fn start(
        &self,
        spec: &MachineSpec,
        observer: Arc<dyn EngineObserver>,
    ) -> Result<Arc<dyn MachineInstance>>;
}

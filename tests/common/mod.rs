//! Scripted hypervisor engine for tests that must not boot a real VM.
//!
//! The fake counts every engine call and keeps the observer it was handed so
//! a test can replay guest-initiated callbacks. `force_stop` reports the halt
//! twice through the observer to exercise duplicate-confirmation handling.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;

use bisque_vm::vm::controller::GIB;
use bisque_vm::vm::hypervisor::{
    EngineObserver, Hypervisor, InstallProgress, InstallProgressSender, InstallReport,
    MachineInstance, MachineSpec, MinimumRequirements,
};
use bisque_vm::vm::{InitOptions, VmController};

#[derive(Default)]
pub struct FakeState {
    pub starts: AtomicUsize,
    pub installs: AtomicUsize,
    pub graceful_stops: AtomicUsize,
    pub force_stops: AtomicUsize,
    /// When set, a graceful stop halts the guest right away.
    pub halt_on_graceful: AtomicBool,
    pub start_delay: Mutex<Duration>,
    pub start_failure: Mutex<Option<String>>,
    /// When set, a graceful stop request fails with this message.
    pub graceful_failure: Mutex<Option<String>>,
    /// Helper pid reported by started machines.
    pub helper_pid: Mutex<Option<u32>>,
    pub observer: Mutex<Option<Arc<dyn EngineObserver>>>,
}

impl FakeState {
    pub fn observer(&self) -> Option<Arc<dyn EngineObserver>> {
        self.observer.lock().unwrap().clone()
    }

    fn report_halt(&self) {
        if let Some(observer) = self.observer() {
            observer.on_guest_stopped();
        }
    }
}

#[derive(Default)]
pub struct FakeHypervisor {
    pub state: Arc<FakeState>,
}

impl FakeHypervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
    fn name(&self) -> &str {
        "fake"
    }

    async fn minimum_requirements(&self, restore_image: &Path) -> anyhow::Result<MinimumRequirements> {
        if !restore_image.exists() {
            bail!("restore image not found: {}", restore_image.display());
        }
        Ok(MinimumRequirements {
            cpus: 1,
            memory_bytes: GIB,
            hardware_model: b"fake-hardware".to_vec(),
        })
    }

    fn new_machine_identifier(&self) -> Vec<u8> {
        b"fake-machine".to_vec()
    }

    fn create_auxiliary_storage(&self, path: &Path, _hardware_model: &[u8]) -> anyhow::Result<()> {
        std::fs::write(path, b"fake-aux")?;
        Ok(())
    }

    fn validate_configuration(&self, spec: &MachineSpec) -> anyhow::Result<()> {
        if !spec.disk_path.exists() {
            bail!("disk missing");
        }
        Ok(())
    }

    async fn install(
        &self,
        _spec: &MachineSpec,
        _restore_image: &Path,
        progress: InstallProgressSender,
    ) -> anyhow::Result<InstallReport> {
        self.state.installs.fetch_add(1, Ordering::SeqCst);
        for fraction_completed in [0.0, 0.5, 1.0] {
            let _ = progress.send(InstallProgress { fraction_completed });
        }
        Ok(InstallReport {
            build: Some("F1".into()),
            version: Some("fake-1.0".into()),
        })
    }

    async fn start(
        &self,
        _spec: &MachineSpec,
        observer: Arc<dyn EngineObserver>,
    ) -> anyhow::Result<Arc<dyn MachineInstance>> {
        self.state.starts.fetch_add(1, Ordering::SeqCst);
        let delay = *self.state.start_delay.lock().unwrap();
        tokio::time::sleep(delay).await;

        let failure = self.state.start_failure.lock().unwrap().clone();
        if let Some(msg) = failure {
            bail!(msg);
        }
        *self.state.observer.lock().unwrap() = Some(observer);
        Ok(Arc::new(FakeMachine {
            state: Arc::clone(&self.state),
        }))
    }
}

pub struct FakeMachine {
    state: Arc<FakeState>,
}

#[async_trait]
impl MachineInstance for FakeMachine {
    async fn request_graceful_stop(&self) -> anyhow::Result<()> {
        self.state.graceful_stops.fetch_add(1, Ordering::SeqCst);
        let failure = self.state.graceful_failure.lock().unwrap().clone();
        if let Some(msg) = failure {
            bail!(msg);
        }
        if self.state.halt_on_graceful.load(Ordering::SeqCst) {
            self.state.report_halt();
        }
        Ok(())
    }

    async fn force_stop(&self) -> anyhow::Result<()> {
        self.state.force_stops.fetch_add(1, Ordering::SeqCst);
        self.state.report_halt();
        self.state.report_halt();
        Ok(())
    }

    fn helper_pid(&self) -> Option<u32> {
        *self.state.helper_pid.lock().unwrap()
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub fn controller(tmp: &Path, fake: &Arc<FakeHypervisor>) -> VmController {
    VmController::new(tmp.join("vms"), tmp.join("trash"), fake.clone())
}

pub fn restore_image(tmp: &Path) -> PathBuf {
    let path = tmp.join("fake-1.0.img");
    std::fs::write(&path, b"restore image").unwrap();
    path
}

/// Options with a 1 MiB disk so snapshot copies stay cheap.
pub fn small_options(restore_image: PathBuf) -> InitOptions {
    InitOptions {
        cpus: 2,
        memory_bytes: 2 * GIB,
        disk_bytes: 1 << 20,
        restore_image,
    }
}

/// Create and install `name`, ready to start.
pub async fn installed_vm(controller: &VmController, tmp: &Path, name: &str) {
    controller
        .init(name, &small_options(restore_image(tmp)))
        .await
        .unwrap();
    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    controller.install(name, tx).await.unwrap();
}

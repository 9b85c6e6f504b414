//! Hypervisor engine backed by vfkit (macOS Virtualization.framework wrapper).
//!
//! Booting is gated to macOS. On other hosts the engine still answers
//! requirement and validation queries, but `start` returns an explanatory
//! error so the rest of the codebase can compile unconditionally.
//!
//! ## Architecture
//!
//! ```text
//! VfkitHypervisor::start(MachineSpec)
//!     └─► tokio::process::Command  →  vfkit child process
//!             └─► VfkitMachine { child, rest_port }
//!                     ├─► monitor task       (try_wait every 500 ms → observer)
//!                     ├─► request_graceful_stop  (PUT /vm/state {"state":"Stop"})
//!                     └─► force_stop             (PUT /vm/state {"state":"HardStop"}, else kill)
//! ```
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use async_trait::async_trait;
use tracing::{debug, info};

use crate::vm::filesystem;
use crate::vm::hypervisor::{
    EngineObserver, Hypervisor, InstallProgress, InstallProgressSender, InstallReport,
    MachineInstance, MachineSpec, MinimumRequirements,
};

const MIN_CPUS: u32 = 2;
const MIN_MEMORY_BYTES: u64 = 2 << 30;

/// Engine driving the `vfkit` CLI.
#[derive(Debug, Clone, Default)]
pub struct VfkitHypervisor {
    /// Explicit binary; `None` searches `PATH` and the Homebrew prefixes.
    binary: Option<PathBuf>,
}

impl VfkitHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: Some(binary.into()),
        }
    }

    /// Hardware-model blob written into new bundles.
    fn hardware_model() -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "engine": "vfkit",
            "arch": std::env::consts::ARCH,
        }))
        .unwrap_or_default()
    }
}

#[async_trait]
impl Hypervisor for VfkitHypervisor {
    fn name(&self) -> &str {
        "vfkit"
    }

    async fn minimum_requirements(&self, restore_image: &Path) -> anyhow::Result<MinimumRequirements> {
        if !restore_image.is_file() {
            bail!("restore image not found: {}", restore_image.display());
        }
        Ok(MinimumRequirements {
            cpus: MIN_CPUS,
            memory_bytes: MIN_MEMORY_BYTES,
            hardware_model: Self::hardware_model(),
        })
    }

    fn new_machine_identifier(&self) -> Vec<u8> {
        uuid::Uuid::new_v4().as_bytes().to_vec()
    }

    /// Writes an empty placeholder; vfkit creates the EFI variable store in
    /// its place on first boot.
    fn create_auxiliary_storage(&self, path: &Path, hardware_model: &[u8]) -> anyhow::Result<()> {
        if hardware_model.is_empty() {
            bail!("hardware model is empty");
        }
        std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .with_context(|| format!("create auxiliary storage {}", path.display()))?;
        Ok(())
    }

    fn validate_configuration(&self, spec: &MachineSpec) -> anyhow::Result<()> {
        if spec.cpus < MIN_CPUS {
            bail!("vfkit needs at least {MIN_CPUS} CPUs, got {}", spec.cpus);
        }
        if spec.memory_bytes < MIN_MEMORY_BYTES {
            bail!(
                "vfkit needs at least {} MiB of memory, got {} MiB",
                MIN_MEMORY_BYTES >> 20,
                spec.memory_bytes >> 20
            );
        }
        if !spec.disk_path.is_file() {
            bail!("disk image does not exist: {}", spec.disk_path.display());
        }
        if let Some(folder) = &spec.shared_folder {
            if !folder.path.is_dir() {
                bail!("shared folder is not a directory: {}", folder.path.display());
            }
        }
        Ok(())
    }

    /// Copy a raw bootable image onto the disk. The reported version is the
    /// image's file stem.
    async fn install(
        &self,
        spec: &MachineSpec,
        restore_image: &Path,
        progress: InstallProgressSender,
    ) -> anyhow::Result<InstallReport> {
        let src = restore_image.to_path_buf();
        let dst = spec.disk_path.clone();
        info!(image = %src.display(), disk = %dst.display(), "installing restore image");

        let copied = tokio::task::spawn_blocking(move || {
            filesystem::copy_onto(&src, &dst, |fraction_completed| {
                let _ = progress.send(InstallProgress { fraction_completed });
            })
            .with_context(|| format!("copy {} onto {}", src.display(), dst.display()))
        })
        .await
        .context("install task panicked")??;
        debug!(bytes = copied, "restore image copied");

        Ok(InstallReport {
            build: None,
            version: restore_image
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned()),
        })
    }

    async fn start(
        &self,
        spec: &MachineSpec,
        observer: Arc<dyn EngineObserver>,
    ) -> anyhow::Result<Arc<dyn MachineInstance>> {
        imp::start(self.binary.as_deref(), spec, observer).await
    }
}

// ---------------------------------------------------------------------------
// macOS implementation
// ---------------------------------------------------------------------------

#[cfg(target_os = "macos")]
mod imp {
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use anyhow::{Context, bail};
    use async_trait::async_trait;
    use tokio::process::{Child, Command};
    use tokio::sync::Mutex;
    use tracing::{debug, error, info, warn};

    use crate::vm::filesystem::{VirtioFsShare, build_vfkit_virtiofs_args};
    use crate::vm::hypervisor::{EngineObserver, MachineInstance, MachineSpec};

    const MONITOR_INTERVAL: Duration = Duration::from_millis(500);
    const BOOT_TIMEOUT: Duration = Duration::from_secs(30);
    const FORCE_STOP_TIMEOUT: Duration = Duration::from_secs(10);

    /// A live vfkit child process.
    pub struct VfkitMachine {
        child: Arc<Mutex<Option<Child>>>,
        pid: Option<u32>,
        rest_port: u16,
        client: reqwest::Client,
        stop_requested: Arc<AtomicBool>,
    }

    impl VfkitMachine {
        async fn put_state(&self, state: &str) -> anyhow::Result<()> {
            let url = format!("http://localhost:{}/vm/state", self.rest_port);
            let resp = self
                .client
                .put(&url)
                .json(&serde_json::json!({ "state": state }))
                .timeout(Duration::from_secs(10))
                .send()
                .await
                .with_context(|| format!("PUT {url}"))?;
            if !resp.status().is_success() {
                bail!("vfkit rejected {state}: HTTP {}", resp.status().as_u16());
            }
            info!(port = self.rest_port, state, "VM state change requested");
            Ok(())
        }

        async fn kill(&self) {
            if let Some(running) = self.child.lock().await.as_mut() {
                if let Err(e) = running.kill().await {
                    warn!(error = %e, "failed to kill vfkit");
                }
            }
        }

        async fn has_exited(&self) -> bool {
            let mut guard = self.child.lock().await;
            match guard.as_mut() {
                Some(child) => !matches!(child.try_wait(), Ok(None)),
                None => true,
            }
        }
    }

    #[async_trait]
    impl MachineInstance for VfkitMachine {
        async fn request_graceful_stop(&self) -> anyhow::Result<()> {
            if self.has_exited().await {
                bail!("VM is not running");
            }
            self.stop_requested.store(true, Ordering::SeqCst);
            self.put_state("Stop").await
        }

        async fn force_stop(&self) -> anyhow::Result<()> {
            self.stop_requested.store(true, Ordering::SeqCst);
            if let Err(e) = self.put_state("HardStop").await {
                warn!(port = self.rest_port, error = %format!("{e:#}"), "REST hard stop failed; killing vfkit");
                self.kill().await;
            }

            let deadline = tokio::time::Instant::now() + FORCE_STOP_TIMEOUT;
            while !self.has_exited().await {
                if tokio::time::Instant::now() >= deadline {
                    warn!(port = self.rest_port, "vfkit ignored hard stop; killing");
                    self.kill().await;
                    break;
                }
                tokio::time::sleep(MONITOR_INTERVAL).await;
            }
            Ok(())
        }

        fn helper_pid(&self) -> Option<u32> {
            self.pid
        }
    }

    /// Resolve the path to the `vfkit` binary.
    fn find_vfkit() -> anyhow::Result<PathBuf> {
        if let Ok(path_var) = std::env::var("PATH") {
            for dir in path_var.split(':') {
                let candidate = PathBuf::from(dir).join("vfkit");
                if candidate.exists() {
                    return Ok(candidate);
                }
            }
        }

        // Homebrew on Apple Silicon and Intel.
        for path in ["/opt/homebrew/bin/vfkit", "/usr/local/bin/vfkit"] {
            if Path::new(path).exists() {
                return Ok(PathBuf::from(path));
            }
        }

        bail!(
            "vfkit binary not found. Install it with: brew install vfkit\n\
             Or set PATH to include the directory containing vfkit."
        )
    }

    fn free_loopback_port() -> anyhow::Result<u16> {
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0))
            .context("reserve a loopback port for the vfkit REST endpoint")?;
        Ok(listener.local_addr()?.port())
    }

    /// Build the `vfkit` command for `spec`.
    fn build_vfkit_command(vfkit: &Path, spec: &MachineSpec, rest_port: u16) -> anyhow::Result<Command> {
        let mut cmd = Command::new(vfkit);

        cmd.arg("--cpus").arg(spec.cpus.to_string());
        cmd.arg("--memory").arg((spec.memory_bytes >> 20).to_string());

        // An empty placeholder means the variable store has never been
        // created; vfkit refuses to `create` over an existing file.
        let store = &spec.auxiliary_storage_path;
        let fresh = std::fs::metadata(store).map(|m| m.len() == 0).unwrap_or(true);
        let mut bootloader = format!("efi,variable-store={}", store.display());
        if fresh {
            if store.exists() {
                std::fs::remove_file(store)
                    .with_context(|| format!("remove placeholder {}", store.display()))?;
            }
            bootloader.push_str(",create");
        }
        cmd.arg("--bootloader").arg(bootloader);

        cmd.arg("--device")
            .arg(format!("virtio-blk,path={}", spec.disk_path.display()));
        cmd.arg("--device").arg("virtio-net,nat");
        if let Some(folder) = &spec.shared_folder {
            cmd.args(build_vfkit_virtiofs_args(&VirtioFsShare::from_shared_folder(folder)));
        }
        cmd.arg("--device").arg("virtio-rng");
        cmd.arg("--restful-uri")
            .arg(format!("tcp://localhost:{rest_port}"));

        Ok(cmd)
    }

    /// Wait until the REST endpoint answers, failing early if vfkit exits.
    async fn wait_for_rest(
        client: &reqwest::Client,
        rest_port: u16,
        child: &Mutex<Option<Child>>,
    ) -> anyhow::Result<()> {
        let url = format!("http://localhost:{rest_port}/vm/state");
        let deadline = tokio::time::Instant::now() + BOOT_TIMEOUT;
        loop {
            if let Some(running) = child.lock().await.as_mut() {
                if let Some(status) = running.try_wait()? {
                    bail!("vfkit exited during boot ({status})");
                }
            }
            match client.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let body = resp.text().await.unwrap_or_default();
                    debug!(port = rest_port, state = %body, "vfkit REST endpoint ready");
                    return Ok(());
                }
                Ok(resp) => debug!(port = rest_port, http_status = resp.status().as_u16(), "vfkit not ready"),
                Err(e) => debug!(port = rest_port, error = %e, "vfkit not ready"),
            }
            if tokio::time::Instant::now() >= deadline {
                if let Some(running) = child.lock().await.as_mut() {
                    let _ = running.kill().await;
                }
                bail!("vfkit REST endpoint did not answer within {}s", BOOT_TIMEOUT.as_secs());
            }
            tokio::time::sleep(MONITOR_INTERVAL).await;
        }
    }

    /// Poll the child and report its exit through the observer.
    fn spawn_monitor(
        child: Arc<Mutex<Option<Child>>>,
        stop_requested: Arc<AtomicBool>,
        observer: Arc<dyn EngineObserver>,
    ) {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(MONITOR_INTERVAL).await;
                let mut guard = child.lock().await;
                let Some(running) = guard.as_mut() else {
                    return;
                };
                match running.try_wait() {
                    Ok(Some(status)) => {
                        *guard = None;
                        drop(guard);
                        if status.success() || stop_requested.load(Ordering::SeqCst) {
                            info!(exit_status = ?status, "vfkit exited");
                            observer.on_guest_stopped();
                        } else {
                            error!(exit_status = ?status, "vfkit exited unexpectedly");
                            observer.on_error(format!("vfkit exited unexpectedly ({status})"));
                        }
                        return;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        drop(guard);
                        error!(error = %e, "try_wait failed for vfkit");
                        observer.on_error(format!("lost track of vfkit: {e}"));
                        return;
                    }
                }
            }
        });
    }

    pub async fn start(
        binary: Option<&Path>,
        spec: &MachineSpec,
        observer: Arc<dyn EngineObserver>,
    ) -> anyhow::Result<Arc<dyn MachineInstance>> {
        let vfkit = match binary {
            Some(path) => path.to_path_buf(),
            None => find_vfkit()?,
        };
        info!(path = %vfkit.display(), "found vfkit binary");

        let rest_port = free_loopback_port()?;
        let mut cmd = build_vfkit_command(&vfkit, spec, rest_port)?;

        // Redirect child stdio so it does not pollute our terminal.
        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::null());
        cmd.stderr(std::process::Stdio::null());
        // Own group: terminal Ctrl-C goes to us, not vfkit, and a stop from
        // another process can kill the group if we die first.
        cmd.process_group(0);
        cmd.kill_on_drop(true);

        let child = cmd.spawn().context("failed to spawn vfkit process")?;
        let pid = child.id();
        info!(
            vm = %spec.name,
            pid = ?pid,
            port = rest_port,
            cpus = spec.cpus,
            memory_mb = spec.memory_bytes >> 20,
            "vfkit spawned"
        );

        let child = Arc::new(Mutex::new(Some(child)));
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .context("build REST client")?;
        wait_for_rest(&client, rest_port, &child).await?;

        let stop_requested = Arc::new(AtomicBool::new(false));
        spawn_monitor(Arc::clone(&child), Arc::clone(&stop_requested), observer);

        Ok(Arc::new(VfkitMachine {
            child,
            pid,
            rest_port,
            client,
            stop_requested,
        }))
    }
}

// ---------------------------------------------------------------------------
// Non-macOS stub
// ---------------------------------------------------------------------------

#[cfg(not(target_os = "macos"))]
mod imp {
    use std::path::Path;
    use std::sync::Arc;

    use crate::vm::hypervisor::{EngineObserver, MachineInstance, MachineSpec};

    pub async fn start(
        _binary: Option<&Path>,
        _spec: &MachineSpec,
        _observer: Arc<dyn EngineObserver>,
    ) -> anyhow::Result<Arc<dyn MachineInstance>> {
        Err(anyhow::anyhow!(
            "booting a VM requires macOS (Virtualization.framework via vfkit)"
        ))
    }
}

//! Ownership lock: which process currently runs a bundle.
//!
//! The lock file holds a single line:
//!
//! ```text
//! 4242\n            owned by a CLI process that runs the VM itself
//! embedded:4242\n   owned by a long-running host application
//! ```
//!
//! A record whose pid is no longer alive is stale and treated as absent.
//! Acquisition writes the record to a temp file and hard-links it into place,
//! which fails if a lock file already exists; the liveness probe is the
//! fallback for records left behind by a crashed owner.
//!
//! An embedded owner cannot be stopped from another process: [`stop_owner`]
//! refuses and tells the caller to stop it from the owning application.
//!
//! When the engine runs the guest in a helper process, its pid is kept in
//! `vm.helper.pid` next to the lock. The helper leads its own process group,
//! so an owner killed outright would leave it running; whoever clears that
//! owner's lock kills the helper's group first.

use std::fmt;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Result, VmError};
use crate::vm::bundle::BundleLayout;
use crate::vm::process;

const EMBEDDED_PREFIX: &str = "embedded:";

/// How many times acquisition retries after clearing a stale record.
const ACQUIRE_ATTEMPTS: usize = 3;

/// Interval between liveness probes while waiting for an owner to exit.
const STOP_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Which kind of process holds the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerKind {
    /// A one-shot CLI process running the VM in the foreground.
    Cli,
    /// A VM hosted inside a long-running application.
    Embedded,
}

impl fmt::Display for OwnerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OwnerKind::Cli => f.write_str("cli"),
            OwnerKind::Embedded => f.write_str("embedded"),
        }
    }
}

/// Parsed contents of a lock file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRecord {
    pub owner: OwnerKind,
    pub pid: u32,
}

impl LockRecord {
    /// Record for the calling process.
    pub fn current(owner: OwnerKind) -> Self {
        Self {
            owner,
            pid: process::current_pid(),
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        let line = text.lines().next()?.trim();
        let (owner, pid) = match line.strip_prefix(EMBEDDED_PREFIX) {
            Some(rest) => (OwnerKind::Embedded, rest),
            None => (OwnerKind::Cli, line),
        };
        let pid = pid.trim().parse::<u32>().ok()?;
        Some(Self { owner, pid })
    }

    pub fn encode(&self) -> String {
        match self.owner {
            OwnerKind::Cli => format!("{}\n", self.pid),
            OwnerKind::Embedded => format!("{EMBEDDED_PREFIX}{}\n", self.pid),
        }
    }

    pub fn is_alive(&self) -> bool {
        process::pid_is_alive(self.pid)
    }

    fn already_running(&self) -> VmError {
        VmError::AlreadyRunning {
            owner: self.owner,
            pid: self.pid,
        }
    }
}

/// Read the raw record, live or not. `None` when there is no lock file.
///
/// A file that cannot be parsed yields `None` as well; such a file can only
/// come from a crashed or foreign writer and is cleared by [`probe`].
pub fn read_record(layout: &BundleLayout) -> Result<Option<LockRecord>> {
    let path = layout.lock_path();
    match std::fs::read_to_string(&path) {
        Ok(text) => {
            let record = LockRecord::parse(&text);
            if record.is_none() {
                warn!(lock = %path.display(), "unparseable lock record");
            }
            Ok(record)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(VmError::io(format!("read {}", path.display()), e)),
    }
}

/// The live owner of the bundle, if any. Stale records are removed.
pub fn probe(layout: &BundleLayout) -> Result<Option<LockRecord>> {
    let path = layout.lock_path();
    if !path.exists() {
        return Ok(None);
    }
    match read_record(layout)? {
        Some(record) if record.is_alive() => Ok(Some(record)),
        stale => {
            info!(
                lock = %path.display(),
                pid = ?stale.map(|r| r.pid),
                "removing stale lock"
            );
            reap_orphaned_helper(layout);
            release(layout)?;
            Ok(None)
        }
    }
}

/// Fail with `AlreadyRunning` when a live owner holds the bundle.
pub fn ensure_not_running(layout: &BundleLayout) -> Result<()> {
    match probe(layout)? {
        Some(record) => Err(record.already_running()),
        None => Ok(()),
    }
}

/// Delete the lock file and any helper pid beside it. Succeeds when there
/// is none.
pub fn release(layout: &BundleLayout) -> Result<()> {
    remove_if_present(&layout.helper_pid_path())?;
    let path = layout.lock_path();
    if remove_if_present(&path)? {
        debug!(lock = %path.display(), "lock released");
    }
    Ok(())
}

fn remove_if_present(path: &Path) -> Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(VmError::io(format!("remove {}", path.display()), e)),
    }
}

/// Pid recorded in `vm.helper.pid`, if any.
pub fn read_helper_pid(layout: &BundleLayout) -> Option<u32> {
    let text = std::fs::read_to_string(layout.helper_pid_path()).ok()?;
    text.trim().parse().ok()
}

/// Kill the process group of a helper whose owner is gone.
///
/// Only a pid that still leads its own group is signalled, so a recycled pid
/// belonging to an unrelated process is left alone.
fn reap_orphaned_helper(layout: &BundleLayout) {
    let Some(pid) = read_helper_pid(layout) else {
        return;
    };
    if !process::leads_own_group(pid) {
        debug!(pid, "recorded helper already gone");
        return;
    }
    warn!(pid, "killing engine helper left behind by its owner");
    if let Err(e) = process::force_kill_group(pid) {
        warn!(pid, error = %e, "failed to kill engine helper");
    }
}

/// A lock held by this process.
///
/// Dropping it does not release the lock: a crashed owner must leave a
/// detectable (stale) record behind. Call [`OwnershipLock::release`].
#[derive(Debug)]
pub struct OwnershipLock {
    layout: BundleLayout,
    record: LockRecord,
}

impl OwnershipLock {
    /// Take ownership of the bundle for the calling process.
    pub fn acquire(layout: &BundleLayout, owner: OwnerKind) -> Result<Self> {
        let record = LockRecord::current(owner);
        let path = layout.lock_path();

        for _ in 0..ACQUIRE_ATTEMPTS {
            if try_create(layout, &record)? {
                info!(lock = %path.display(), pid = record.pid, %owner, "lock acquired");
                return Ok(Self {
                    layout: layout.clone(),
                    record,
                });
            }
            // Someone holds the file; bail if they are alive, clear it otherwise.
            if let Some(existing) = probe(layout)? {
                return Err(existing.already_running());
            }
        }

        match read_record(layout)? {
            Some(existing) => Err(existing.already_running()),
            None => Err(VmError::Conflict(format!(
                "could not acquire {}: lock is contended",
                path.display()
            ))),
        }
    }

    pub fn record(&self) -> LockRecord {
        self.record
    }

    /// Remember the engine helper running the guest for this lock.
    pub fn record_helper(&self, pid: u32) -> Result<()> {
        let path = self.layout.helper_pid_path();
        std::fs::write(&path, format!("{pid}\n"))
            .map_err(|e| VmError::io(format!("write {}", path.display()), e))?;
        debug!(pid, path = %path.display(), "engine helper recorded");
        Ok(())
    }

    pub fn release(self) -> Result<()> {
        release(&self.layout)
    }
}

/// Atomically create the lock file with `record`. `false` if it already exists.
fn try_create(layout: &BundleLayout, record: &LockRecord) -> Result<bool> {
    let path = layout.lock_path();
    let mut tmp = tempfile::NamedTempFile::new_in(layout.root())
        .map_err(|e| VmError::io(format!("create temp file in {}", layout.root().display()), e))?;
    tmp.write_all(record.encode().as_bytes())
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| VmError::io(format!("write {}", tmp.path().display()), e))?;

    match std::fs::hard_link(tmp.path(), &path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(VmError::io(format!("create {}", path.display()), e)),
    }
}

// ---------------------------------------------------------------------------
// Out-of-process stop
// ---------------------------------------------------------------------------

/// How [`stop_owner`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// No live owner; any stale record was removed.
    NotRunning,
    /// The owner exited after SIGTERM.
    Stopped,
    /// The owner outlived `timeout` and was sent SIGKILL.
    Killed,
}

/// Stop the CLI process that owns `layout` from another process.
///
/// Sends SIGTERM, probes liveness once per second, and sends SIGKILL once
/// `timeout` has elapsed. The lock file is removed in every outcome except an
/// embedded owner, which is refused with `AlreadyRunning`. A helper the owner
/// left running is killed before the lock is removed.
pub async fn stop_owner(layout: &BundleLayout, timeout: Duration) -> Result<StopOutcome> {
    let Some(record) = read_record(layout)? else {
        reap_orphaned_helper(layout);
        release(layout)?;
        return Ok(StopOutcome::NotRunning);
    };

    if !record.is_alive() {
        info!(pid = record.pid, "owner already exited; clearing stale lock");
        reap_orphaned_helper(layout);
        release(layout)?;
        return Ok(StopOutcome::NotRunning);
    }

    if record.owner == OwnerKind::Embedded {
        return Err(record.already_running());
    }

    info!(pid = record.pid, timeout_secs = timeout.as_secs(), "sending SIGTERM to VM owner");
    if let Err(e) = process::terminate(record.pid) {
        if !record.is_alive() {
            reap_orphaned_helper(layout);
            release(layout)?;
            return Ok(StopOutcome::Stopped);
        }
        return Err(VmError::io(format!("signal pid {}", record.pid), e));
    }

    let deadline = Instant::now() + timeout;
    loop {
        tokio::time::sleep(STOP_POLL_INTERVAL).await;

        if !record.is_alive() {
            info!(pid = record.pid, "VM owner exited");
            reap_orphaned_helper(layout);
            release(layout)?;
            return Ok(StopOutcome::Stopped);
        }

        if Instant::now() >= deadline {
            warn!(pid = record.pid, "VM owner ignored SIGTERM; sending SIGKILL");
            if let Err(e) = process::force_kill(record.pid) {
                warn!(pid = record.pid, error = %e, "SIGKILL failed");
            }
            reap_orphaned_helper(layout);
            release(layout)?;
            return Ok(StopOutcome::Killed);
        }
    }
}

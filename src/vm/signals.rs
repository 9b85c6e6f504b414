//! Routes SIGINT/SIGTERM to a session as stop requests.
//!
//! One listener per process, constructed explicitly by whoever runs the VM in
//! the foreground. The first signal asks the guest to halt; a second one
//! while stopping forces it (see the session state machine).

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::{Result, VmError};
use crate::vm::session::SessionStopper;

static INSTALLED: AtomicBool = AtomicBool::new(false);

pub struct SignalListener {
    task: JoinHandle<()>,
}

impl SignalListener {
    /// Start forwarding SIGINT and SIGTERM to `stopper`.
    ///
    /// Fails with `Conflict` if another listener is alive in this process.
    /// Must be called from within a tokio runtime.
    pub fn install(stopper: SessionStopper) -> Result<Self> {
        if INSTALLED.swap(true, Ordering::SeqCst) {
            return Err(VmError::Conflict(
                "a signal listener is already installed in this process".into(),
            ));
        }

        let streams = signal(SignalKind::interrupt()).and_then(|interrupt| {
            signal(SignalKind::terminate()).map(|terminate| (interrupt, terminate))
        });
        let (mut interrupt, mut terminate) = match streams {
            Ok(streams) => streams,
            Err(e) => {
                INSTALLED.store(false, Ordering::SeqCst);
                return Err(VmError::io("register signal handlers", e));
            }
        };

        let task = tokio::spawn(async move {
            loop {
                let name = tokio::select! {
                    Some(()) = interrupt.recv() => "SIGINT",
                    Some(()) = terminate.recv() => "SIGTERM",
                    else => break,
                };
                info!(signal = name, "stop signal received");
                stopper.request_stop();
            }
            debug!("signal streams closed");
        });

        Ok(Self { task })
    }
}

impl Drop for SignalListener {
    fn drop(&mut self) {
        self.task.abort();
        INSTALLED.store(false, Ordering::SeqCst);
    }
}

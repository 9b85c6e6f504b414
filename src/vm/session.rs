//! Handle to a running (or runnable) VM session.
//!
//! A [`VmSession`] owns nothing but a queue sender and a status receiver. The
//! state machine itself lives on a driver task spawned at construction, which
//! exits once the session reaches `Stopped`. Dropping the handle closes the
//! session: an unstarted one stops at once, a live one begins a graceful stop.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{Result, VmError};
use crate::state_machine::session_sm::{
    self, SessionEvent, SessionEvents, SessionMachine, SessionState, SessionStatus,
};
use crate::vm::bundle::BundleLayout;
use crate::vm::hypervisor::{Hypervisor, MachineSpec};
use crate::vm::lock::OwnerKind;

pub struct VmSession {
    name: String,
    events: SessionEvents,
    status: watch::Receiver<SessionStatus>,
    driver: JoinHandle<()>,
}

impl VmSession {
    /// Build a session for `spec` and spawn its driver.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        hypervisor: Arc<dyn Hypervisor>,
        layout: BundleLayout,
        spec: MachineSpec,
        owner: OwnerKind,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(SessionStatus::initial());
        let rt_handle = tokio::runtime::Handle::current();
        let name = spec.name.clone();

        let storage = SessionMachine::new(
            hypervisor,
            layout,
            spec,
            owner,
            events_tx.clone(),
            status_tx,
            rt_handle.clone(),
        );
        let driver = rt_handle.spawn(session_sm::run(storage, events_rx));

        Self {
            name,
            events: events_tx,
            status: status_rx,
            driver,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquire the ownership lock and boot the VM.
    ///
    /// Resolves once the VM is running, or with the error that stopped it.
    /// A rejected start (lock held by a live owner) leaves the session
    /// startable again. Any other state than `Initialized` is a `Conflict`.
    pub async fn start(&self) -> Result<()> {
        let mut status = self.status.clone();
        let state = status.borrow_and_update().state;
        if state != SessionState::Initialized {
            return Err(VmError::Conflict(format!(
                "session for {} is already {state}",
                self.name
            )));
        }
        self.send(SessionEvent::Start)?;

        loop {
            if status.changed().await.is_err() {
                return Err(VmError::Engine("session ended before the VM started".into()));
            }
            let current = status.borrow_and_update().clone();
            match current.state {
                SessionState::Starting => continue,
                SessionState::Running | SessionState::Stopping => return Ok(()),
                SessionState::Initialized | SessionState::Stopped => {
                    if let Some(e) = current.error {
                        return Err(e);
                    }
                    if current.state == SessionState::Stopped {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Deliver an external stop signal. The first asks the guest to halt;
    /// a second one while stopping forces it.
    pub fn request_stop(&self) {
        let _ = self.events.send(SessionEvent::StopRequested);
    }

    /// Ask to close the window hosting the VM. Returns `true` when closing
    /// may proceed now; otherwise a graceful stop is started and the close
    /// should be retried once the session reports `Stopped`.
    pub fn request_close(&self) -> bool {
        let state = self.state();
        match state {
            SessionState::Stopped => true,
            SessionState::Initialized => {
                let _ = self.events.send(SessionEvent::CloseRequested);
                true
            }
            _ => {
                let _ = self.events.send(SessionEvent::CloseRequested);
                false
            }
        }
    }

    pub fn state(&self) -> SessionState {
        self.status.borrow().state
    }

    /// Error that ended (or rejected) the session, if any.
    pub fn last_error(&self) -> Option<VmError> {
        self.status.borrow().error.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Cloneable handle that can deliver stop signals from elsewhere.
    pub fn stopper(&self) -> SessionStopper {
        SessionStopper {
            events: self.events.clone(),
        }
    }

    /// Wait for the terminal state. Returns the error that ended the session.
    pub async fn wait_until_stopped(&self) -> Result<()> {
        let mut status = self.status.clone();
        loop {
            {
                let current = status.borrow_and_update();
                if current.state == SessionState::Stopped {
                    return current.error.clone().map_or(Ok(()), Err);
                }
            }
            if status.changed().await.is_err() {
                let current = status.borrow();
                if current.state == SessionState::Stopped {
                    return current.error.clone().map_or(Ok(()), Err);
                }
                return Err(VmError::Engine("session driver exited unexpectedly".into()));
            }
        }
    }

    /// True once the driver task has exited.
    pub fn is_finished(&self) -> bool {
        self.driver.is_finished()
    }

    fn send(&self, event: SessionEvent) -> Result<()> {
        self.events
            .send(event)
            .map_err(|_| VmError::Conflict(format!("session for {} has already ended", self.name)))
    }
}

impl Drop for VmSession {
    fn drop(&mut self) {
        if self.state() != SessionState::Stopped {
            debug!(vm = %self.name, "session handle dropped; closing");
            let _ = self.events.send(SessionEvent::CloseRequested);
        }
    }
}

/// Delivers stop signals to a session from another task.
#[derive(Clone)]
pub struct SessionStopper {
    events: SessionEvents,
}

impl SessionStopper {
    #[cfg(test)]
    pub(crate) fn new(events: SessionEvents) -> Self {
        Self { events }
    }

    pub fn request_stop(&self) {
        let _ = self.events.send(SessionEvent::StopRequested);
    }
}

//! VM session state machine.
//!
//! Hierarchy:
//! ```text
//! Initialized ──Start──► Live (superstate)
//!                          ├── Starting  [entry: acquire-then-boot]
//!                          ├── Running   [entry: deliver queued stop]
//!                          └── Stopping  [entry: graceful stop; 2nd stop: force]
//!                                 │
//!             guest halted / engine error / stop confirmed
//!                                 ▼
//!                              Stopped   [entry: release lock exactly once]
//! ```
//!
//! Every event (engine callbacks, stop signals, window close) is delivered
//! through one queue per session and handled on a single driver task, so
//! engine callbacks never race with externally delivered signals.

use std::fmt;
use std::sync::Arc;

use statig::prelude::*;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::error::VmError;
use crate::vm::bundle::BundleLayout;
use crate::vm::hypervisor::{EngineObserver, Hypervisor, MachineInstance, MachineSpec};
use crate::vm::lock::{OwnerKind, OwnershipLock};

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Events dispatched to the session state machine.
pub enum SessionEvent {
    /// Caller asked the session to boot the VM.
    Start,
    /// Engine finished booting.
    EngineStarted(Arc<dyn MachineInstance>),
    /// Engine could not boot the VM.
    EngineStartFailed(String),
    /// Guest halted, or a requested stop completed.
    GuestStopped,
    /// Engine reported a failure while the VM was live.
    EngineFailed(String),
    /// External stop signal (SIGINT/SIGTERM, `stop` from the host app).
    StopRequested,
    /// The window hosting the VM was asked to close.
    CloseRequested,
    /// The engine refused or failed the graceful stop request.
    GracefulStopFailed(String),
    /// A forced stop completed.
    StopConfirmed,
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::Start => "start",
            SessionEvent::EngineStarted(_) => "engine-started",
            SessionEvent::EngineStartFailed(_) => "engine-start-failed",
            SessionEvent::GuestStopped => "guest-stopped",
            SessionEvent::EngineFailed(_) => "engine-failed",
            SessionEvent::StopRequested => "stop-requested",
            SessionEvent::CloseRequested => "close-requested",
            SessionEvent::GracefulStopFailed(_) => "graceful-stop-failed",
            SessionEvent::StopConfirmed => "stop-confirmed",
        }
    }
}

pub type SessionEvents = mpsc::UnboundedSender<SessionEvent>;

// ---------------------------------------------------------------------------
// Published status
// ---------------------------------------------------------------------------

/// Coarse session state as seen by observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initialized,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Initialized => "initialized",
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::Stopping => "stopping",
            SessionState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Latest state plus the error that caused it, if any.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub state: SessionState,
    pub error: Option<VmError>,
}

impl SessionStatus {
    pub fn initial() -> Self {
        Self {
            state: SessionState::Initialized,
            error: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Engine observer
// ---------------------------------------------------------------------------

/// Engine observer that re-posts callbacks onto the session queue.
pub struct QueueObserver {
    events: SessionEvents,
}

impl QueueObserver {
    pub fn new(events: SessionEvents) -> Self {
        Self { events }
    }
}

impl EngineObserver for QueueObserver {
    fn on_guest_stopped(&self) {
        let _ = self.events.send(SessionEvent::GuestStopped);
    }

    fn on_error(&self, error: String) {
        let _ = self.events.send(SessionEvent::EngineFailed(error));
    }
}

// ---------------------------------------------------------------------------
// Shared storage
// ---------------------------------------------------------------------------

/// Shared storage for the session state machine.
///
/// - `lock`: `Some` from a successful start until the terminal transition
/// - `instance`: engine handle; `Some` while the VM is live
/// - `stop_pending`: stop received while starting, delivered on `Running`
/// - `escalated`: a forced stop has been issued
/// - `terminated`: terminal cleanup has run
pub struct SessionMachine {
    hypervisor: Arc<dyn Hypervisor>,
    layout: BundleLayout,
    spec: MachineSpec,
    owner: OwnerKind,
    observer: Arc<dyn EngineObserver>,
    events: SessionEvents,
    status: watch::Sender<SessionStatus>,
    rt_handle: tokio::runtime::Handle,
    lock: Option<OwnershipLock>,
    instance: Option<Arc<dyn MachineInstance>>,
    error: Option<VmError>,
    stop_pending: bool,
    escalated: bool,
    terminated: bool,
}

impl SessionMachine {
    pub fn new(
        hypervisor: Arc<dyn Hypervisor>,
        layout: BundleLayout,
        spec: MachineSpec,
        owner: OwnerKind,
        events: SessionEvents,
        status: watch::Sender<SessionStatus>,
        rt_handle: tokio::runtime::Handle,
    ) -> Self {
        let observer: Arc<dyn EngineObserver> = Arc::new(QueueObserver::new(events.clone()));
        Self {
            hypervisor,
            layout,
            spec,
            owner,
            observer,
            events,
            status,
            rt_handle,
            lock: None,
            instance: None,
            error: None,
            stop_pending: false,
            escalated: false,
            terminated: false,
        }
    }

    /// Map the machine's internal state onto the published one.
    pub fn session_state(state: &State) -> SessionState {
        match state {
            State::Initialized {} => SessionState::Initialized,
            State::Starting {} => SessionState::Starting,
            State::Running {} => SessionState::Running,
            State::Stopping {} => SessionState::Stopping,
            State::Stopped {} => SessionState::Stopped,
        }
    }

    fn publish(&self, state: SessionState) {
        debug!(vm = %self.spec.name, %state, "session state");
        self.status.send_replace(SessionStatus {
            state,
            error: self.error.clone(),
        });
    }

    /// Write the engine helper's pid beside the lock so an out-of-process
    /// stop can reach it if this process dies.
    fn record_helper(&self) {
        let (Some(lock), Some(pid)) = (
            self.lock.as_ref(),
            self.instance.as_ref().and_then(|i| i.helper_pid()),
        ) else {
            return;
        };
        if let Err(e) = lock.record_helper(pid) {
            warn!(vm = %self.spec.name, pid, error = %e, "failed to record engine helper");
        }
    }

    /// Issue the forced stop once; later stop signals are absorbed.
    fn escalate(&mut self) {
        if self.escalated {
            debug!(vm = %self.spec.name, "forced stop already issued");
            return;
        }
        self.escalated = true;

        let Some(instance) = self.instance.clone() else {
            return;
        };
        warn!(vm = %self.spec.name, "second stop signal; forcing stop");
        let events = self.events.clone();
        self.rt_handle.spawn(async move {
            let event = match instance.force_stop().await {
                Ok(()) => SessionEvent::StopConfirmed,
                Err(e) => SessionEvent::EngineFailed(format!("{e:#}")),
            };
            let _ = events.send(event);
        });
    }
}

// ---------------------------------------------------------------------------
// State machine implementation
// ---------------------------------------------------------------------------

#[state_machine(
    initial = "State::initialized()",
    state(derive(Debug, Clone, PartialEq))
)]
impl SessionMachine {
    /// Constructed, not yet started.
    #[state]
    fn initialized(&mut self, event: &SessionEvent) -> Outcome<State> {
        match event {
            SessionEvent::Start => {
                self.error = None;
                // Lock before the engine is involved: a crash after this point
                // still leaves a detectable (stale) record.
                match OwnershipLock::acquire(&self.layout, self.owner) {
                    Ok(lock) => {
                        self.lock = Some(lock);
                        Transition(State::starting())
                    }
                    Err(e) => {
                        warn!(vm = %self.spec.name, error = %e, "start rejected");
                        self.error = Some(e);
                        self.publish(SessionState::Initialized);
                        Handled
                    }
                }
            }
            SessionEvent::StopRequested | SessionEvent::CloseRequested => {
                Transition(State::stopped())
            }
            _ => Handled,
        }
    }

    /// Superstate of every state in which the engine may hold a machine.
    #[superstate]
    fn live(&mut self, event: &SessionEvent) -> Outcome<State> {
        match event {
            SessionEvent::GuestStopped => Transition(State::stopped()),
            SessionEvent::EngineFailed(msg) => {
                self.error = Some(VmError::Engine(msg.clone()));
                Transition(State::stopped())
            }
            _ => Handled,
        }
    }

    /// Waiting for the engine to finish booting.
    #[state(superstate = "live", entry_action = "enter_starting")]
    fn starting(&mut self, event: &SessionEvent) -> Outcome<State> {
        match event {
            SessionEvent::EngineStarted(instance) => {
                self.instance = Some(Arc::clone(instance));
                self.record_helper();
                Transition(State::running())
            }
            SessionEvent::EngineStartFailed(msg) => {
                self.error = Some(VmError::Engine(msg.clone()));
                Transition(State::stopped())
            }
            SessionEvent::StopRequested | SessionEvent::CloseRequested => {
                info!(vm = %self.spec.name, "stop requested while starting; deferring until running");
                self.stop_pending = true;
                Handled
            }
            _ => Super,
        }
    }

    /// VM is up.
    #[state(superstate = "live", entry_action = "enter_running")]
    fn running(&mut self, event: &SessionEvent) -> Outcome<State> {
        match event {
            SessionEvent::StopRequested | SessionEvent::CloseRequested => {
                Transition(State::stopping())
            }
            _ => Super,
        }
    }

    /// Graceful stop requested; waiting for the guest to halt.
    #[state(superstate = "live", entry_action = "enter_stopping")]
    fn stopping(&mut self, event: &SessionEvent) -> Outcome<State> {
        match event {
            SessionEvent::StopRequested => {
                self.escalate();
                Handled
            }
            // Close is deferred until Stopped.
            SessionEvent::CloseRequested => Handled,
            SessionEvent::GracefulStopFailed(msg) => {
                warn!(vm = %self.spec.name, error = %msg, "graceful stop failed; forcing stop");
                self.escalate();
                Handled
            }
            SessionEvent::StopConfirmed => Transition(State::stopped()),
            _ => Super,
        }
    }

    /// Terminal. Duplicate confirmations and late callbacks are ignored.
    #[state(entry_action = "enter_stopped")]
    fn stopped(&mut self, event: &SessionEvent) -> Outcome<State> {
        let _ = event;
        Handled
    }

    // ------------------------------------------------------------------
    // Entry actions
    // ------------------------------------------------------------------

    /// Ask the engine to boot. The result comes back as an event.
    #[action]
    fn enter_starting(&mut self) {
        info!(vm = %self.spec.name, engine = self.hypervisor.name(), "starting VM");
        self.publish(SessionState::Starting);

        let hypervisor = Arc::clone(&self.hypervisor);
        let spec = self.spec.clone();
        let observer = Arc::clone(&self.observer);
        let events = self.events.clone();
        self.rt_handle.spawn(async move {
            let event = match hypervisor.start(&spec, observer).await {
                Ok(instance) => SessionEvent::EngineStarted(instance),
                Err(e) => SessionEvent::EngineStartFailed(format!("{e:#}")),
            };
            let _ = events.send(event);
        });
    }

    #[action]
    fn enter_running(&mut self) {
        info!(vm = %self.spec.name, "VM running");
        self.publish(SessionState::Running);
        if std::mem::take(&mut self.stop_pending) {
            let _ = self.events.send(SessionEvent::StopRequested);
        }
    }

    #[action]
    fn enter_stopping(&mut self) {
        info!(vm = %self.spec.name, "requesting graceful stop");
        self.publish(SessionState::Stopping);

        let Some(instance) = self.instance.clone() else {
            return;
        };
        let events = self.events.clone();
        self.rt_handle.spawn(async move {
            if let Err(e) = instance.request_graceful_stop().await {
                let _ = events.send(SessionEvent::GracefulStopFailed(format!("{e:#}")));
            }
        });
    }

    /// Release the lock and publish the terminal state, once.
    #[action]
    fn enter_stopped(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        self.instance = None;

        if let Some(lock) = self.lock.take() {
            if let Err(e) = lock.release() {
                warn!(vm = %self.spec.name, error = %e, "failed to release lock");
            }
        }

        match &self.error {
            Some(e) => error!(vm = %self.spec.name, error = %e, "VM stopped with error"),
            None => info!(vm = %self.spec.name, "VM stopped"),
        }
        self.publish(SessionState::Stopped);
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Feed queued events into the machine until it reaches `Stopped`.
pub async fn run(storage: SessionMachine, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
    let mut machine = storage.state_machine();
    while let Some(event) = events.recv().await {
        debug!(event = event.name(), "session event");
        machine.handle(&event);
        if SessionMachine::session_state(machine.state()) == SessionState::Stopped {
            break;
        }
    }
}

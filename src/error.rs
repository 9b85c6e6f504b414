//! Error taxonomy for bundle lifecycle operations.
//!
//! Every public operation on a VM bundle reports failure through [`VmError`].
//! The variants map one-to-one onto how a caller should react: correct the
//! input, stop the other owner, create the missing thing, pick another name,
//! inspect the hypervisor, or inspect the filesystem.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use crate::vm::lock::OwnerKind;

/// Result alias used throughout the crate.
pub type Result<T, E = VmError> = std::result::Result<T, E>;

/// Errors surfaced by the bundle lifecycle core.
///
/// `Clone` so a session can publish its terminal error to every observer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum VmError {
    /// Bad size, CPU, name or path argument.
    #[error("{0}")]
    Validation(String),

    /// The bundle is held by a live owner.
    #[error("{}", already_running_message(.owner, .pid))]
    AlreadyRunning { owner: OwnerKind, pid: u32 },

    /// Bundle, snapshot or config missing.
    #[error("{0}")]
    NotFound(String),

    /// Snapshot or bundle name collision.
    #[error("{0}")]
    Conflict(String),

    /// Failure reported by the hypervisor engine, passed through verbatim.
    #[error("{0}")]
    Engine(String),

    /// Filesystem failure while reading, writing or copying artifacts.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: Arc<io::Error>,
    },

    /// A config file exists but could not be parsed.
    #[error("failed to decode {}: {message}", .path.display())]
    Decode { path: PathBuf, message: String },
}

impl VmError {
    /// Wrap an I/O error with a short description of what was being done.
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source: Arc::new(source),
        }
    }

    /// Wrap a hypervisor engine failure, keeping the full cause chain.
    pub fn engine(err: anyhow::Error) -> Self {
        Self::Engine(format!("{err:#}"))
    }

    pub fn is_already_running(&self) -> bool {
        matches!(self, Self::AlreadyRunning { .. })
    }
}

fn already_running_message(owner: &OwnerKind, pid: &u32) -> String {
    match owner {
        OwnerKind::Cli => format!("VM is already running (pid {pid})"),
        OwnerKind::Embedded => format!(
            "VM is already running in an embedded session (pid {pid}); \
             stop it from the application that owns it"
        ),
    }
}

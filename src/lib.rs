//! bisque-vm: lifecycle manager for self-contained VM bundles.
//!
//! Creates, installs, starts, stops and snapshots VMs stored as bundle
//! directories, arbitrating access across processes with a pid lock file.

pub mod error;
pub mod logging;
pub mod paths;
pub mod settings;
pub mod state_machine;
pub mod vm;

pub use error::{Result, VmError};

//! VM bundle lifecycle for bisque-vm.
//!
//! Layered leaves first: bundle layout, config store, ownership lock,
//! session, snapshots, and the controller façade that composes them. The
//! hypervisor engine sits behind the [`hypervisor::Hypervisor`] trait;
//! [`vfkit`] is the concrete engine used by the CLI.

pub mod bundle;
pub mod config;
pub mod controller;
pub mod filesystem;
pub mod hypervisor;
pub mod lock;
pub mod process;
pub mod session;
pub mod signals;
pub mod snapshot;
pub mod vfkit;

pub use controller::{InitOptions, RunState, SettingsUpdate, VmController, VmStatus, VmSummary};
pub use session::{SessionStopper, VmSession};

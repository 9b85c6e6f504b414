//! State machines driving long-lived VM sessions.

pub mod session_sm;

//! Process liveness probing and termination signals.
//!
//! Liveness is a lightweight existence check (`kill(pid, 0)`), not a health
//! check: a pid that exists but belongs to another user still counts as alive.

use std::io;

/// Pid of the calling process.
pub fn current_pid() -> u32 {
    std::process::id()
}

/// Returns `true` when a process with `pid` exists.
pub fn pid_is_alive(pid: u32) -> bool {
    let Some(raw) = to_raw_pid(pid) else {
        return false;
    };
    if unsafe { libc::kill(raw, 0) } == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Ask `pid` to exit (SIGTERM).
pub fn terminate(pid: u32) -> io::Result<()> {
    send(pid, libc::SIGTERM)
}

/// Kill `pid` unconditionally (SIGKILL).
pub fn force_kill(pid: u32) -> io::Result<()> {
    send(pid, libc::SIGKILL)
}

/// Returns `true` when `pid` is alive and leads its own process group.
pub fn leads_own_group(pid: u32) -> bool {
    let Some(raw) = to_raw_pid(pid) else {
        return false;
    };
    unsafe { libc::getpgid(raw) == raw }
}

/// SIGKILL every process in the group led by `pid`.
pub fn force_kill_group(pid: u32) -> io::Result<()> {
    let raw = to_raw_pid(pid)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("invalid pid {pid}")))?;
    if unsafe { libc::kill(-raw, libc::SIGKILL) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

fn send(pid: u32, signal: libc::c_int) -> io::Result<()> {
    let raw = to_raw_pid(pid)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("invalid pid {pid}")))?;
    if unsafe { libc::kill(raw, signal) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

// Pid 0 and negative values address process groups, never a single process.
fn to_raw_pid(pid: u32) -> Option<libc::pid_t> {
    match libc::pid_t::try_from(pid) {
        Ok(raw) if raw > 0 => Some(raw),
        _ => None,
    }
}

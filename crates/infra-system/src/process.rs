// OS process helpers (signal delivery, liveness)

#[cfg(unix)]
use nix::sys::signal::{kill, Signal};
#[cfg(unix)]
use nix::unistd::Pid;

#[cfg(unix)]
fn to_pid(pid: u32) -> Option<Pid> {
    i32::try_from(pid).ok().filter(|p| *p > 0).map(Pid::from_raw)
}

/// Check if a process exists
///
/// A process owned by another user still counts as alive.
pub fn is_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        let Some(pid) = to_pid(pid) else {
            return false;
        };
        // Signal 0 checks if process exists without actually sending a signal
        match kill(pid, None) {
            Ok(()) => true,
            Err(nix::errno::Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

/// Deliver SIGKILL, ignoring processes that are already gone
#[cfg(unix)]
pub fn force_kill(pid: u32) -> Result<(), String> {
    let Some(target) = to_pid(pid) else {
        return Err(format!("invalid pid {}", pid));
    };
    match kill(target, Signal::SIGKILL) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => Err(format!("SIGKILL to {} failed: {}", pid, e)),
    }
}

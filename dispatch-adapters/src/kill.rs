//! Graceful-then-forceful process termination, generalized from the
//! teacher's one-shot `kill_session` helper (`codex-session::store::kill_session`)
//! into a reusable adapter method shared by the PTY and Claude adapters.

use std::time::Duration;
use std::time::Instant;

use sysinfo::Pid;
use sysinfo::System;
use tracing::warn;

/// Sends a graceful termination signal to the process group rooted at `pid`,
/// polls for up to `grace` for it to exit, then force-kills it if it hasn't.
/// `spec.md` §5: "`close(runId)` has a grace period (default 5 s) before
/// force-termination of the adapter process."
pub(crate) async fn terminate_process_group(pid: u32, grace: Duration) {
    #[cfg(unix)]
    {
        let pgid = -(pid as i32);
        // SAFETY: libc::kill with a negative pid targets the process group;
        // it is a plain syscall with no aliasing/lifetime requirements.
        unsafe {
            libc::kill(pgid, libc::SIGTERM);
        }
    }
    #[cfg(not(unix))]
    {
        // No process-group signal concept on non-Unix targets; fall straight
        // through to the liveness poll below, which force-kills by PID.
    }

    let poll_interval = Duration::from_millis(100);
    let start = Instant::now();
    while start.elapsed() < grace {
        if !is_alive(pid) {
            return;
        }
        tokio::time::sleep(poll_interval).await;
    }

    if is_alive(pid) {
        warn!(pid, "process did not exit within grace period, force-killing");
        #[cfg(unix)]
        {
            let pgid = -(pid as i32);
            unsafe {
                libc::kill(pgid, libc::SIGKILL);
            }
        }
        #[cfg(not(unix))]
        {
            let mut system = System::new();
            system.refresh_process(Pid::from_u32(pid));
            if let Some(process) = system.process(Pid::from_u32(pid)) {
                process.kill();
            }
        }
    }
}

fn is_alive(pid: u32) -> bool {
    let mut system = System::new();
    system.refresh_process(Pid::from_u32(pid));
    system.process(Pid::from_u32(pid)).is_some()
}

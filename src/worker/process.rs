// src/worker/process.rs
//
// Process-group spawn and SIGTERM->SIGKILL escalation, spec.md §4.6 step
// 5/7a, §5 cancellation semantics. Grounded in the zed-industries-codex
// pack's `codex-rs/utils/pty/src/process_group.rs` and `core/src/spawn.rs`
// — the teacher crate has no POSIX process-group handling of its own, so
// this is imported from elsewhere in the pack per the "enrich from the
// rest of the pack" instruction.

use log::warn;
use std::time::Duration;
use tokio::process::{Child, Command};

/// Puts the about-to-spawn child into its own process group so a later
/// `killpg` reaches every descendant it forks (ffmpeg/gstreamer spawn
/// helper processes). Unix only; a no-op elsewhere, matching spec.md §9's
/// "platforms without POSIX process groups must document their
/// substitute" — this crate's substitute is "best-effort single-process
/// kill" via `Child::kill`.
#[cfg(unix)]
pub fn set_process_group(cmd: &mut Command) {
    unsafe {
        cmd.pre_exec(|| {
            if libc::setpgid(0, 0) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(not(unix))]
pub fn set_process_group(_cmd: &mut Command) {}

#[cfg(unix)]
fn kill_process_group(pid: i32, signal: i32) {
    unsafe {
        let pgid = libc::getpgid(pid);
        if pgid > 0 {
            libc::killpg(pgid, signal);
        } else {
            libc::kill(pid, signal);
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: i32, _signal: i32) {}

/// SIGTERM the process group, wait up to `grace`, SIGKILL if it hasn't
/// exited. Returns `true` if the process exited gracefully (before the
/// kill), `false` if SIGKILL was needed.
pub async fn terminate_with_grace(child: &mut Child, grace: Duration) -> bool {
    let Some(pid) = child.id() else {
        // Already reaped.
        return true;
    };

    #[cfg(unix)]
    kill_process_group(pid as i32, libc::SIGTERM);
    #[cfg(not(unix))]
    let _ = child.start_kill();

    let graceful = tokio::time::timeout(grace, child.wait()).await.is_ok();
    if !graceful {
        warn!("process {pid} did not exit within {grace:?} of SIGTERM, sending SIGKILL");
        #[cfg(unix)]
        kill_process_group(pid as i32, libc::SIGKILL);
        #[cfg(not(unix))]
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
    graceful
}

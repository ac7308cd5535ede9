//! Signal choreography: consumer suspension and writer critical sections.
//!
//! Insertion wakes sleeping consumers by broadcasting `SIGCONT` to the
//! process group; [`suspend`] is the matching wait. Writable critical
//! sections block every maskable signal so a handler cannot observe (or
//! abandon) a half-mutated index; the fatal hardware signals and `SIGCONT`
//! are never blocked.

use std::mem;

use crate::error::{PqError, Result};

/// Signals that stay deliverable even inside a writable critical section.
const NEVER_BLOCKED: [libc::c_int; 6] = [
    libc::SIGCONT,
    libc::SIGABRT,
    libc::SIGFPE,
    libc::SIGILL,
    libc::SIGSEGV,
    libc::SIGBUS,
];

/// Blocks non-fatal signals for the lifetime of the guard; the saved mask
/// is restored on drop. Held across every exclusive control-region section.
pub(crate) struct SigGuard {
    saved: libc::sigset_t,
}

impl SigGuard {
    pub fn block() -> Result<SigGuard> {
        unsafe {
            let mut mask: libc::sigset_t = mem::zeroed();
            libc::sigfillset(&mut mask);
            for sig in NEVER_BLOCKED {
                libc::sigdelset(&mut mask, sig);
            }
            let mut saved: libc::sigset_t = mem::zeroed();
            if libc::pthread_sigmask(libc::SIG_BLOCK, &mask, &mut saved) != 0 {
                return Err(PqError::System(std::io::Error::last_os_error()));
            }
            Ok(SigGuard { saved })
        }
    }
}

impl Drop for SigGuard {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_sigmask(libc::SIG_SETMASK, &self.saved, std::ptr::null_mut());
        }
    }
}

/// Broadcast `SIGCONT` to the process group so suspended consumers resume.
pub(crate) fn wake_process_group() {
    unsafe {
        // pid 0: every process in the caller's group.
        libc::kill(0, libc::SIGCONT);
    }
}

extern "C" fn noop_handler(_sig: libc::c_int) {}

/// Sleep until `SIGCONT` arrives, the alarm fires (`max_seconds > 0`), or
/// any signal in `extra_signals` is delivered. Returns the unslept whole
/// seconds of the alarm (0 when untimed or fully slept).
///
/// The wake signals are blocked before arming the alarm and atomically
/// unblocked inside `sigsuspend`, so a wake cannot slip between the check
/// and the wait. All signal state is restored before returning.
pub fn suspend_with(max_seconds: u32, extra_signals: &[libc::c_int]) -> u32 {
    let timed = max_seconds > 0;
    unsafe {
        // Block the wake signals so they queue rather than fire early.
        let mut blocked: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut blocked);
        libc::sigaddset(&mut blocked, libc::SIGCONT);
        if timed {
            libc::sigaddset(&mut blocked, libc::SIGALRM);
        }
        let mut saved_mask: libc::sigset_t = mem::zeroed();
        libc::pthread_sigmask(libc::SIG_BLOCK, &blocked, &mut saved_mask);

        // A no-op disposition; delivery need only interrupt sigsuspend.
        let mut action: libc::sigaction = mem::zeroed();
        action.sa_sigaction = noop_handler as libc::sighandler_t;
        libc::sigemptyset(&mut action.sa_mask);
        let mut saved_cont: libc::sigaction = mem::zeroed();
        let mut saved_alrm: libc::sigaction = mem::zeroed();
        libc::sigaction(libc::SIGCONT, &action, &mut saved_cont);
        if timed {
            libc::sigaction(libc::SIGALRM, &action, &mut saved_alrm);
            libc::alarm(max_seconds);
        }

        // Wait with the wake set unblocked, atomically.
        let mut wait_mask = saved_mask;
        libc::sigdelset(&mut wait_mask, libc::SIGCONT);
        if timed {
            libc::sigdelset(&mut wait_mask, libc::SIGALRM);
        }
        for &sig in extra_signals {
            libc::sigdelset(&mut wait_mask, sig);
        }
        libc::sigsuspend(&wait_mask);

        let remaining = if timed { libc::alarm(0) } else { 0 };

        libc::sigaction(libc::SIGCONT, &saved_cont, std::ptr::null_mut());
        if timed {
            libc::sigaction(libc::SIGALRM, &saved_alrm, std::ptr::null_mut());
        }
        libc::pthread_sigmask(libc::SIG_SETMASK, &saved_mask, std::ptr::null_mut());

        remaining
    }
}

/// [`suspend_with`] with no extra wake signals.
pub fn suspend(max_seconds: u32) -> u32 {
    suspend_with(max_seconds, &[])
}

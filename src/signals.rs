use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

static SIGINT_FORWARDING: AtomicBool = AtomicBool::new(false);
static SIGINT_PENDING: AtomicBool = AtomicBool::new(false);

/// Requests an interrupt of whatever the session is currently waiting on.
///
/// Cloned out of the session so another thread can signal it without taking the session
/// lock. A request made before an execution was submitted (see [`InterruptHandle::mark`])
/// is dropped when that execution starts; later ones are kept.
#[derive(Debug, Clone, Default)]
pub struct InterruptHandle {
    requested: Arc<AtomicBool>,
    generation: Arc<AtomicU64>,
}

/// Number of interrupt requests seen when an execution was submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptMark(u64);

impl InterruptHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn mark(&self) -> InterruptMark {
        InterruptMark(self.generation.load(Ordering::SeqCst))
    }

    pub(crate) fn take(&self) -> bool {
        let own = self.requested.swap(false, Ordering::SeqCst);
        let process = take_process_sigint();
        own || process
    }

    pub(crate) fn clear(&self) {
        self.requested.store(false, Ordering::SeqCst);
        let _ = take_process_sigint();
    }

    /// Drops requests made before `mark`. A request that lands after it survives.
    pub(crate) fn clear_before(&self, mark: InterruptMark) {
        if self.generation.load(Ordering::SeqCst) != mark.0 {
            return;
        }
        self.clear();
        // A request racing the store above must not be lost.
        if self.generation.load(Ordering::SeqCst) != mark.0 {
            self.requested.store(true, Ordering::SeqCst);
        }
    }
}

fn take_process_sigint() -> bool {
    SIGINT_FORWARDING.load(Ordering::Relaxed) && SIGINT_PENDING.swap(false, Ordering::SeqCst)
}

#[cfg(target_family = "unix")]
extern "C" fn record_sigint(_signal: libc::c_int) {
    SIGINT_PENDING.store(true, Ordering::SeqCst);
}

/// Turns Ctrl-C on the terminal into an interrupt request instead of killing the kernel.
#[cfg(target_family = "unix")]
pub fn install_sigint_forwarding() -> std::io::Result<()> {
    let rc = unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = record_sigint as extern "C" fn(libc::c_int) as libc::sighandler_t;
        action.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(libc::SIGINT, &action, std::ptr::null_mut())
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    SIGINT_FORWARDING.store(true, Ordering::SeqCst);
    Ok(())
}

#[cfg(not(target_family = "unix"))]
pub fn install_sigint_forwarding() -> std::io::Result<()> {
    Ok(())
}

/// Holds SIGINT at its default disposition until dropped.
///
/// An ignored SIGINT survives `exec`, and a non-interactive shell cannot trap a signal
/// that was ignored on entry, so children must be spawned while this guard is held.
#[cfg(target_family = "unix")]
pub(crate) struct SigintDefaultGuard {
    previous: libc::sigaction,
}

#[cfg(target_family = "unix")]
impl SigintDefaultGuard {
    pub(crate) fn acquire() -> std::io::Result<Self> {
        unsafe {
            let mut default: libc::sigaction = std::mem::zeroed();
            default.sa_sigaction = libc::SIG_DFL;
            libc::sigemptyset(&mut default.sa_mask);
            let mut previous: libc::sigaction = std::mem::zeroed();
            if libc::sigaction(libc::SIGINT, &default, &mut previous) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(Self { previous })
        }
    }
}

#[cfg(target_family = "unix")]
impl Drop for SigintDefaultGuard {
    fn drop(&mut self) {
        unsafe {
            libc::sigaction(libc::SIGINT, &self.previous, std::ptr::null_mut());
        }
    }
}

#[cfg(not(target_family = "unix"))]
pub(crate) struct SigintDefaultGuard;

#[cfg(not(target_family = "unix"))]
impl SigintDefaultGuard {
    pub(crate) fn acquire() -> std::io::Result<Self> {
        Ok(Self)
    }
}

//! Shutdown requests from signals or from other threads.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Set from the SIGINT/SIGTERM handler. A signal handler can only touch
/// statics, so this is process-wide.
static SIGNALLED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_signum: libc::c_int) {
    SIGNALLED.store(true, Ordering::SeqCst);
}

/// Cloneable handle that tells the event loop to stop.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
    watch_signals: bool,
}

impl Shutdown {
    /// A handle that only reacts to `request`.
    #[cfg(test)]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install SIGINT and SIGTERM handlers and return a handle that also
    /// reports those signals.
    ///
    /// `SA_RESTART` is left unset so a blocked queue wait
    /// returns `EINTR` and the loop notices promptly.
    pub fn install_signal_handlers() -> io::Result<Self> {
        for signum in [libc::SIGINT, libc::SIGTERM] {
            // SAFETY: the handler only performs an atomic store.
            unsafe {
                let mut action: libc::sigaction = std::mem::zeroed();
                action.sa_sigaction = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
                libc::sigemptyset(&mut action.sa_mask);
                action.sa_flags = 0;
                if libc::sigaction(signum, &action, std::ptr::null_mut()) != 0 {
                    return Err(io::Error::last_os_error());
                }
            }
        }

        Ok(Self {
            flag: Arc::new(AtomicBool::new(false)),
            watch_signals: true,
        })
    }

    /// Ask the loop to stop.
    #[cfg(test)]
    pub fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || (self.watch_signals && SIGNALLED.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_is_shared_between_clones() {
        let shutdown = Shutdown::new();
        let other = shutdown.clone();
        assert!(!other.is_requested());

        shutdown.request();
        assert!(other.is_requested());
    }

    #[test]
    fn test_plain_handle_ignores_signal_flag() {
        let shutdown = Shutdown::new();
        SIGNALLED.store(true, Ordering::SeqCst);
        assert!(!shutdown.is_requested());
        SIGNALLED.store(false, Ordering::SeqCst);
    }
}

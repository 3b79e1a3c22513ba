use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

static SIGNALLED: AtomicBool = AtomicBool::new(false);

/// Cooperative stop request for the producer and consumer loops.
///
/// Loops only look at the flag between iterations, so a retry chain or an
/// inter-iteration sleep that is already running always finishes.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag {
    raised: Arc<AtomicBool>,
    watch_signals: bool,
}

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// A flag that is also raised by SIGINT or SIGTERM.
    pub fn with_signals() -> std::io::Result<Self> {
        install_handlers()?;
        Ok(Self {
            raised: Arc::new(AtomicBool::new(false)),
            watch_signals: true,
        })
    }

    pub fn raise(&self) {
        self.raised.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
            || (self.watch_signals && SIGNALLED.load(Ordering::SeqCst))
    }
}

#[cfg(unix)]
extern "C" fn on_signal(_signal: libc::c_int) {
    SIGNALLED.store(true, Ordering::SeqCst);
}

#[cfg(unix)]
fn install_handlers() -> std::io::Result<()> {
    for signal in [libc::SIGINT, libc::SIGTERM] {
        let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
        let previous = unsafe { libc::signal(signal, handler) };
        if previous == libc::SIG_ERR {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn install_handlers() -> std::io::Result<()> {
    Ok(())
}

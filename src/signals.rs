/// Signal handling for orderly shutdown.
///
/// Listens for SIGINT and SIGTERM aimed at the watchdog itself. The monitor
/// awaits `recv` as one more branch of its event loop, stops the child, and
/// the process then exits with status 0.
use tokio::signal::unix::{signal, Signal, SignalKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownSignal::Interrupt => write!(f, "SIGINT"),
            ShutdownSignal::Terminate => write!(f, "SIGTERM"),
        }
    }
}

pub struct SignalRelay {
    interrupt: Signal,
    terminate: Signal,
}

impl SignalRelay {
    /// Register the handlers. Must be called from within the runtime.
    pub fn install() -> std::io::Result<SignalRelay> {
        Ok(SignalRelay {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    /// Wait for the next shutdown signal.
    pub async fn recv(&mut self) -> ShutdownSignal {
        tokio::select! {
            _ = self.interrupt.recv() => ShutdownSignal::Interrupt,
            _ = self.terminate.recv() => ShutdownSignal::Terminate,
        }
    }
}

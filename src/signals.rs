//! Shutdown signal handling

use crate::error::Result;
use tokio::signal::unix::{signal, Signal, SignalKind};

/// SIGINT and SIGTERM listeners for the daemon's lifetime.
///
/// Both listeners are registered once and stay registered until dropped, so a
/// signal delivered while a command is still running is reported by the next
/// [`recv`](Self::recv).
pub struct ShutdownSignals {
    interrupt: Signal,
    terminate: Signal,
}

impl ShutdownSignals {
    /// Register the listeners; must be called inside a tokio runtime
    pub fn install() -> Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    /// Wait for the next shutdown signal and return its name
    pub async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_signal_raised_while_busy_is_not_lost() {
        let mut signals = ShutdownSignals::install().unwrap();

        // Delivered while nothing is polling the listeners
        tokio::task::spawn_blocking(|| {
            // SAFETY: raise only sends a signal to this process.
            unsafe { libc::raise(libc::SIGINT) };
        })
        .await
        .unwrap();

        let name = tokio::time::timeout(Duration::from_secs(5), signals.recv())
            .await
            .unwrap();
        assert_eq!(name, "SIGINT");
    }
}

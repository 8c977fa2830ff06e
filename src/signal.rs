//! Shutdown signals for the binary driver.
//!
//! Playback must not die mid-write: the driver waits on [`shutdown`] and
//! routes the result through the session's stop request, which flushes the
//! output buffer and closes the decoder before the process exits.

use std::fmt;

use crate::error::Result;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// Why the process is shutting down.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ShutdownSignal {
    /// Ctrl-C (SIGINT).
    Interrupt,
    /// SIGTERM, Unix only.
    Terminate,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interrupt => f.write_str("Ctrl+C"),
            Self::Terminate => f.write_str("SIGTERM"),
        }
    }
}

/// Completes once the process has been asked to shut down.
///
/// Listens for Ctrl-C everywhere; on Unix, SIGTERM as well. On Windows only
/// Ctrl-C exists, so that is all this resolves to there.
///
/// # Errors
///
/// Returns error if the signal listeners cannot be registered.
pub async fn shutdown() -> Result<ShutdownSignal> {
    #[cfg(unix)]
    {
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => Ok(ShutdownSignal::Interrupt),
            _ = sigterm.recv() => Ok(ShutdownSignal::Terminate),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok(ShutdownSignal::Interrupt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_names() {
        assert_eq!(ShutdownSignal::Interrupt.to_string(), "Ctrl+C");
        assert_eq!(ShutdownSignal::Terminate.to_string(), "SIGTERM");
    }
}

//! Lifecycle events published by every ephemeral server.
//!
//! Session failures never change a server's terminal outcome; this stream is
//! where they stay observable.

use std::net::SocketAddr;

use super::outcome::{ExitReason, ServerOutcome, SessionOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainReason {
    BudgetElapsed,
    Cancelled,
}

impl From<DrainReason> for ExitReason {
    fn from(reason: DrainReason) -> Self {
        match reason {
            DrainReason::BudgetElapsed => ExitReason::BudgetElapsed,
            DrainReason::Cancelled => ExitReason::Cancelled,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ServerEvent {
    Listening {
        server_id: String,
        addr: SocketAddr,
    },
    SessionStarted {
        server_id: String,
        peer: SocketAddr,
    },
    SessionFinished {
        server_id: String,
        outcome: SessionOutcome,
    },
    Draining {
        server_id: String,
        reason: DrainReason,
        outstanding: usize,
    },
    Closed {
        server_id: String,
        outcome: ServerOutcome,
    },
}

impl ServerEvent {
    /// Write the event to the daemon log.
    pub fn log(&self) {
        match self {
            ServerEvent::Listening { server_id, addr } => {
                tracing::info!("[{}] Payment server listening on {}", server_id, addr);
            }
            ServerEvent::SessionStarted { server_id, peer } => {
                tracing::info!("[{}] Connection from {}", server_id, peer);
            }
            ServerEvent::SessionFinished { server_id, outcome } => {
                if let Some(captured) = outcome.captured() {
                    tracing::info!(
                        "[{}] Payment received from {}: card {}",
                        server_id,
                        outcome.peer,
                        captured.masked()
                    );
                } else if let Some(e) = outcome.error() {
                    tracing::warn!("[{}] Session from {} failed: {}", server_id, outcome.peer, e);
                }
            }
            ServerEvent::Draining { server_id, reason, outstanding } => {
                tracing::info!(
                    "[{}] Draining ({:?}), {} session(s) in flight",
                    server_id,
                    reason,
                    outstanding
                );
            }
            ServerEvent::Closed { server_id, outcome } => {
                if outcome.is_success() {
                    tracing::info!(
                        "[{}] Payment server closed ({:?}): {} completed, {} failed",
                        server_id,
                        outcome.exit,
                        outcome.sessions_completed,
                        outcome.sessions_failed
                    );
                } else {
                    tracing::error!("[{}] Payment server aborted: {:?}", server_id, outcome.exit);
                }
            }
        }
    }
}

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::SocketAddr;
use thiserror::Error;

use crate::ssh::script::{CapturedInput, ScriptError};

/// Why a single SSH connection did not complete the payment script.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SessionError {
    #[error("failed to handshake: {0}")]
    Handshake(String),
    #[error("ssh session error: {0}")]
    Protocol(String),
    #[error("client left without opening a session channel")]
    NoChannel,
    #[error(transparent)]
    Script(#[from] ScriptError),
}

/// Result of one accepted connection, consumed once by the lifecycle manager.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub peer: SocketAddr,
    pub result: Result<CapturedInput, SessionError>,
}

impl SessionOutcome {
    pub fn completed(peer: SocketAddr, captured: CapturedInput) -> Self {
        Self {
            peer,
            result: Ok(captured),
        }
    }

    pub fn failed(peer: SocketAddr, error: SessionError) -> Self {
        Self {
            peer,
            result: Err(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn captured(&self) -> Option<&CapturedInput> {
        self.result.as_ref().ok()
    }

    pub fn error(&self) -> Option<&SessionError> {
        self.result.as_ref().err()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", content = "error", rename_all = "snake_case")]
pub enum ExitReason {
    BudgetElapsed,
    Cancelled,
    AcceptFailed(String),
}

/// Terminal outcome of one ephemeral server.
#[derive(Debug, Clone, Serialize)]
pub struct ServerOutcome {
    pub exit: ExitReason,
    pub sessions_completed: usize,
    pub sessions_failed: usize,
    pub finished_at: DateTime<Utc>,
}

impl ServerOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self.exit, ExitReason::AcceptFailed(_))
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ServerState {
    Accepting,
    Draining,
    Terminating,
    Done { outcome: ServerOutcome },
}

impl ServerState {
    pub fn is_done(&self) -> bool {
        matches!(self, ServerState::Done { .. })
    }

    pub fn outcome(&self) -> Option<&ServerOutcome> {
        match self {
            ServerState::Done { outcome } => Some(outcome),
            _ => None,
        }
    }
}

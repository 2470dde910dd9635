// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Unified error types for Druckwerk.

use thiserror::Error;

/// Top-level error type for all Druckwerk operations.
#[derive(Debug, Error)]
pub enum DruckwerkError {
    // -- Discovery errors --
    #[error("printer discovery failed: {0}")]
    Discovery(String),

    #[error("discovery event rejected: {0}")]
    Filtered(String),

    // -- Scheduler / IPP errors --
    #[error("IPP request failed: {0}")]
    IppRequest(String),

    #[error("IPP request timed out: {0}")]
    IppTimeout(String),

    #[error("scheduler refused the request: {0}")]
    SchedulerRefused(String),

    #[error("queue {queue} has active jobs")]
    QueueBusy { queue: String },

    // -- Naming / clustering --
    #[error("no usable local queue name for {0}")]
    NameExhausted(String),

    #[error("queue name {0} collides with an existing entry")]
    NameCollision(String),

    // -- Registry --
    #[error("unknown registry entry {0}")]
    UnknownEntry(u64),

    #[error("invalid state transition: {0}")]
    InvalidTransition(String),

    // -- Configuration --
    #[error("configuration error: {0}")]
    Config(String),

    // -- Persistence --
    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DruckwerkError {
    /// Whether the error is worth retrying after a pause.
    ///
    /// Timeouts and transport-level IPP failures are transient; a well-formed
    /// refusal from the scheduler is not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::IppTimeout(_) => true,
            Self::IppRequest(detail) => {
                let lower = detail.to_ascii_lowercase();
                lower.contains("timed out")
                    || lower.contains("connection refused")
                    || lower.contains("connection reset")
                    || lower.contains("broken pipe")
                    || lower.contains("server-error")
            }
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}

/// Alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, DruckwerkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_transient() {
        let err = DruckwerkError::IppRequest("request timed out after 5s".into());
        assert!(err.is_transient());
        assert!(DruckwerkError::IppTimeout("create queue".into()).is_transient());
    }

    #[test]
    fn refusal_is_not_transient() {
        let err = DruckwerkError::SchedulerRefused("client-error-not-possible".into());
        assert!(!err.is_transient());
    }

    #[test]
    fn connection_refused_is_transient() {
        let err = DruckwerkError::IppRequest("connection refused".into());
        assert!(err.is_transient());
    }
}

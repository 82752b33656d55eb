//! Error categorization for the room cluster.
//!
//! Mirrors the six categories a client-visible or operator-visible failure
//! can fall into. Validation and room-not-found errors are reported to the
//! client and leave the session open; determinism violations are fatal for
//! the affected room only.

use std::fmt;

use thiserror::Error;

/// Categories of errors the gateway and registry can surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Bad client input: unknown type, oversize frame, missing field, chat
    /// too long, malformed room code.
    Validation,
    /// Write arrived at a node with no known leader, or the leader can't be
    /// reached to forward to.
    NotLeader,
    /// RPC timeout or connection refused; Raft treats the peer as down.
    Transport,
    /// `apply` failed — unreachable in practice, treated as a bug.
    DeterminismViolation,
    /// ROOM_JOIN for a code with no locally known room.
    RoomNotFound,
    /// A session's outbound message could not be delivered.
    SessionSendFailure,
}

impl ErrorCategory {
    pub fn label(&self) -> &'static str {
        match self {
            ErrorCategory::Validation => "validation",
            ErrorCategory::NotLeader => "not_leader",
            ErrorCategory::Transport => "transport",
            ErrorCategory::DeterminismViolation => "determinism_violation",
            ErrorCategory::RoomNotFound => "room_not_found",
            ErrorCategory::SessionSendFailure => "session_send_failure",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ErrorCategory::Validation => "Invalid client input",
            ErrorCategory::NotLeader => "No leader available for this room",
            ErrorCategory::Transport => "Inter-node RPC failure",
            ErrorCategory::DeterminismViolation => "Room state machine apply failed",
            ErrorCategory::RoomNotFound => "Room not found",
            ErrorCategory::SessionSendFailure => "Could not deliver message to session",
        }
    }

    pub fn all() -> Vec<ErrorCategory> {
        vec![
            ErrorCategory::Validation,
            ErrorCategory::NotLeader,
            ErrorCategory::Transport,
            ErrorCategory::DeterminismViolation,
            ErrorCategory::RoomNotFound,
            ErrorCategory::SessionSendFailure,
        ]
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Errors surfaced while handling a client frame in the gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("chat text of {len} chars exceeds the 500 char cap")]
    ChatTooLong { len: usize },

    #[error("room code {0:?} is not well-formed (expected six [A-Z0-9] chars)")]
    MalformedRoomCode(String),

    #[error("room {0} not found on this node")]
    RoomNotFound(String),

    #[error("no leader known for room {0}")]
    NoLeader(String),

    #[error("forward to leader of room {room} failed: {reason}")]
    ForwardFailed { room: String, reason: String },

    #[error("failed to deliver message to session {0}")]
    SessionSendFailure(String),
}

impl GatewayError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            GatewayError::UnknownType(_)
            | GatewayError::MissingField(_)
            | GatewayError::ChatTooLong { .. }
            | GatewayError::MalformedRoomCode(_) => ErrorCategory::Validation,
            GatewayError::RoomNotFound(_) => ErrorCategory::RoomNotFound,
            GatewayError::NoLeader(_) | GatewayError::ForwardFailed { .. } => {
                ErrorCategory::NotLeader
            }
            GatewayError::SessionSendFailure(_) => ErrorCategory::SessionSendFailure,
        }
    }
}

/// Inter-node RPC failures, logged and treated as "peer is down" by Raft.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("RPC to {peer} timed out")]
    Timeout { peer: String },

    #[error("connection to {peer} refused or reset: {reason}")]
    ConnectionFailed { peer: String, reason: String },

    #[error("peer {peer} rejected request: {reason}")]
    Rejected { peer: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_map_to_validation_category() {
        assert_eq!(
            GatewayError::UnknownType("X".into()).category(),
            ErrorCategory::Validation
        );
        assert_eq!(
            GatewayError::ChatTooLong { len: 600 }.category(),
            ErrorCategory::Validation
        );
    }

    #[test]
    fn room_not_found_maps_correctly() {
        assert_eq!(
            GatewayError::RoomNotFound("ABC123".into()).category(),
            ErrorCategory::RoomNotFound
        );
    }

    #[test]
    fn no_leader_and_forward_failure_map_to_not_leader() {
        assert_eq!(
            GatewayError::NoLeader("ABC123".into()).category(),
            ErrorCategory::NotLeader
        );
        assert_eq!(
            GatewayError::ForwardFailed {
                room: "ABC123".into(),
                reason: "timeout".into()
            }
            .category(),
            ErrorCategory::NotLeader
        );
    }

    #[test]
    fn all_categories_present() {
        let categories = ErrorCategory::all();
        assert_eq!(categories.len(), 6);
        assert!(categories.contains(&ErrorCategory::DeterminismViolation));
    }

    #[test]
    fn category_labels_are_snake_case() {
        assert_eq!(ErrorCategory::NotLeader.label(), "not_leader");
        assert_eq!(
            ErrorCategory::DeterminismViolation.label(),
            "determinism_violation"
        );
    }
}

//! Streaming session state.

use std::fmt;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Unique identifier for a streaming session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    /// Generate a new random session ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Connection state of a streaming session.
///
/// `Connecting -> Open -> Closing -> Closed`. `Open` is the only state in
/// which frames are accepted. A transport error may jump straight to
/// `Closed` from `Connecting` or `Open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        }
    }

    /// Check whether moving to `next` is a legal transition.
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Open)
                | (Connecting, Closed)
                | (Open, Closing)
                | (Open, Closed)
                | (Closing, Closed)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid session transition from {from} to {to}")]
pub struct TransitionError {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

/// State for one streaming connection.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StreamSession {
    pub session_id: SessionId,
    pub connection_state: ConnectionState,
    /// Sequence number of the most recent inbound frame (0 before any)
    pub last_frame_seq: u64,
    pub frames_accepted: u64,
    pub frames_dropped: u64,
    pub results_sent: u64,
    pub created_at: DateTime<Utc>,
}

impl StreamSession {
    pub fn new() -> Self {
        Self {
            session_id: SessionId::new(),
            connection_state: ConnectionState::Connecting,
            last_frame_seq: 0,
            frames_accepted: 0,
            frames_dropped: 0,
            results_sent: 0,
            created_at: Utc::now(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.connection_state
    }

    pub fn transition(&mut self, next: ConnectionState) -> Result<(), TransitionError> {
        if !self.connection_state.can_transition_to(next) {
            return Err(TransitionError {
                from: self.connection_state,
                to: next,
            });
        }
        self.connection_state = next;
        Ok(())
    }

    /// Whether inbound frames may be accepted.
    pub fn accepts_frames(&self) -> bool {
        self.connection_state == ConnectionState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.connection_state == ConnectionState::Closed
    }

    /// Register an inbound frame and return its sequence number.
    pub fn next_frame_seq(&mut self) -> u64 {
        self.last_frame_seq += 1;
        self.last_frame_seq
    }

    pub fn record_accepted(&mut self) {
        self.frames_accepted += 1;
    }

    pub fn record_dropped(&mut self) {
        self.frames_dropped += 1;
    }

    pub fn record_result_sent(&mut self) {
        self.results_sent += 1;
    }
}

impl Default for StreamSession {
    fn default() -> Self {
        Self::new()
    }
}

//! Error types for coverage-core operations.
//!
//! None of these are fatal to a target's worker. Each carries a stable
//! machine code so hosts can surface it without matching on messages.

use crate::session::StateName;

// ═══════════════════════════════════════════════════════════════════════════════
// Session Errors
// ═══════════════════════════════════════════════════════════════════════════════

/// A transition that could not be applied to a session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("{event} is not accepted while the session is {state}")]
    WrongState {
        event: &'static str,
        state: StateName,
    },

    /// A re-initialization won a race; the loser's work is gone.
    #[error("{discarded} was discarded by a concurrent INIT")]
    TransitionConflict { discarded: &'static str },

    #[error(transparent)]
    Probe(#[from] ProbeError),
}

impl SessionError {
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::WrongState { .. } => "wrong_state",
            SessionError::TransitionConflict { .. } => "transition_conflict",
            SessionError::Probe(err) => err.code(),
        }
    }
}

/// A probe record the aggregator refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProbeError {
    #[error("probe {id} carries {actual} flags but was first submitted with {expected}")]
    LengthMismatch {
        id: u64,
        expected: usize,
        actual: usize,
    },

    #[error("probe buffer is full ({capacity} entries); collection cancelled for this cycle")]
    CapacityExceeded { capacity: usize },
}

impl ProbeError {
    pub fn code(&self) -> &'static str {
        match self {
            ProbeError::LengthMismatch { .. } => "probe_length_mismatch",
            ProbeError::CapacityExceeded { .. } => "probe_capacity_exceeded",
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Collaborator Errors
// ═══════════════════════════════════════════════════════════════════════════════

/// Structural analysis could not process one class.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AnalysisError {
    #[error("class {class} could not be read: {reason}")]
    Unreadable { class: String, reason: String },

    #[error("class {class} declares {expected} probes but execution data has {actual}")]
    ProbeCountMismatch {
        class: String,
        expected: usize,
        actual: usize,
    },
}

impl AnalysisError {
    pub fn code(&self) -> &'static str {
        "analysis_failure"
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("scope {key} could not be stored: {reason}")]
    Failed { key: String, reason: String },
}

// ═══════════════════════════════════════════════════════════════════════════════
// Engine Errors
// ═══════════════════════════════════════════════════════════════════════════════

/// Errors reported back to whoever handed an event to the engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("worker for target {0} is unavailable")]
    TargetUnavailable(String),

    #[error("{0} handler panicked; the event was dropped")]
    Panicked(&'static str),
}

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::MalformedPayload(_) => "malformed_payload",
            EngineError::Session(err) => err.code(),
            EngineError::TargetUnavailable(_) => "target_unavailable",
            EngineError::Panicked(_) => "internal_error",
        }
    }
}

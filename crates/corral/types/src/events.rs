//! Event types for Corral observability
//!
//! Broker and supervisor publish every state change on a shared broadcast
//! channel. Crashes and intended shutdowns are separate events.

use crate::ids::{AssignmentId, ProcessId};
use crate::resource::UnitId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Envelope wrapping all Corral events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorralEventEnvelope {
    pub id: Uuid,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub source: EventSource,
    pub severity: EventSeverity,
    pub event: CorralEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventSource {
    Broker,
    Supervisor,
    Enforcement,
    Daemon,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

/// How a client's supervision ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitKind {
    /// Client deregistered itself
    Graceful,
    /// Heartbeats stopped or the process vanished
    Lost,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CorralEvent {
    // ═══════════════════════════════════════════════════════════════════
    // CLIENT EVENTS
    // ═══════════════════════════════════════════════════════════════════
    ClientRegistered {
        process_id: ProcessId,
    },

    ClientRejected {
        process_id: ProcessId,
        reason: String,
    },

    ClientDegraded {
        process_id: ProcessId,
        silent_for_ms: i64,
    },

    ClientRecovered {
        process_id: ProcessId,
    },

    ClientLost {
        process_id: ProcessId,
        reason: String,
    },

    ClientExited {
        process_id: ProcessId,
        kind: ExitKind,
        revoked: usize,
    },

    // ═══════════════════════════════════════════════════════════════════
    // ASSIGNMENT EVENTS
    // ═══════════════════════════════════════════════════════════════════
    AssignmentCommitted {
        assignment_id: AssignmentId,
        process_id: ProcessId,
        units: Vec<UnitId>,
    },

    AssignmentActivated {
        assignment_id: AssignmentId,
        process_id: ProcessId,
    },

    AssignmentRolledBack {
        assignment_id: AssignmentId,
        process_id: ProcessId,
        reason: String,
    },

    AssignmentReleased {
        assignment_id: AssignmentId,
        process_id: ProcessId,
    },

    AssignmentRevoked {
        assignment_id: AssignmentId,
        process_id: ProcessId,
        reason: String,
    },

    ClaimConflict {
        process_id: ProcessId,
        attempt: u32,
    },

    RevertFailed {
        assignment_id: AssignmentId,
        process_id: ProcessId,
        reason: String,
    },

    // ═══════════════════════════════════════════════════════════════════
    // FATAL
    // ═══════════════════════════════════════════════════════════════════
    /// The manager can no longer uphold its invariants and must stop
    FatalCondition {
        reason: String,
    },
}

impl CorralEventEnvelope {
    pub fn new(event: CorralEvent, source: EventSource) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: chrono::Utc::now(),
            source,
            severity: Self::infer_severity(&event),
            event,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self.event, CorralEvent::FatalCondition { .. })
    }

    fn infer_severity(event: &CorralEvent) -> EventSeverity {
        match event {
            CorralEvent::FatalCondition { .. } => EventSeverity::Critical,
            CorralEvent::ClientLost { .. } | CorralEvent::AssignmentRolledBack { .. } => {
                EventSeverity::Error
            }
            CorralEvent::ClientDegraded { .. }
            | CorralEvent::ClientRejected { .. }
            | CorralEvent::AssignmentRevoked { .. }
            | CorralEvent::RevertFailed { .. } => EventSeverity::Warning,
            CorralEvent::ClaimConflict { .. } => EventSeverity::Debug,
            _ => EventSeverity::Info,
        }
    }
}

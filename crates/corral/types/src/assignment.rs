//! Assignments bind resource units to a client process
//!
//! State machine:
//!
//! ```text
//!   PENDING ──apply ok──▶ ACTIVE ──release──▶ RELEASED
//!      │                     └────revoke───▶ REVOKED
//!      └──apply failed / cancelled──▶ RELEASED
//! ```
//!
//! RELEASED and REVOKED are terminal.

use crate::error::TransitionError;
use crate::ids::{AssignmentId, ProcessId};
use crate::resource::UnitId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Lifecycle status of an assignment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssignmentStatus {
    /// Committed in the store, host directives not yet confirmed
    Pending,
    /// Enforced on the host
    Active,
    /// Freed by the owner, or rolled back before activation
    Released,
    /// Forcibly freed (client loss, deregistration, administrative action)
    Revoked,
}

impl AssignmentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AssignmentStatus::Released | AssignmentStatus::Revoked)
    }

    pub fn can_transition_to(&self, next: AssignmentStatus) -> bool {
        use AssignmentStatus::*;
        matches!(
            (self, next),
            (Pending, Active) | (Pending, Released) | (Active, Released) | (Active, Revoked)
        )
    }
}

impl fmt::Display for AssignmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AssignmentStatus::Pending => "PENDING",
            AssignmentStatus::Active => "ACTIVE",
            AssignmentStatus::Released => "RELEASED",
            AssignmentStatus::Revoked => "REVOKED",
        };
        f.write_str(s)
    }
}

/// A committed binding of resource units to one client process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub id: AssignmentId,

    /// Owning process (references a registration, never owns it)
    pub process_id: ProcessId,

    pub units: BTreeSet<UnitId>,

    pub status: AssignmentStatus,

    pub assigned_at: DateTime<Utc>,

    pub activated_at: Option<DateTime<Utc>>,

    pub finished_at: Option<DateTime<Utc>>,

    /// Why the assignment ended (release, rollback or revocation reason)
    pub end_reason: Option<String>,
}

impl Assignment {
    /// Create a new PENDING assignment
    pub fn pending(process_id: ProcessId, units: impl IntoIterator<Item = UnitId>) -> Self {
        Self {
            id: AssignmentId::generate(),
            process_id,
            units: units.into_iter().collect(),
            status: AssignmentStatus::Pending,
            assigned_at: Utc::now(),
            activated_at: None,
            finished_at: None,
            end_reason: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == AssignmentStatus::Active
    }

    /// Move to `next`, rejecting edges the state machine does not allow
    pub fn transition(
        &mut self,
        next: AssignmentStatus,
        reason: Option<String>,
    ) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                assignment_id: self.id,
                from: self.status,
                to: next,
            });
        }

        let now = Utc::now();
        match next {
            AssignmentStatus::Active => self.activated_at = Some(now),
            AssignmentStatus::Released | AssignmentStatus::Revoked => {
                self.finished_at = Some(now);
                self.end_reason = reason;
            }
            AssignmentStatus::Pending => {}
        }
        self.status = next;
        Ok(())
    }
}

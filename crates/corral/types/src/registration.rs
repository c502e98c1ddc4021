//! Client registrations tracked by the supervisor

use crate::ids::ProcessId;
use crate::requirement::ResourceRequirement;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Registration status of a supervised process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegistrationStatus {
    /// Heartbeating normally
    Registered,
    /// Heartbeats are late but the liveness timeout has not expired
    Degraded,
    /// Graceful deregistration in progress; no new claims are committed
    Exiting,
    /// Declared lost by the liveness sweep
    Lost,
}

impl RegistrationStatus {
    /// Whether the broker may commit claims on behalf of this process
    pub fn allows_claims(&self) -> bool {
        matches!(
            self,
            RegistrationStatus::Registered | RegistrationStatus::Degraded
        )
    }
}

impl fmt::Display for RegistrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RegistrationStatus::Registered => "REGISTERED",
            RegistrationStatus::Degraded => "DEGRADED",
            RegistrationStatus::Exiting => "EXITING",
            RegistrationStatus::Lost => "LOST",
        };
        f.write_str(s)
    }
}

/// A supervised client process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRegistration {
    pub process_id: ProcessId,

    /// Requirement declared at registration
    pub requirement: ResourceRequirement,

    pub status: RegistrationStatus,

    pub registered_at: DateTime<Utc>,

    pub last_heartbeat: DateTime<Utc>,
}

impl ClientRegistration {
    pub fn new(process_id: ProcessId, requirement: ResourceRequirement) -> Self {
        let now = Utc::now();
        Self {
            process_id,
            requirement,
            status: RegistrationStatus::Registered,
            registered_at: now,
            last_heartbeat: now,
        }
    }

    /// Record a heartbeat; a degraded client recovers to registered
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_heartbeat = now;
        if self.status == RegistrationStatus::Degraded {
            self.status = RegistrationStatus::Registered;
        }
    }

    pub fn since_heartbeat(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_heartbeat
    }
}

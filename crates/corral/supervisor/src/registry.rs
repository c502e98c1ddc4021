//! Registration table.

use chrono::{DateTime, Utc};
use corral_broker::ClaimGate;
use corral_types::{ClientRegistration, ProcessId, RegistrationStatus, ResourceRequirement};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// Live client registrations, keyed by pid.
///
/// Doubles as the broker's [`ClaimGate`]: only REGISTERED and DEGRADED
/// clients may commit claims.
#[derive(Debug, Default)]
pub struct RegistrationTable {
    clients: DashMap<ProcessId, ClientRegistration>,
}

impl RegistrationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fresh registration. Returns `None` if `pid` is already present.
    pub fn insert_new(
        &self,
        pid: ProcessId,
        requirement: ResourceRequirement,
    ) -> Option<ClientRegistration> {
        match self.clients.entry(pid) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let registration = ClientRegistration::new(pid, requirement);
                slot.insert(registration.clone());
                Some(registration)
            }
        }
    }

    pub fn get(&self, pid: ProcessId) -> Option<ClientRegistration> {
        self.clients.get(&pid).map(|r| r.clone())
    }

    pub fn remove(&self, pid: ProcessId) -> Option<ClientRegistration> {
        self.clients.remove(&pid).map(|(_, r)| r)
    }

    /// Apply `f` to the registration of `pid`, if present.
    pub fn update<T>(
        &self,
        pid: ProcessId,
        f: impl FnOnce(&mut ClientRegistration) -> T,
    ) -> Option<T> {
        self.clients.get_mut(&pid).map(|mut r| f(&mut r))
    }

    pub fn set_status(&self, pid: ProcessId, status: RegistrationStatus) -> bool {
        self.update(pid, |r| r.status = status).is_some()
    }

    /// Record a heartbeat. Returns the status before the heartbeat.
    pub fn touch(&self, pid: ProcessId, now: DateTime<Utc>) -> Option<RegistrationStatus> {
        self.update(pid, |r| {
            let before = r.status;
            r.touch(now);
            before
        })
    }

    /// All registrations, ordered by pid.
    pub fn all(&self) -> Vec<ClientRegistration> {
        let mut all: Vec<ClientRegistration> =
            self.clients.iter().map(|r| r.value().clone()).collect();
        all.sort_by_key(|r| r.process_id);
        all
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

impl ClaimGate for RegistrationTable {
    fn may_claim(&self, pid: ProcessId) -> bool {
        self.clients
            .get(&pid)
            .map(|r| r.status.allows_claims())
            .unwrap_or(false)
    }
}

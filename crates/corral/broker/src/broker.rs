//! Claim broker.
//!
//! Sole writer of the descriptor store. A claim snapshots the free units that
//! match the requirement, picks the lowest identifiers, and commits under the
//! commit lock only if none of the picked units changed since the snapshot.
//! The assignment is created PENDING, the lock is released, and the host
//! directives are enforced; the assignment turns ACTIVE on success and is
//! rolled back to RELEASED otherwise. Enforcement runs on its own task, so a
//! caller that stops waiting never leaves a PENDING assignment behind.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use corral_enforce::{Enforcer, HostDirectives};
use corral_types::{
    Assignment, AssignmentId, AssignmentStatus, CorralEvent, CorralEventEnvelope, EventSource,
    ProcessId, ResourceKind, ResourceRequirement, ResourceUnit, TransitionError, UnitId,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, error, info, instrument, warn, Instrument};

use crate::error::{BrokerError, BrokerResult};
use crate::store::{DescriptorStore, UnitRecord};

/// Broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Fresh snapshots taken after a commit-time conflict before giving up.
    pub max_claim_retries: u32,

    /// Terminal assignments kept for inspection; oldest are pruned first.
    pub history_limit: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_claim_retries: 3,
            history_limit: 1024,
        }
    }
}

/// Decides whether a process may still commit claims.
///
/// Checked under the commit lock before a claim is committed and again before
/// it is activated, so a process that is being deregistered or declared lost
/// cannot end up holding units.
pub trait ClaimGate: Send + Sync {
    fn may_claim(&self, pid: ProcessId) -> bool;
}

/// Gate that admits every process.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAllGate;

impl ClaimGate for AllowAllGate {
    fn may_claim(&self, _pid: ProcessId) -> bool {
        true
    }
}

/// Result of a release request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseOutcome {
    /// Assignment was active and is now released.
    Released,
    /// Assignment had already ended.
    AlreadyFinished,
    /// Assignment is still being enforced; its claim decides its fate.
    InFlight,
    /// No such assignment (or it was pruned from history).
    Unknown,
}

#[derive(Debug, Default)]
struct Ledger {
    assignments: HashMap<AssignmentId, Assignment>,
    finished: VecDeque<AssignmentId>,
}

impl Ledger {
    fn retire(&mut self, id: AssignmentId, limit: usize) {
        self.finished.push_back(id);
        while self.finished.len() > limit {
            if let Some(oldest) = self.finished.pop_front() {
                self.assignments.remove(&oldest);
            }
        }
    }
}

/// Claim broker.
///
/// Clones are handles onto the same store and ledger.
#[derive(Clone)]
pub struct ClaimBroker {
    config: BrokerConfig,
    store: Arc<DescriptorStore>,
    enforcer: Arc<dyn Enforcer>,
    gate: Arc<dyn ClaimGate>,
    ledger: Arc<RwLock<Ledger>>,
    commit: Arc<Mutex<()>>,
    event_tx: broadcast::Sender<CorralEventEnvelope>,
}

impl ClaimBroker {
    pub fn new(
        config: BrokerConfig,
        store: Arc<DescriptorStore>,
        enforcer: Arc<dyn Enforcer>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(1024);

        Self {
            config,
            store,
            enforcer,
            gate: Arc::new(AllowAllGate),
            ledger: Arc::new(RwLock::new(Ledger::default())),
            commit: Arc::new(Mutex::new(())),
            event_tx,
        }
    }

    pub fn with_gate(mut self, gate: Arc<dyn ClaimGate>) -> Self {
        self.gate = gate;
        self
    }

    /// Publish on an existing channel instead of a private one.
    pub fn with_event_sender(mut self, event_tx: broadcast::Sender<CorralEventEnvelope>) -> Self {
        self.event_tx = event_tx;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CorralEventEnvelope> {
        self.event_tx.subscribe()
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<DescriptorStore> {
        &self.store
    }

    fn emit(&self, source: EventSource, event: CorralEvent) {
        let _ = self.event_tx.send(CorralEventEnvelope::new(event, source));
    }

    /// Publish fatal errors before handing them back.
    fn escalate(&self, err: BrokerError) -> BrokerError {
        if err.is_fatal() {
            error!(error = %err, "Fatal broker condition");
            self.emit(
                EventSource::Broker,
                CorralEvent::FatalCondition {
                    reason: err.to_string(),
                },
            );
        }
        err
    }

    /// Claim units for `pid`. Returns the ACTIVE assignment.
    #[instrument(skip(self, requirement), fields(pid = %pid, requirement = %requirement))]
    pub async fn claim(
        &self,
        pid: ProcessId,
        requirement: &ResourceRequirement,
    ) -> BrokerResult<Assignment> {
        requirement.validate()?;

        let mut contended = None;
        for attempt in 1..=self.config.max_claim_retries.saturating_add(1) {
            let selection = self.select(requirement).await?;

            match self.commit(pid, &selection).await {
                Ok(assignment) => return self.settle(assignment, selection).await,
                Err(BrokerError::Conflict { unit }) => {
                    debug!(attempt, unit = %unit, "Claim conflicted, retrying with fresh snapshot");
                    self.emit(
                        EventSource::Broker,
                        CorralEvent::ClaimConflict {
                            process_id: pid,
                            attempt,
                        },
                    );
                    contended = Some(unit);
                }
                Err(err) => return Err(self.escalate(err)),
            }
        }

        let kind = contended
            .map(|u| u.kind)
            .or_else(|| requirement.items.first().map(|i| i.kind))
            .ok_or_else(|| BrokerError::StateCorrupted("claim without items".to_string()))?;
        let requested = requirement.count_of(kind);
        let available = self.free_count(requirement, kind).await;
        warn!(
            retries = self.config.max_claim_retries,
            available,
            "Claim retry budget exhausted"
        );
        Err(BrokerError::InsufficientResources {
            kind,
            requested,
            available,
        })
    }

    /// Free units of `kind` matching any item of that kind.
    async fn free_count(&self, requirement: &ResourceRequirement, kind: ResourceKind) -> u32 {
        let mut free = BTreeSet::new();
        for item in requirement.items.iter().filter(|i| i.kind == kind) {
            free.extend(
                self.store
                    .lookup(kind, &item.constraints)
                    .await
                    .into_iter()
                    .filter(|r| r.is_free())
                    .map(|r| r.id()),
            );
        }
        free.len() as u32
    }

    /// Drive a committed assignment to ACTIVE or RELEASED on a detached task.
    ///
    /// The task runs to completion even when the caller's future is dropped.
    async fn settle(
        &self,
        assignment: Assignment,
        selection: Vec<UnitRecord>,
    ) -> BrokerResult<Assignment> {
        let id = assignment.id;
        let broker = self.clone();
        let task = tokio::spawn(
            async move { broker.activate(assignment, &selection).await }
                .instrument(tracing::Span::current()),
        );

        match task.await {
            Ok(result) => result,
            Err(join_err) => Err(self.escalate(BrokerError::StateCorrupted(format!(
                "enforcement task for {} failed: {}",
                id, join_err
            )))),
        }
    }

    /// Snapshot free units satisfying every item, lowest identifier first.
    async fn select(&self, requirement: &ResourceRequirement) -> BrokerResult<Vec<UnitRecord>> {
        let mut taken: BTreeSet<UnitId> = BTreeSet::new();
        let mut selected = Vec::new();

        for item in &requirement.items {
            if item.count == 0 {
                continue;
            }
            let free: Vec<UnitRecord> = self
                .store
                .lookup(item.kind, &item.constraints)
                .await
                .into_iter()
                .filter(|r| r.is_free() && !taken.contains(&r.id()))
                .collect();

            if (free.len() as u32) < item.count {
                return Err(BrokerError::InsufficientResources {
                    kind: item.kind,
                    requested: item.count,
                    available: free.len() as u32,
                });
            }

            for record in free.into_iter().take(item.count as usize) {
                taken.insert(record.id());
                selected.push(record);
            }
        }

        Ok(selected)
    }

    /// Commit `selection` as a PENDING assignment if it is still current.
    async fn commit(&self, pid: ProcessId, selection: &[UnitRecord]) -> BrokerResult<Assignment> {
        let _guard = self.commit.lock().await;

        if !self.gate.may_claim(pid) {
            return Err(BrokerError::Cancelled(pid));
        }

        let ids: BTreeSet<UnitId> = selection.iter().map(UnitRecord::id).collect();
        let current = self.store.generations(&ids).await;
        for record in selection {
            match current.get(&record.id()) {
                Some((generation, None)) if *generation == record.generation => {}
                _ => return Err(BrokerError::Conflict { unit: record.id() }),
            }
        }

        let assignment = Assignment::pending(pid, ids.iter().copied());
        self.store.mark(&ids, Some(assignment.id), None).await?;
        self.ledger
            .write()
            .await
            .assignments
            .insert(assignment.id, assignment.clone());

        info!(assignment_id = %assignment.id, units = ?ids, "Assignment committed");
        self.emit(
            EventSource::Broker,
            CorralEvent::AssignmentCommitted {
                assignment_id: assignment.id,
                process_id: pid,
                units: ids.into_iter().collect(),
            },
        );
        Ok(assignment)
    }

    /// Enforce a PENDING assignment and make it ACTIVE, or roll it back.
    async fn activate(
        &self,
        assignment: Assignment,
        selection: &[UnitRecord],
    ) -> BrokerResult<Assignment> {
        let units: Vec<ResourceUnit> = selection.iter().map(|r| r.unit.clone()).collect();
        let directives = HostDirectives::for_units(&units);

        if let Err(err) = self.enforcer.apply(&assignment, &directives).await {
            let reason = err.to_string();
            self.roll_back(&assignment, &reason)
                .await
                .map_err(|e| self.escalate(e))?;
            return Err(self.escalate(BrokerError::Enforcement(err)));
        }

        let guard = self.commit.lock().await;
        if !self.gate.may_claim(assignment.process_id) {
            drop(guard);
            warn!(
                assignment_id = %assignment.id,
                "Process stopped accepting claims during enforcement, reverting"
            );
            self.revert(&assignment).await;
            self.roll_back(&assignment, "process stopped accepting claims")
                .await
                .map_err(|e| self.escalate(e))?;
            return Err(BrokerError::Cancelled(assignment.process_id));
        }

        let active = {
            let mut ledger = self.ledger.write().await;
            match ledger.assignments.get_mut(&assignment.id) {
                Some(record) => {
                    if let Err(e) = record.transition(AssignmentStatus::Active, None) {
                        return Err(self.escalate(e.into()));
                    }
                    record.clone()
                }
                None => {
                    return Err(self.escalate(BrokerError::StateCorrupted(format!(
                        "assignment {} vanished",
                        assignment.id
                    ))))
                }
            }
        };
        drop(guard);

        info!(assignment_id = %active.id, "Assignment active");
        self.emit(
            EventSource::Broker,
            CorralEvent::AssignmentActivated {
                assignment_id: active.id,
                process_id: active.process_id,
            },
        );
        Ok(active)
    }

    /// Compensate a PENDING assignment whose enforcement did not complete.
    async fn roll_back(&self, assignment: &Assignment, reason: &str) -> BrokerResult<()> {
        let _guard = self.commit.lock().await;
        self.end_locked(
            assignment.id,
            AssignmentStatus::Released,
            Some(format!("rolled back: {}", reason)),
        )
        .await?;

        warn!(assignment_id = %assignment.id, reason, "Assignment rolled back");
        self.emit(
            EventSource::Broker,
            CorralEvent::AssignmentRolledBack {
                assignment_id: assignment.id,
                process_id: assignment.process_id,
                reason: reason.to_string(),
            },
        );
        Ok(())
    }

    /// Free the units of `id` and move it to `next`. The commit lock must be held.
    async fn end_locked(
        &self,
        id: AssignmentId,
        next: AssignmentStatus,
        reason: Option<String>,
    ) -> BrokerResult<Assignment> {
        let mut ledger = self.ledger.write().await;

        let current = ledger
            .assignments
            .get(&id)
            .ok_or_else(|| BrokerError::StateCorrupted(format!("assignment {} missing", id)))?;
        if !current.status.can_transition_to(next) {
            return Err(TransitionError {
                assignment_id: id,
                from: current.status,
                to: next,
            }
            .into());
        }
        let units = current.units.clone();

        self.store.mark(&units, None, Some(id)).await?;

        let record = ledger
            .assignments
            .get_mut(&id)
            .ok_or_else(|| BrokerError::StateCorrupted(format!("assignment {} missing", id)))?;
        record.transition(next, reason)?;
        let ended = record.clone();
        ledger.retire(id, self.config.history_limit);
        Ok(ended)
    }

    /// Withdraw host directives of an ended assignment. Failures are reported,
    /// not returned: the units are already free.
    async fn revert(&self, assignment: &Assignment) {
        if let Err(err) = self.enforcer.revert(assignment).await {
            warn!(
                assignment_id = %assignment.id,
                pid = %assignment.process_id,
                error = %err,
                "Failed to revert host directives"
            );
            self.emit(
                EventSource::Enforcement,
                CorralEvent::RevertFailed {
                    assignment_id: assignment.id,
                    process_id: assignment.process_id,
                    reason: err.to_string(),
                },
            );
            if err.is_privilege_loss() {
                self.escalate(BrokerError::Enforcement(err));
            }
        }
    }

    /// Release an assignment. Idempotent.
    #[instrument(skip(self), fields(assignment_id = %id))]
    pub async fn release(&self, id: AssignmentId) -> BrokerResult<ReleaseOutcome> {
        let released = {
            let _guard = self.commit.lock().await;
            let status = self.ledger.read().await.assignments.get(&id).map(|a| a.status);
            match status {
                None => return Ok(ReleaseOutcome::Unknown),
                Some(s) if s.is_terminal() => return Ok(ReleaseOutcome::AlreadyFinished),
                Some(AssignmentStatus::Pending) => return Ok(ReleaseOutcome::InFlight),
                Some(_) => {}
            }
            self.end_locked(id, AssignmentStatus::Released, Some("released".to_string()))
                .await
                .map_err(|e| self.escalate(e))?
        };

        info!(pid = %released.process_id, "Assignment released");
        self.emit(
            EventSource::Broker,
            CorralEvent::AssignmentReleased {
                assignment_id: id,
                process_id: released.process_id,
            },
        );
        self.revert(&released).await;
        Ok(ReleaseOutcome::Released)
    }

    /// Forcibly end an ACTIVE assignment. Returns whether anything was revoked.
    #[instrument(skip(self), fields(assignment_id = %id))]
    pub async fn revoke(&self, id: AssignmentId, reason: &str) -> BrokerResult<bool> {
        let revoked = {
            let _guard = self.commit.lock().await;
            let active = self
                .ledger
                .read()
                .await
                .assignments
                .get(&id)
                .map(|a| a.is_active())
                .unwrap_or(false);
            if !active {
                return Ok(false);
            }
            self.end_locked(id, AssignmentStatus::Revoked, Some(reason.to_string()))
                .await
                .map_err(|e| self.escalate(e))?
        };

        self.announce_revoked(&revoked, reason);
        self.revert(&revoked).await;
        Ok(true)
    }

    /// Revoke every ACTIVE assignment of `pid` as one unit of work: either
    /// all are revoked or the store is left untouched.
    #[instrument(skip(self), fields(pid = %pid))]
    pub async fn revoke_all(&self, pid: ProcessId, reason: &str) -> BrokerResult<Vec<Assignment>> {
        let revoked = {
            let _guard = self.commit.lock().await;

            let mut targets: Vec<_> = self
                .ledger
                .read()
                .await
                .assignments
                .values()
                .filter(|a| a.process_id == pid && a.is_active())
                .map(|a| (a.id, a.units.clone(), a.assigned_at))
                .collect();
            targets.sort_by_key(|(_, _, assigned_at)| *assigned_at);

            for (id, units, _) in &targets {
                let current = self.store.generations(units).await;
                let consistent = units
                    .iter()
                    .all(|u| matches!(current.get(u), Some((_, Some(owner))) if owner == id));
                if !consistent {
                    return Err(self.escalate(BrokerError::StateCorrupted(format!(
                        "units of {} are not owned by it",
                        id
                    ))));
                }
            }

            let mut revoked = Vec::with_capacity(targets.len());
            for (id, _, _) in targets {
                let ended = self
                    .end_locked(id, AssignmentStatus::Revoked, Some(reason.to_string()))
                    .await
                    .map_err(|e| self.escalate(e))?;
                revoked.push(ended);
            }
            revoked
        };

        for assignment in &revoked {
            self.announce_revoked(assignment, reason);
            self.revert(assignment).await;
        }
        Ok(revoked)
    }

    fn announce_revoked(&self, assignment: &Assignment, reason: &str) {
        warn!(
            assignment_id = %assignment.id,
            pid = %assignment.process_id,
            reason,
            "Assignment revoked"
        );
        self.emit(
            EventSource::Broker,
            CorralEvent::AssignmentRevoked {
                assignment_id: assignment.id,
                process_id: assignment.process_id,
                reason: reason.to_string(),
            },
        );
    }

    pub async fn assignment(&self, id: AssignmentId) -> Option<Assignment> {
        self.ledger.read().await.assignments.get(&id).cloned()
    }

    /// Live (PENDING or ACTIVE) assignments of `pid`, oldest first.
    pub async fn assignments_for(&self, pid: ProcessId) -> Vec<Assignment> {
        let ledger = self.ledger.read().await;
        let mut live: Vec<Assignment> = ledger
            .assignments
            .values()
            .filter(|a| a.process_id == pid && !a.status.is_terminal())
            .cloned()
            .collect();
        live.sort_by_key(|a| a.assigned_at);
        live
    }

    /// All known assignments including retained history, oldest first.
    pub async fn assignments(&self) -> Vec<Assignment> {
        let ledger = self.ledger.read().await;
        let mut all: Vec<Assignment> = ledger.assignments.values().cloned().collect();
        all.sort_by_key(|a| a.assigned_at);
        all
    }

    /// Every unit with its current owner.
    pub async fn units(&self) -> Vec<UnitRecord> {
        self.store.all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use corral_enforce::{
        EnforcementConfig, EnforcementEngine, EnforcementError, EnforcementResult, Fault,
        HostError, RecordingHostControl,
    };
    use corral_types::{HostTopology, UnitConstraint};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    const TOPOLOGY: &str = r#"
cpus: [0, 1, 2, 3]
priority_bands:
  - name: HIGH
    priority: 80
    capacity: 1
memory_lock:
  block_mb: 64
  blocks: 1
"#;

    fn store() -> Arc<DescriptorStore> {
        let topology = HostTopology::from_yaml_str(TOPOLOGY).unwrap();
        Arc::new(DescriptorStore::initialize(&topology).unwrap())
    }

    fn broker_with(host: Arc<RecordingHostControl>, config: BrokerConfig) -> ClaimBroker {
        let engine = Arc::new(EnforcementEngine::new(host, EnforcementConfig::default()));
        ClaimBroker::new(config, store(), engine)
    }

    fn broker() -> ClaimBroker {
        broker_with(
            Arc::new(RecordingHostControl::permissive(0..4)),
            BrokerConfig::default(),
        )
    }

    fn pid(n: u32) -> ProcessId {
        ProcessId::new(n)
    }

    async fn free_units(broker: &ClaimBroker) -> usize {
        broker.units().await.iter().filter(|r| r.is_free()).count()
    }

    struct SwitchGate(AtomicBool);

    impl ClaimGate for SwitchGate {
        fn may_claim(&self, _pid: ProcessId) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    /// Enforcer that closes the gate while "enforcing".
    struct ClosingEnforcer(Arc<SwitchGate>);

    #[async_trait]
    impl Enforcer for ClosingEnforcer {
        async fn apply(&self, _a: &Assignment, _d: &HostDirectives) -> EnforcementResult<()> {
            self.0 .0.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn revert(&self, _a: &Assignment) -> EnforcementResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_claim_picks_lowest_identifiers() {
        let broker = broker();

        let a = broker
            .claim(pid(1), &ResourceRequirement::new().cpus(2).priority_in_band("HIGH", 1))
            .await
            .unwrap();
        assert_eq!(a.status, AssignmentStatus::Active);
        assert_eq!(
            a.units,
            BTreeSet::from([UnitId::cpu(0), UnitId::cpu(1), UnitId::priority(0)])
        );

        let b = broker
            .claim(pid(2), &ResourceRequirement::new().cpus(2))
            .await
            .unwrap();
        assert_eq!(b.units, BTreeSet::from([UnitId::cpu(2), UnitId::cpu(3)]));
    }

    #[tokio::test]
    async fn test_over_claim_commits_nothing() {
        let broker = broker();
        broker
            .claim(pid(1), &ResourceRequirement::new().cpus(3))
            .await
            .unwrap();
        let before = free_units(&broker).await;

        let err = broker
            .claim(pid(2), &ResourceRequirement::new().memory_blocks(1).cpus(2))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            BrokerError::InsufficientResources {
                kind: ResourceKind::Cpu,
                requested: 2,
                available: 1,
            }
        ));
        assert_eq!(free_units(&broker).await, before);
        assert!(broker.assignments_for(pid(2)).await.is_empty());
    }

    #[tokio::test]
    async fn test_items_do_not_share_units() {
        let broker = broker();
        let requirement = ResourceRequirement::new().cpus(1).item(
            corral_types::RequirementItem::new(ResourceKind::Cpu, 1)
                .with_constraint(UnitConstraint::only([0, 1])),
        );

        let a = broker.claim(pid(1), &requirement).await.unwrap();
        assert_eq!(a.units, BTreeSet::from([UnitId::cpu(0), UnitId::cpu(1)]));
    }

    #[tokio::test]
    async fn test_empty_requirement_rejected() {
        let broker = broker();
        let err = broker
            .claim(pid(1), &ResourceRequirement::new().cpus(0))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::InvalidRequirement(_)));
    }

    #[tokio::test]
    async fn test_double_release_is_idempotent() {
        let broker = broker();
        let a = broker
            .claim(pid(1), &ResourceRequirement::new().cpus(1))
            .await
            .unwrap();
        let b = broker
            .claim(pid(2), &ResourceRequirement::new().cpus(1))
            .await
            .unwrap();

        assert_eq!(broker.release(a.id).await.unwrap(), ReleaseOutcome::Released);
        assert_eq!(
            broker.release(a.id).await.unwrap(),
            ReleaseOutcome::AlreadyFinished
        );
        assert_eq!(
            broker.release(AssignmentId::generate()).await.unwrap(),
            ReleaseOutcome::Unknown
        );

        let b_now = broker.assignment(b.id).await.unwrap();
        assert!(b_now.is_active());
        let a_now = broker.assignment(a.id).await.unwrap();
        assert_eq!(a_now.status, AssignmentStatus::Released);
        assert!(broker.store().get(UnitId::cpu(0)).await.unwrap().is_free());
    }

    #[tokio::test]
    async fn test_enforcement_failure_rolls_back() {
        let host = Arc::new(RecordingHostControl::new(0..4));
        let broker = broker_with(host.clone(), BrokerConfig::default());

        // pid 7 does not exist on the host yet.
        let err = broker
            .claim(pid(7), &ResourceRequirement::new().cpus(2))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Enforcement(_)));
        assert_eq!(free_units(&broker).await, 6);

        let history = broker.assignments().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, AssignmentStatus::Released);

        host.spawn(pid(7));
        let a = broker
            .claim(pid(7), &ResourceRequirement::new().cpus(2))
            .await
            .unwrap();
        assert_eq!(a.units, BTreeSet::from([UnitId::cpu(0), UnitId::cpu(1)]));
    }

    #[tokio::test]
    async fn test_abandoned_claim_still_settles() {
        let host = Arc::new(RecordingHostControl::new(0..4));
        host.spawn(pid(5));
        host.inject(pid(5), Fault::Stall(Duration::from_millis(50)));
        let broker = broker_with(host.clone(), BrokerConfig::default());

        // The caller gives up while the first host call is still stalled.
        let abandoned = tokio::time::timeout(
            Duration::from_millis(20),
            broker.claim(pid(5), &ResourceRequirement::new().cpus(2)),
        )
        .await;
        assert!(abandoned.is_err());

        let mut history = Vec::new();
        for _ in 0..300 {
            history = broker.assignments().await;
            if history.iter().all(|a| a.status != AssignmentStatus::Pending) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(history.len(), 1);
        assert!(history[0].is_active());
        assert_eq!(
            host.state(pid(5)).unwrap().affinity,
            BTreeSet::from([0, 1])
        );

        host.clear_faults(pid(5));
        let revoked = broker.revoke_all(pid(5), "client gone").await.unwrap();
        assert_eq!(revoked.len(), 1);
        assert_eq!(free_units(&broker).await, 6);
    }

    #[tokio::test]
    async fn test_unbounded_retry_budget() {
        let broker = broker_with(
            Arc::new(RecordingHostControl::permissive(0..4)),
            BrokerConfig {
                max_claim_retries: u32::MAX,
                history_limit: 16,
            },
        );

        let a = broker
            .claim(pid(1), &ResourceRequirement::new().cpus(1))
            .await
            .unwrap();
        assert!(a.is_active());
    }

    #[tokio::test]
    async fn test_revoke_emits_event() {
        let broker = broker();
        let mut events = broker.subscribe();
        let a = broker
            .claim(pid(1), &ResourceRequirement::new().cpus(1))
            .await
            .unwrap();

        assert!(broker.revoke(a.id, "operator").await.unwrap());
        assert!(!broker.revoke(a.id, "operator").await.unwrap());

        let mut saw_revoked = false;
        while let Ok(envelope) = events.try_recv() {
            if let CorralEvent::AssignmentRevoked { assignment_id, reason, .. } = envelope.event {
                assert_eq!(assignment_id, a.id);
                assert_eq!(reason, "operator");
                saw_revoked = true;
            }
        }
        assert!(saw_revoked);
        assert_eq!(
            broker.assignment(a.id).await.unwrap().status,
            AssignmentStatus::Revoked
        );
    }

    #[tokio::test]
    async fn test_revoke_all_frees_every_unit() {
        let broker = broker();
        broker
            .claim(pid(1), &ResourceRequirement::new().cpus(1))
            .await
            .unwrap();
        broker
            .claim(pid(1), &ResourceRequirement::new().memory_blocks(1))
            .await
            .unwrap();
        let other = broker
            .claim(pid(2), &ResourceRequirement::new().cpus(1))
            .await
            .unwrap();

        let revoked = broker.revoke_all(pid(1), "heartbeat timeout").await.unwrap();
        assert_eq!(revoked.len(), 2);
        assert!(revoked
            .iter()
            .all(|a| a.status == AssignmentStatus::Revoked));
        assert!(broker.assignments_for(pid(1)).await.is_empty());
        assert!(broker.assignment(other.id).await.unwrap().is_active());
        assert_eq!(free_units(&broker).await, 5);
    }

    #[tokio::test]
    async fn test_closed_gate_cancels_before_commit() {
        let gate = Arc::new(SwitchGate(AtomicBool::new(false)));
        let broker = broker().with_gate(gate);

        let err = broker
            .claim(pid(1), &ResourceRequirement::new().cpus(1))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Cancelled(_)));
        assert!(broker.assignments().await.is_empty());
    }

    #[tokio::test]
    async fn test_gate_closing_during_enforcement_rolls_back() {
        let gate = Arc::new(SwitchGate(AtomicBool::new(true)));
        let broker = ClaimBroker::new(
            BrokerConfig::default(),
            store(),
            Arc::new(ClosingEnforcer(gate.clone())),
        )
        .with_gate(gate);

        let err = broker
            .claim(pid(1), &ResourceRequirement::new().cpus(2))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Cancelled(_)));
        assert_eq!(free_units(&broker).await, 6);
        assert_eq!(
            broker.assignments().await[0].status,
            AssignmentStatus::Released
        );
    }

    #[tokio::test]
    async fn test_stale_snapshot_conflicts() {
        let broker = broker();
        let requirement = ResourceRequirement::new().cpus(1);

        let stale = broker.select(&requirement).await.unwrap();
        broker.claim(pid(1), &requirement).await.unwrap();

        let err = broker.commit(pid(2), &stale).await.unwrap_err();
        assert!(matches!(err, BrokerError::Conflict { unit } if unit == UnitId::cpu(0)));

        // A full claim retries with a fresh snapshot and gets the next core.
        let b = broker.claim(pid(2), &requirement).await.unwrap();
        assert_eq!(b.units, BTreeSet::from([UnitId::cpu(1)]));
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let broker = broker_with(
            Arc::new(RecordingHostControl::permissive(0..4)),
            BrokerConfig {
                max_claim_retries: 3,
                history_limit: 2,
            },
        );

        for _ in 0..4 {
            let a = broker
                .claim(pid(1), &ResourceRequirement::new().cpus(1))
                .await
                .unwrap();
            broker.release(a.id).await.unwrap();
        }
        assert_eq!(broker.assignments().await.len(), 2);
    }

    #[tokio::test]
    async fn test_privilege_loss_is_fatal() {
        let host = Arc::new(RecordingHostControl::permissive(0..4));
        host.set_privileged(false);
        let broker = broker_with(host, BrokerConfig::default());
        let mut events = broker.subscribe();

        let err = broker
            .claim(pid(1), &ResourceRequirement::new().cpus(1))
            .await
            .unwrap_err();
        assert!(err.is_fatal());

        let mut fatal = false;
        while let Ok(envelope) = events.try_recv() {
            fatal |= envelope.is_fatal();
        }
        assert!(fatal);
    }

    #[tokio::test]
    async fn test_host_error_is_not_fatal() {
        let host = Arc::new(RecordingHostControl::new(0..4));
        host.spawn(pid(3));
        host.inject(pid(3), Fault::FailScheduling(HostError::Other("EINVAL".into())));
        let broker = broker_with(host, BrokerConfig::default());

        let err = broker
            .claim(pid(3), &ResourceRequirement::new().cpus(1).priority_slots(1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BrokerError::Enforcement(EnforcementError::Host { .. })
        ));
        assert!(!err.is_fatal());
    }
}

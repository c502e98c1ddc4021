//! Process supervisor.
//!
//! Owns client registrations and their liveness. Registration forwards the
//! declared requirement to the broker; a process that stops heartbeating, or
//! that no longer exists on the host, is declared LOST by the periodic sweep
//! and everything it holds is revoked.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use corral_broker::{BrokerConfig, BrokerError, ClaimBroker, DescriptorStore, ReleaseOutcome};
use corral_enforce::{Enforcer, ProcessProbe};
use corral_types::{
    Assignment, AssignmentId, ClientRegistration, CorralEvent, CorralEventEnvelope, EventSource,
    ExitKind, ProcessId, RegistrationStatus, ResourceRequirement,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::time::interval;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{SupervisorError, SupervisorResult};
use crate::registry::RegistrationTable;

/// Supervisor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Silence after which a client is declared LOST. Half of it marks the
    /// client DEGRADED.
    pub liveness_timeout: Duration,

    /// Period of the liveness sweep.
    pub sweep_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            liveness_timeout: Duration::from_secs(5),
            sweep_interval: Duration::from_millis(500),
        }
    }
}

/// A successful registration.
#[derive(Debug, Clone, Serialize)]
pub struct Registered {
    pub registration: ClientRegistration,
    pub assignment: Assignment,
}

/// Outcome of a graceful deregistration.
#[derive(Debug, Clone, Serialize)]
pub struct ExitSummary {
    pub process_id: ProcessId,
    pub revoked: Vec<Assignment>,
}

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub degraded: Vec<ProcessId>,
    pub lost: Vec<ProcessId>,
    /// Lost clients whose revocation failed; retried on the next sweep.
    pub retry: Vec<ProcessId>,
}

/// Process supervisor.
pub struct Supervisor {
    config: SupervisorConfig,
    table: Arc<RegistrationTable>,
    broker: Arc<ClaimBroker>,
    probe: Arc<dyn ProcessProbe>,
    event_tx: broadcast::Sender<CorralEventEnvelope>,
}

impl Supervisor {
    /// Create a supervisor over an existing table and broker. The broker
    /// should use `table` as its claim gate and share `event_tx`.
    pub fn new(
        config: SupervisorConfig,
        table: Arc<RegistrationTable>,
        broker: Arc<ClaimBroker>,
        probe: Arc<dyn ProcessProbe>,
        event_tx: broadcast::Sender<CorralEventEnvelope>,
    ) -> Self {
        Self {
            config,
            table,
            broker,
            probe,
            event_tx,
        }
    }

    /// Wire a broker and a supervisor around `store` on one event channel.
    pub fn assemble(
        config: SupervisorConfig,
        broker_config: BrokerConfig,
        store: Arc<DescriptorStore>,
        enforcer: Arc<dyn Enforcer>,
        probe: Arc<dyn ProcessProbe>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(1024);
        let table = Arc::new(RegistrationTable::new());
        let broker = ClaimBroker::new(broker_config, store, enforcer)
            .with_gate(table.clone())
            .with_event_sender(event_tx.clone());

        Self::new(config, table, Arc::new(broker), probe, event_tx)
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn broker(&self) -> &Arc<ClaimBroker> {
        &self.broker
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CorralEventEnvelope> {
        self.event_tx.subscribe()
    }

    pub fn event_sender(&self) -> broadcast::Sender<CorralEventEnvelope> {
        self.event_tx.clone()
    }

    fn emit(&self, event: CorralEvent) {
        let _ = self
            .event_tx
            .send(CorralEventEnvelope::new(event, EventSource::Supervisor));
    }

    pub fn registration(&self, pid: ProcessId) -> Option<ClientRegistration> {
        self.table.get(pid)
    }

    pub fn registrations(&self) -> Vec<ClientRegistration> {
        self.table.all()
    }

    /// Register a process and claim its declared requirement. If the claim
    /// fails the registration is dropped and nothing is held.
    #[instrument(skip(self, requirement), fields(pid = %pid))]
    pub async fn register(
        &self,
        pid: ProcessId,
        requirement: ResourceRequirement,
    ) -> SupervisorResult<Registered> {
        requirement.validate().map_err(BrokerError::from)?;

        let registration = self
            .table
            .insert_new(pid, requirement.clone())
            .ok_or(SupervisorError::AlreadyRegistered(pid))?;

        match self.broker.claim(pid, &requirement).await {
            Ok(assignment) => {
                info!(assignment_id = %assignment.id, "Client registered");
                self.emit(CorralEvent::ClientRegistered { process_id: pid });
                Ok(Registered {
                    registration: self.table.get(pid).unwrap_or(registration),
                    assignment,
                })
            }
            Err(err) => {
                self.table.remove(pid);
                warn!(error = %err, "Client registration rejected");
                self.emit(CorralEvent::ClientRejected {
                    process_id: pid,
                    reason: err.to_string(),
                });
                Err(err.into())
            }
        }
    }

    /// Record a liveness signal.
    pub fn heartbeat(&self, pid: ProcessId) -> SupervisorResult<ClientRegistration> {
        self.heartbeat_at(pid, Utc::now())
    }

    pub fn heartbeat_at(
        &self,
        pid: ProcessId,
        now: DateTime<Utc>,
    ) -> SupervisorResult<ClientRegistration> {
        let before = self
            .table
            .update(pid, |r| {
                if r.status == RegistrationStatus::Lost {
                    return None;
                }
                let before = r.status;
                r.touch(now);
                Some(before)
            })
            .flatten()
            .ok_or(SupervisorError::UnknownProcess(pid))?;

        if before == RegistrationStatus::Degraded {
            info!(pid = %pid, "Client recovered");
            self.emit(CorralEvent::ClientRecovered { process_id: pid });
        } else {
            debug!(pid = %pid, "Heartbeat");
        }

        self.table
            .get(pid)
            .ok_or(SupervisorError::UnknownProcess(pid))
    }

    /// Claim more units for an already registered process.
    #[instrument(skip(self, requirement), fields(pid = %pid))]
    pub async fn claim(
        &self,
        pid: ProcessId,
        requirement: &ResourceRequirement,
    ) -> SupervisorResult<Assignment> {
        if self.table.get(pid).is_none() {
            return Err(SupervisorError::UnknownProcess(pid));
        }
        Ok(self.broker.claim(pid, requirement).await?)
    }

    /// Release one assignment of a registered process.
    #[instrument(skip(self), fields(pid = %pid, assignment_id = %assignment_id))]
    pub async fn release(
        &self,
        pid: ProcessId,
        assignment_id: AssignmentId,
    ) -> SupervisorResult<ReleaseOutcome> {
        if self.table.get(pid).is_none() {
            return Err(SupervisorError::UnknownProcess(pid));
        }
        match self.broker.assignment(assignment_id).await {
            None => Ok(ReleaseOutcome::Unknown),
            Some(a) if a.process_id != pid => Err(SupervisorError::NotOwner {
                process_id: pid,
                assignment_id,
            }),
            Some(_) => Ok(self.broker.release(assignment_id).await?),
        }
    }

    /// Graceful exit: revoke everything the process holds and forget it.
    #[instrument(skip(self), fields(pid = %pid))]
    pub async fn deregister(&self, pid: ProcessId) -> SupervisorResult<ExitSummary> {
        let was = self
            .table
            .update(pid, |r| {
                let was = r.status;
                if r.status.allows_claims() {
                    r.status = RegistrationStatus::Exiting;
                }
                was
            })
            .ok_or(SupervisorError::UnknownProcess(pid))?;
        if !was.allows_claims() {
            // Another deregistration or the sweep is already tearing it down.
            return Err(SupervisorError::UnknownProcess(pid));
        }

        let revoked = match self.broker.revoke_all(pid, "client deregistered").await {
            Ok(revoked) => revoked,
            Err(err) => {
                error!(error = %err, "Revocation on deregistration failed");
                self.abort_exit(pid, was);
                return Err(err.into());
            }
        };
        self.table.remove(pid);

        info!(revoked = revoked.len(), "Client exited");
        self.emit(CorralEvent::ClientExited {
            process_id: pid,
            kind: ExitKind::Graceful,
            revoked: revoked.len(),
        });
        Ok(ExitSummary {
            process_id: pid,
            revoked,
        })
    }

    /// Put an EXITING client back to `was` so that a later deregistration or
    /// sweep can retry the revocation.
    fn abort_exit(&self, pid: ProcessId, was: RegistrationStatus) {
        let restored = self
            .table
            .update(pid, |r| {
                if r.status == RegistrationStatus::Exiting {
                    r.status = was;
                    true
                } else {
                    false
                }
            })
            .unwrap_or(false);
        if restored {
            warn!(pid = %pid, status = ?was, "Client exit aborted");
        }
    }

    /// Run one liveness sweep against the current time.
    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(Utc::now()).await
    }

    /// Run one liveness sweep as of `now`.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let timeout = self.config.liveness_timeout;
        let mut report = SweepReport::default();

        let candidates: Vec<(ProcessId, RegistrationStatus, Duration)> = self
            .table
            .all()
            .into_iter()
            .map(|r| {
                let silent = r.since_heartbeat(now).to_std().unwrap_or(Duration::ZERO);
                (r.process_id, r.status, silent)
            })
            .collect();

        for (pid, status, silent) in candidates {
            if status == RegistrationStatus::Exiting {
                continue;
            }

            let reason = if !self.probe.is_alive(pid) {
                Some("process no longer exists".to_string())
            } else if silent > timeout || status == RegistrationStatus::Lost {
                Some(format!("no heartbeat for {}ms", silent.as_millis()))
            } else {
                None
            };

            if let Some(reason) = reason {
                if self.declare_lost(pid, &reason).await {
                    report.lost.push(pid);
                } else {
                    report.retry.push(pid);
                }
            } else if silent > timeout / 2 && status == RegistrationStatus::Registered {
                let degraded = self
                    .table
                    .update(pid, |r| {
                        // A heartbeat may have landed since the snapshot.
                        if r.status == RegistrationStatus::Registered
                            && r.since_heartbeat(now).to_std().unwrap_or(Duration::ZERO)
                                > timeout / 2
                        {
                            r.status = RegistrationStatus::Degraded;
                            true
                        } else {
                            false
                        }
                    })
                    .unwrap_or(false);
                if degraded {
                    warn!(pid = %pid, silent_ms = silent.as_millis() as u64, "Client degraded");
                    self.emit(CorralEvent::ClientDegraded {
                        process_id: pid,
                        silent_for_ms: silent.as_millis() as i64,
                    });
                    report.degraded.push(pid);
                }
            }
        }

        report
    }

    /// Mark `pid` LOST and revoke everything it holds. Returns false if the
    /// revocation failed and must be retried.
    async fn declare_lost(&self, pid: ProcessId, reason: &str) -> bool {
        let marked = self.table.update(pid, |r| match r.status {
            RegistrationStatus::Exiting => false,
            _ => {
                r.status = RegistrationStatus::Lost;
                true
            }
        });
        match marked {
            None => return true,
            Some(false) => {
                debug!(pid = %pid, "Client is exiting, leaving it to deregistration");
                return true;
            }
            Some(true) => {}
        }

        match self.broker.revoke_all(pid, reason).await {
            Ok(revoked) => {
                self.table.remove(pid);
                warn!(pid = %pid, reason, revoked = revoked.len(), "Client lost");
                self.emit(CorralEvent::ClientLost {
                    process_id: pid,
                    reason: reason.to_string(),
                });
                true
            }
            Err(err) => {
                error!(pid = %pid, error = %err, "Revoking lost client failed, will retry");
                false
            }
        }
    }

    /// Sweep every `sweep_interval` until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.sweep_interval);
        info!(
            interval_ms = self.config.sweep_interval.as_millis() as u64,
            timeout_ms = self.config.liveness_timeout.as_millis() as u64,
            "Liveness sweep started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.sweep().await;
                    if !report.lost.is_empty() || !report.retry.is_empty() {
                        debug!(?report, "Sweep finished");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Liveness sweep stopped");
    }
}

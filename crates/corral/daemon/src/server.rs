//! Server setup and lifecycle management

use crate::api::create_router;
use crate::api::rest::state::AppState;
use crate::config::DaemonConfig;
use crate::error::{DaemonError, DaemonResult};
use corral_broker::DescriptorStore;
use corral_enforce::isolation::{pin_current_process, reserve_hugepages};
use corral_enforce::{EnforcementEngine, HostControl, ProcessProbe, RecordingHostControl};
use corral_supervisor::Supervisor;
use corral_types::{CorralEvent, CorralEventEnvelope, EventSeverity, HostTopology};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

/// Corral Daemon Server
pub struct Server {
    config: DaemonConfig,
    supervisor: Arc<Supervisor>,
}

impl Server {
    /// Load the topology, isolate the manager and assemble the supervisor.
    ///
    /// Every failure here is startup-fatal.
    pub fn new(config: DaemonConfig) -> DaemonResult<Self> {
        let topology = HostTopology::from_file(&config.topology_path)?;
        info!(
            path = %config.topology_path.display(),
            cpus = topology.cpus.len(),
            bands = topology.priority_bands.len(),
            "Host topology loaded"
        );

        let (host, probe) = host_control(&config, &topology)?;
        isolate(&config, &topology, host.as_ref())?;

        let store = Arc::new(DescriptorStore::initialize(&topology)?);
        let engine = Arc::new(EnforcementEngine::new(
            host,
            config.enforcement.to_engine_config(),
        ));

        let supervisor = Supervisor::assemble(
            config.supervisor.to_supervisor_config(),
            config.broker.to_broker_config(),
            store,
            engine,
            probe,
        );

        Ok(Self {
            config,
            supervisor: Arc::new(supervisor),
        })
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// Run the server until a shutdown signal or a fatal condition.
    pub async fn run(self) -> DaemonResult<()> {
        let addr = self.config.server.listen_addr;

        let state = AppState::new(self.supervisor.clone(), self.config.enforcement.dry_run);
        let app = create_router(state, &self.config.server);

        let listener = TcpListener::bind(addr).await?;
        info!("Corral daemon listening on {}", addr);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (fatal_tx, fatal_rx) = watch::channel::<Option<String>>(None);

        let sweeper = tokio::spawn(self.supervisor.clone().run(shutdown_rx.clone()));
        let events = tokio::spawn(watch_events(
            self.supervisor.subscribe(),
            fatal_tx,
            shutdown_rx,
        ));

        let mut fatal_signal = fatal_rx.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                tokio::select! {
                    _ = shutdown_signal() => {}
                    _ = fatal_condition(&mut fatal_signal) => {
                        error!("Fatal condition, initiating shutdown");
                    }
                }
            })
            .await
            .map_err(|e| DaemonError::Server(e.to_string()))?;

        info!("Corral daemon shutting down");

        let _ = shutdown_tx.send(true);
        let _ = sweeper.await;
        let _ = events.await;

        let fatal = fatal_rx.borrow().clone();
        match fatal {
            Some(reason) => Err(DaemonError::Fatal(reason)),
            None => Ok(()),
        }
    }
}

/// Pick the host backend: in-memory for dry runs, the real host otherwise.
fn host_control(
    config: &DaemonConfig,
    topology: &HostTopology,
) -> DaemonResult<(Arc<dyn HostControl>, Arc<dyn ProcessProbe>)> {
    if config.enforcement.dry_run {
        warn!("Dry run: host directives are recorded in memory, not applied");
        let cores = topology.cpus.iter().copied().chain(topology.manager_cpu);
        let recorder = Arc::new(RecordingHostControl::permissive(cores));
        let host: Arc<dyn HostControl> = recorder.clone();
        let probe: Arc<dyn ProcessProbe> = recorder;
        return Ok((host, probe));
    }

    system_host_control()
}

#[cfg(target_os = "linux")]
fn system_host_control() -> DaemonResult<(Arc<dyn HostControl>, Arc<dyn ProcessProbe>)> {
    let linux = Arc::new(corral_enforce::LinuxHostControl::new());
    if !linux.has_privilege() {
        return Err(DaemonError::Privilege(
            "enforcement requires effective uid 0; run as root or pass --dry-run".to_string(),
        ));
    }

    let host: Arc<dyn HostControl> = linux.clone();
    let probe: Arc<dyn ProcessProbe> = linux;
    Ok((host, probe))
}

#[cfg(not(target_os = "linux"))]
fn system_host_control() -> DaemonResult<(Arc<dyn HostControl>, Arc<dyn ProcessProbe>)> {
    Err(DaemonError::Privilege(
        "host enforcement is only supported on Linux; pass --dry-run".to_string(),
    ))
}

/// Move the manager onto its own core and reserve hugepages, when the
/// topology asks for either.
fn isolate(
    config: &DaemonConfig,
    topology: &HostTopology,
    host: &dyn HostControl,
) -> DaemonResult<()> {
    if let Some(core) = topology.manager_cpu {
        pin_current_process(host, core)?;
    }

    if let Some(spec) = &topology.hugepages {
        if config.enforcement.dry_run {
            info!(
                size_kb = spec.size_kb,
                count = spec.count,
                "Dry run: skipping hugepage reservation"
            );
        } else {
            reserve_hugepages(spec, &config.sysfs_root)?;
        }
    }

    Ok(())
}

/// Log every event and report the first fatal condition on `fatal_tx`.
async fn watch_events(
    mut events: broadcast::Receiver<CorralEventEnvelope>,
    fatal_tx: watch::Sender<Option<String>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(envelope) => {
                    log_event(&envelope);
                    if let CorralEvent::FatalCondition { reason } = &envelope.event {
                        fatal_tx.send_if_modified(|current| {
                            if current.is_none() {
                                *current = Some(reason.clone());
                                true
                            } else {
                                false
                            }
                        });
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event log lagging, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

fn log_event(envelope: &CorralEventEnvelope) {
    let source = envelope.source;
    let event = &envelope.event;
    match envelope.severity {
        EventSeverity::Critical | EventSeverity::Error => {
            error!(?source, ?event, "Corral event")
        }
        EventSeverity::Warning => warn!(?source, ?event, "Corral event"),
        EventSeverity::Info => info!(?source, ?event, "Corral event"),
        EventSeverity::Debug => debug!(?source, ?event, "Corral event"),
    }
}

/// Resolves once a fatal condition has been reported.
async fn fatal_condition(fatal: &mut watch::Receiver<Option<String>>) {
    if fatal.wait_for(|reason| reason.is_some()).await.is_err() {
        // Event watcher gone without a fatal report.
        std::future::pending::<()>().await;
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}

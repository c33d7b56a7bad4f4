/// Orchestrator module - coordinates all components
///
/// The orchestrator wires storage, ISP classification and the probe engine
/// together and owns the lifetime of the two background activities: the
/// monitoring cycle and the endpoint retention cleanup. Both stop when the
/// shared cancellation token fires.
pub mod retention;


pub use retention::{RetentionCleanup, RetentionPolicy};

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::database::{Database, DatabaseImpl, initialize_database};
use crate::isp::{Classifier, DnsTxtResolver, IspRules};
use crate::monitoring::{
    CycleSnapshot, IcmpProber, MonitorHandle, MonitoringExecutor, MonitoringScheduler, Prober,
};
use crate::pool::LibsqlPool;
use crate::registry::EndpointRegistry;

/// Main orchestrator for the connectivity check service
pub struct Orchestrator {
    config: Arc<Config>,
    database: Arc<dyn Database>,
    classifier: Arc<Classifier>,
    /// Opened on `start` unless supplied up front
    prober: Option<Arc<dyn Prober>>,
    monitor: MonitorHandle,
    /// Taken by the scheduler on `start`
    state_tx: Option<watch::Sender<CycleSnapshot>>,
    cancel: CancellationToken,
    task_handles: Vec<JoinHandle<()>>,
}

impl Orchestrator {
    /// Prepare storage and load the ASN rules.
    ///
    /// ICMP sockets are not opened here, so storage-only commands work
    /// without raw socket privileges. A rules file that is configured but
    /// cannot be loaded is fatal.
    pub async fn new(config: Config, pool: LibsqlPool) -> Result<Self> {
        let conn = pool.get().await.context("Failed to get database connection")?;
        info!("Initializing database schema...");
        initialize_database(&conn).await?;
        drop(conn);

        let database: Arc<dyn Database> = Arc::new(DatabaseImpl::new_from_pool(pool));

        let classifier = Arc::new(Classifier::new(Arc::new(DnsTxtResolver::new())));
        match &config.isp.rules_path {
            Some(path) => {
                let rules = IspRules::load(path)
                    .with_context(|| format!("Failed to load ISP rules from {}", path.display()))?;
                if rules.is_empty() {
                    warn!("{} has no valid ASN rules; every registration will be rejected", path.display());
                } else {
                    info!("Loaded {} ISP rules ({} allowed ISPs)", rules.len(), rules.allowed_isps().len());
                }
                classifier.load_rules(rules);
            }
            None => warn!("No ISP rules configured; every registration will be rejected"),
        }

        Ok(Self::assemble(Arc::new(config), database, classifier, None))
    }

    /// Assemble an orchestrator from already-built parts
    pub fn with_components(
        config: Arc<Config>,
        database: Arc<dyn Database>,
        classifier: Arc<Classifier>,
        prober: Arc<dyn Prober>,
    ) -> Self {
        Self::assemble(config, database, classifier, Some(prober))
    }

    fn assemble(
        config: Arc<Config>,
        database: Arc<dyn Database>,
        classifier: Arc<Classifier>,
        prober: Option<Arc<dyn Prober>>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(CycleSnapshot::default());
        let monitor = MonitorHandle::new(state_rx, config.scheduler_settings().cycle_interval);

        Self {
            config,
            database,
            classifier,
            prober,
            monitor,
            state_tx: Some(state_tx),
            cancel: CancellationToken::new(),
            task_handles: Vec::new(),
        }
    }

    /// Open the prober if needed and spawn the monitoring and retention
    /// loops. A second call is a no-op.
    pub fn start(&mut self) -> Result<()> {
        if self.state_tx.is_none() {
            warn!("Orchestrator already started");
            return Ok(());
        }

        let prober = match self.prober.clone() {
            Some(prober) => prober,
            None => {
                let prober: Arc<dyn Prober> = Arc::new(IcmpProber::new(&self.config.probe_settings())?);
                if self.config.monitoring.privileged {
                    info!("Using raw ICMP sockets for ping");
                }
                self.prober = Some(prober.clone());
                prober
            }
        };
        let Some(state_tx) = self.state_tx.take() else {
            return Ok(());
        };

        info!("Starting monitoring scheduler...");
        let executor = Arc::new(MonitoringExecutor::new(prober, self.database.clone()));
        let scheduler = MonitoringScheduler::publishing_to(
            executor,
            self.database.clone(),
            self.config.scheduler_settings(),
            state_tx,
        );
        self.task_handles.push(scheduler.spawn(self.cancel.child_token()));

        let policy = self.config.retention_policy();
        info!(
            "Starting retention cleanup (expire after {}d, every {:?})",
            policy.expire_days, policy.cleanup_interval
        );
        let cleanup = RetentionCleanup::new(self.database.clone(), policy);
        self.task_handles.push(cleanup.start_periodic_cleanup(self.cancel.child_token()));
        Ok(())
    }

    pub fn registry(&self) -> EndpointRegistry {
        EndpointRegistry::new(self.database.clone(), self.classifier.clone())
    }

    pub fn monitor(&self) -> MonitorHandle {
        self.monitor.clone()
    }

    pub fn classifier(&self) -> Arc<Classifier> {
        self.classifier.clone()
    }

    pub fn database(&self) -> Arc<dyn Database> {
        self.database.clone()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel background work and wait for both loops to exit
    pub async fn shutdown(self) {
        info!("Shutting down orchestrator...");
        self.cancel.cancel();
        for handle in self.task_handles {
            if let Err(e) = handle.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
        info!("Orchestrator stopped");
    }
}

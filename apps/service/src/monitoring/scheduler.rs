use anyhow::{Context, Result};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

use super::executor::MonitoringExecutor;
use super::handle::{CycleSnapshot, MonitorHandle};
use super::outage::analyze_isp_outages;
use super::types::{CycleResult, CycleSummary};
use crate::database::Database;
use crate::database::models::{Endpoint, EndpointStatus, EventType};

/// Upper bound on concurrent endpoint probes within a cycle
pub const MAX_WORKERS: usize = 50;

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub cycle_interval: Duration,
    pub max_workers: usize,
    /// Used when the settings table carries no valid override
    pub outage_threshold: f64,
    /// Age after which events and uptime snapshots are pruned
    pub history_retention: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            cycle_interval: Duration::from_secs(60),
            max_workers: MAX_WORKERS,
            outage_threshold: 0.5,
            history_retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

/// Monitoring scheduler - runs probe cycles over the whole endpoint population
pub struct MonitoringScheduler {
    executor: Arc<MonitoringExecutor>,
    database: Arc<dyn Database>,
    settings: SchedulerSettings,
    outages: HashMap<String, bool>,
    cycles_completed: u64,
    state_tx: watch::Sender<CycleSnapshot>,
}

impl MonitoringScheduler {
    pub fn new(
        executor: Arc<MonitoringExecutor>,
        database: Arc<dyn Database>,
        settings: SchedulerSettings,
    ) -> (Self, MonitorHandle) {
        let (state_tx, state_rx) = watch::channel(CycleSnapshot::default());
        let handle = MonitorHandle::new(state_rx, settings.cycle_interval);
        (Self::publishing_to(executor, database, settings, state_tx), handle)
    }

    /// Build a scheduler that publishes to an existing handle's channel
    pub(crate) fn publishing_to(
        executor: Arc<MonitoringExecutor>,
        database: Arc<dyn Database>,
        settings: SchedulerSettings,
        state_tx: watch::Sender<CycleSnapshot>,
    ) -> Self {
        Self {
            executor,
            database,
            settings,
            outages: HashMap::new(),
            cycles_completed: 0,
            state_tx,
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    /// Run a cycle immediately, then once per interval until cancelled.
    /// A cycle already under way is allowed to finish.
    pub async fn run(mut self, cancel: CancellationToken) {
        tracing::info!(
            "Monitoring scheduler started (interval {:?}, up to {} workers)",
            self.settings.cycle_interval,
            self.settings.max_workers
        );

        let mut ticker = interval(self.settings.cycle_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let started = Instant::now();
            match self.run_cycle().await {
                Ok(summary) => tracing::info!(
                    "Cycle {} finished in {:?}: {} endpoints, {} up, {} down",
                    self.cycles_completed,
                    started.elapsed(),
                    summary.total,
                    summary.up,
                    summary.down
                ),
                Err(e) => tracing::error!("Monitoring cycle failed: {:#}", e),
            }
        }

        tracing::info!("Monitoring scheduler stopped");
    }

    /// Probe every endpoint, persist the results and re-judge ISP outages
    pub async fn run_cycle(&mut self) -> Result<CycleSummary> {
        let endpoints = self
            .database
            .list_all_endpoints()
            .await
            .context("Failed to list endpoints")?;

        let results = self.probe_all(endpoints).await;

        let mut summary = CycleSummary { total: results.len(), ..Default::default() };
        for result in &results {
            let status = result.outcome.status;
            tracing::debug!(
                "Endpoint {} is {} (rtt {:?})",
                result.endpoint.id,
                status,
                result.outcome.rtt
            );
            if status == EndpointStatus::Up {
                summary.up += 1;
            } else {
                summary.down += 1;
            }

            if self.record_transition(&result.endpoint, status).await {
                summary.status_events += 1;
            }

            if let Err(e) = self
                .database
                .update_endpoint_status(&result.endpoint.id, status, result.outcome.last_ok)
                .await
            {
                tracing::warn!("Failed to store status of {}: {}", result.endpoint.id, e);
            }
        }

        self.record_history(&summary).await;

        let threshold = self.database.outage_threshold(self.settings.outage_threshold).await;
        match self.database.list_all_endpoints().await {
            Ok(current) => {
                let next = analyze_isp_outages(self.database.as_ref(), &current, threshold).await;
                summary.outage_events = self.apply_outages(next).await;
            }
            Err(e) => tracing::warn!("Skipping outage analysis, keeping previous state: {}", e),
        }

        self.cycles_completed += 1;
        self.state_tx.send_replace(CycleSnapshot {
            outages: self.outages.clone(),
            last_cycle: Some(SystemTime::now()),
            cycles_completed: self.cycles_completed,
        });

        Ok(summary)
    }

    /// Fan endpoints out over a bounded worker pool and wait for every result
    async fn probe_all(&self, endpoints: Vec<Endpoint>) -> Vec<CycleResult> {
        if endpoints.is_empty() {
            return Vec::new();
        }

        let worker_count = self.settings.max_workers.clamp(1, MAX_WORKERS).min(endpoints.len());
        let (job_tx, job_rx) = mpsc::channel::<Endpoint>(endpoints.len());
        let (result_tx, mut result_rx) = mpsc::channel::<CycleResult>(endpoints.len());
        let job_rx = Arc::new(Mutex::new(job_rx));

        let mut workers = JoinSet::new();
        for _ in 0..worker_count {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            let executor = self.executor.clone();
            workers.spawn(async move {
                loop {
                    let next = job_rx.lock().await.recv().await;
                    let Some(endpoint) = next else { break };
                    let outcome = executor.monitor_endpoint(&endpoint).await;
                    if result_tx.send(CycleResult { endpoint, outcome }).await.is_err() {
                        break;
                    }
                }
            });
        }
        drop(result_tx);

        for endpoint in endpoints {
            if job_tx.send(endpoint).await.is_err() {
                break;
            }
        }
        drop(job_tx);

        let mut results = Vec::new();
        while let Some(result) = result_rx.recv().await {
            results.push(result);
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                tracing::error!("Probe worker failed: {}", e);
            }
        }

        results
    }

    /// Append an up/down event when a known status changed
    async fn record_transition(&self, endpoint: &Endpoint, new_status: EndpointStatus) -> bool {
        let old_status = endpoint.status;
        if old_status == new_status || old_status == EndpointStatus::Unknown {
            return false;
        }

        let (event_type, message) = match new_status {
            EndpointStatus::Down => (
                EventType::Down,
                format!("Endpoint {} ({}) went down", endpoint.id, endpoint.isp),
            ),
            EndpointStatus::Up => (
                EventType::Up,
                format!("Endpoint {} ({}) is back up", endpoint.id, endpoint.isp),
            ),
            EndpointStatus::Unknown | EndpointStatus::Unreachable => return false,
        };

        if let Err(e) = self
            .database
            .append_event(event_type, Some(&endpoint.isp), Some(&endpoint.id), &message)
            .await
        {
            tracing::warn!("Failed to record {} event for {}: {}", event_type, endpoint.id, e);
        }
        true
    }

    async fn record_history(&self, summary: &CycleSummary) {
        if let Err(e) = self
            .database
            .append_uptime_snapshot(summary.total, summary.up, summary.down)
            .await
        {
            tracing::warn!("Failed to record uptime snapshot: {}", e);
        }

        let retention = self.settings.history_retention;
        match self.database.delete_snapshots_older_than(retention).await {
            Ok(0) => {}
            Ok(n) => tracing::debug!("Pruned {} uptime snapshots", n),
            Err(e) => tracing::warn!("Failed to prune uptime history: {}", e),
        }
        match self.database.delete_events_older_than(retention).await {
            Ok(0) => {}
            Ok(n) => tracing::debug!("Pruned {} events", n),
            Err(e) => tracing::warn!("Failed to prune events: {}", e),
        }
    }

    /// Emit outage/recovery events for flipped ISPs and adopt `next`
    async fn apply_outages(&mut self, next: HashMap<String, bool>) -> usize {
        let isps: BTreeSet<String> = self.outages.keys().chain(next.keys()).cloned().collect();

        let mut emitted = 0;
        for isp in isps {
            let was = self.outages.get(&isp).copied().unwrap_or(false);
            let now = next.get(&isp).copied().unwrap_or(false);
            let (event_type, message) = match (was, now) {
                (false, true) => {
                    tracing::warn!("ISP outage detected: {}", isp);
                    (EventType::Outage, format!("Outage detected for {}", isp))
                }
                (true, false) => {
                    tracing::info!("ISP recovered: {}", isp);
                    (EventType::Recovery, format!("{} has recovered", isp))
                }
                _ => continue,
            };

            if let Err(e) = self.database.append_event(event_type, Some(&isp), None, &message).await {
                tracing::warn!("Failed to record {} event for {}: {}", event_type, isp, e);
            }
            emitted += 1;
        }

        self.outages = next;
        emitted
    }
}

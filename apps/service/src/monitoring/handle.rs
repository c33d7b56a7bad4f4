use std::collections::HashMap;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;

/// State published by the scheduler at the end of every cycle
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleSnapshot {
    /// Outage flag per judged ISP
    pub outages: HashMap<String, bool>,
    pub last_cycle: Option<SystemTime>,
    pub cycles_completed: u64,
}

/// Read-only view of the scheduler for status queries.
///
/// Cloning is cheap; every clone observes the same published snapshot.
#[derive(Debug, Clone)]
pub struct MonitorHandle {
    rx: watch::Receiver<CycleSnapshot>,
    cycle_interval: Duration,
    start_time: SystemTime,
}

impl MonitorHandle {
    pub(crate) fn new(rx: watch::Receiver<CycleSnapshot>, cycle_interval: Duration) -> Self {
        Self { rx, cycle_interval, start_time: SystemTime::now() }
    }

    pub fn is_isp_in_outage(&self, isp: &str) -> bool {
        self.rx.borrow().outages.get(isp).copied().unwrap_or(false)
    }

    pub fn is_any_isp_in_outage(&self) -> bool {
        self.rx.borrow().outages.values().any(|&flag| flag)
    }

    /// ISPs currently flagged, sorted
    pub fn isps_in_outage(&self) -> Vec<String> {
        let mut isps: Vec<String> = self
            .rx
            .borrow()
            .outages
            .iter()
            .filter(|&(_, &flag)| flag)
            .map(|(isp, _)| isp.clone())
            .collect();
        isps.sort();
        isps
    }

    pub fn last_cycle_time(&self) -> Option<SystemTime> {
        self.rx.borrow().last_cycle
    }

    pub fn cycle_interval(&self) -> Duration {
        self.cycle_interval
    }

    /// Last cycle plus the interval, or now when no cycle has finished yet
    pub fn next_cycle_estimate(&self) -> SystemTime {
        match self.last_cycle_time() {
            Some(last) => last + self.cycle_interval,
            None => SystemTime::now(),
        }
    }

    pub fn total_cycles_completed(&self) -> u64 {
        self.rx.borrow().cycles_completed
    }

    pub fn start_time(&self) -> SystemTime {
        self.start_time
    }

    /// Wait until the scheduler publishes another cycle
    pub async fn changed(&mut self) -> Result<(), watch::error::RecvError> {
        self.rx.changed().await
    }
}

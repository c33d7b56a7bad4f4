/// Monitoring engine module - probes endpoints and infers ISP outages
///
/// This module is responsible for:
/// - ICMP ping and traceroute probing
/// - Hop fallback for endpoints that stop answering
/// - Scheduling probe cycles over a bounded worker pool
/// - Judging per-ISP outages from the cycle results
pub mod checker;
pub mod executor;
pub mod handle;
pub mod outage;
pub mod scheduler;
#[cfg(test)]
pub mod testing;
pub mod traceroute;
pub mod types;

pub use checker::{IcmpProber, ProbeSettings, Prober};
pub use executor::MonitoringExecutor;
pub use handle::{CycleSnapshot, MonitorHandle};
pub use scheduler::{MonitoringScheduler, SchedulerSettings};
pub use types::{CycleSummary, LastHop, PingResult, TracerouteResult};

use std::sync::Arc;
use std::time::SystemTime;

use super::checker::Prober;
use super::types::{LastHop, ProbeOutcome};
use crate::database::Database;
use crate::database::models::{Endpoint, EndpointStatus};

/// Monitoring executor - decides one endpoint's status for the current cycle
pub struct MonitoringExecutor {
    prober: Arc<dyn Prober>,
    database: Arc<dyn Database>,
}

impl MonitoringExecutor {
    pub fn new(prober: Arc<dyn Prober>, database: Arc<dyn Database>) -> Self {
        Self { prober, database }
    }

    /// Ping the probe target; when that fails on an endpoint not yet in hop
    /// mode, traceroute to it and fall back to the last responding hop.
    pub async fn monitor_endpoint(&self, endpoint: &Endpoint) -> ProbeOutcome {
        let target = endpoint.probe_target();
        let ping = self.prober.ping(target).await;
        if ping.success {
            return Self::up(ping.avg_rtt, None);
        }
        tracing::debug!(
            "Ping to {} ({}) failed: {}",
            endpoint.id,
            target,
            ping.error.as_deref().unwrap_or("unknown error")
        );

        let mut new_hop = None;
        if !endpoint.use_hop {
            match self.prober.find_last_responding_hop(endpoint.address).await {
                Some(hop) if hop.reached_destination => return Self::up(None, None),
                Some(hop) => {
                    self.record_hop(endpoint, hop).await;
                    new_hop = Some(hop);
                    let hop_ping = self.prober.ping(hop.address).await;
                    if hop_ping.success {
                        return Self::up(hop_ping.avg_rtt, new_hop);
                    }
                }
                None => {}
            }
        }

        let ever_answered = endpoint.use_hop || new_hop.is_some() || endpoint.last_ok.is_some();
        ProbeOutcome {
            status: if ever_answered { EndpointStatus::Down } else { EndpointStatus::Unreachable },
            last_ok: None,
            new_hop,
            rtt: None,
        }
    }

    async fn record_hop(&self, endpoint: &Endpoint, hop: LastHop) {
        tracing::info!(
            "Endpoint {} does not answer ping, monitoring hop {} at distance {}",
            endpoint.id,
            hop.address,
            hop.distance
        );
        if let Err(e) = self
            .database
            .update_monitored_hop(&endpoint.id, hop.address, hop.distance)
            .await
        {
            tracing::error!("Failed to record monitored hop for {}: {}", endpoint.id, e);
        }
    }

    fn up(rtt: Option<std::time::Duration>, new_hop: Option<LastHop>) -> ProbeOutcome {
        ProbeOutcome {
            status: EndpointStatus::Up,
            last_ok: Some(SystemTime::now()),
            new_hop,
            rtt,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::memory::MemoryDatabase;
    use crate::monitoring::testing::FakeProber;
    use std::net::Ipv4Addr;

    const HOST: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 10);
    const ROUTER: Ipv4Addr = Ipv4Addr::new(198, 51, 100, 1);

    fn setup(endpoint: Endpoint) -> (MonitoringExecutor, Arc<FakeProber>, Arc<MemoryDatabase>) {
        let prober = Arc::new(FakeProber::new());
        let db = Arc::new(MemoryDatabase::with_endpoints([endpoint]));
        let executor = MonitoringExecutor::new(prober.clone(), db.clone());
        (executor, prober, db)
    }

    #[tokio::test]
    async fn test_answering_endpoint_is_up() {
        let ep = Endpoint::new("CCC-Endpoint-1".into(), HOST, "Acme".into());
        let (executor, prober, _db) = setup(ep.clone());
        prober.set_up(HOST, true);

        let outcome = executor.monitor_endpoint(&ep).await;
        assert_eq!(outcome.status, EndpointStatus::Up);
        assert!(outcome.last_ok.is_some());
        assert_eq!(outcome.rtt, Some(std::time::Duration::from_millis(12)));
        assert_eq!(prober.trace_count(), 0);
    }

    #[tokio::test]
    async fn test_silent_endpoint_switches_to_hop() {
        let ep = Endpoint::new("CCC-Endpoint-1".into(), HOST, "Acme".into());
        let (executor, prober, db) = setup(ep.clone());
        prober.set_path(HOST, ROUTER, 4, false);
        prober.set_up(ROUTER, true);

        let outcome = executor.monitor_endpoint(&ep).await;
        assert_eq!(outcome.status, EndpointStatus::Up);
        assert_eq!(outcome.new_hop.map(|h| h.address), Some(ROUTER));

        let stored = db.endpoint("CCC-Endpoint-1").unwrap();
        assert!(stored.use_hop);
        assert_eq!(stored.monitored_hop, Some(ROUTER));
        assert_eq!(stored.hop_number, 4);
        assert_eq!(stored.probe_target(), ROUTER);
    }

    #[tokio::test]
    async fn test_hop_that_fails_marks_down() {
        let ep = Endpoint::new("CCC-Endpoint-1".into(), HOST, "Acme".into());
        let (executor, prober, db) = setup(ep.clone());
        prober.set_path(HOST, ROUTER, 4, false);

        let outcome = executor.monitor_endpoint(&ep).await;
        assert_eq!(outcome.status, EndpointStatus::Down);
        assert!(outcome.last_ok.is_none());
        assert!(db.endpoint("CCC-Endpoint-1").unwrap().use_hop);
    }

    #[tokio::test]
    async fn test_traceroute_reaching_destination_is_up() {
        let ep = Endpoint::new("CCC-Endpoint-1".into(), HOST, "Acme".into());
        let (executor, prober, db) = setup(ep.clone());
        prober.set_path(HOST, HOST, 7, true);

        let outcome = executor.monitor_endpoint(&ep).await;
        assert_eq!(outcome.status, EndpointStatus::Up);
        assert!(outcome.new_hop.is_none());
        assert!(!db.endpoint("CCC-Endpoint-1").unwrap().use_hop);
    }

    #[tokio::test]
    async fn test_never_answered_is_unreachable() {
        let ep = Endpoint::new("CCC-Endpoint-1".into(), HOST, "Acme".into());
        let (executor, _prober, _db) = setup(ep.clone());

        let outcome = executor.monitor_endpoint(&ep).await;
        assert_eq!(outcome.status, EndpointStatus::Unreachable);
    }

    #[tokio::test]
    async fn test_previously_seen_endpoint_goes_down() {
        let mut ep = Endpoint::new("CCC-Endpoint-1".into(), HOST, "Acme".into());
        ep.last_ok = Some(SystemTime::now());
        let (executor, _prober, _db) = setup(ep.clone());

        let outcome = executor.monitor_endpoint(&ep).await;
        assert_eq!(outcome.status, EndpointStatus::Down);
    }

    #[tokio::test]
    async fn test_hop_mode_never_retraces() {
        let mut ep = Endpoint::new("CCC-Endpoint-1".into(), HOST, "Acme".into());
        ep.use_hop = true;
        ep.monitored_hop = Some(ROUTER);
        ep.hop_number = 3;
        let (executor, prober, _db) = setup(ep.clone());
        // The endpoint itself answering does not matter once in hop mode
        prober.set_up(HOST, true);

        let outcome = executor.monitor_endpoint(&ep).await;
        assert_eq!(outcome.status, EndpointStatus::Down);
        assert_eq!(prober.trace_count(), 0);

        prober.set_up(ROUTER, true);
        let outcome = executor.monitor_endpoint(&ep).await;
        assert_eq!(outcome.status, EndpointStatus::Up);
        assert_eq!(prober.trace_count(), 0);
    }
}

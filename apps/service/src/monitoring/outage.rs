//! Per-ISP outage inference over the endpoint population.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;

use crate::database::Database;
use crate::database::models::{Endpoint, EndpointStatus};

/// ISPs with fewer endpoints than this are never judged
pub const MIN_ENDPOINTS_PER_ISP: usize = 2;

/// Judge every ISP with enough endpoints.
///
/// An ISP is in outage when the fraction of its endpoints that are down is
/// strictly above `threshold`, or when a hop monitored by at least two of its
/// endpoints has every endpoint pointed at it (any ISP) not up. ISPs below
/// [`MIN_ENDPOINTS_PER_ISP`] are absent from the result.
pub async fn analyze_isp_outages(
    database: &dyn Database,
    endpoints: &[Endpoint],
    threshold: f64,
) -> HashMap<String, bool> {
    let mut by_isp: BTreeMap<&str, Vec<&Endpoint>> = BTreeMap::new();
    for ep in endpoints {
        by_isp.entry(ep.isp.as_str()).or_default().push(ep);
    }

    let mut outages = HashMap::new();
    for (isp, members) in by_isp {
        if members.len() < MIN_ENDPOINTS_PER_ISP {
            continue;
        }

        let mut in_outage = down_fraction(&members) > threshold;
        if !in_outage {
            for hop in shared_hops(&members) {
                if hop_is_dark(database, hop).await {
                    tracing::info!("All endpoints behind hop {} are down, flagging {}", hop, isp);
                    in_outage = true;
                    break;
                }
            }
        }
        outages.insert(isp.to_string(), in_outage);
    }
    outages
}

/// Fraction of endpoints in `down` status; unknown and unreachable do not count
pub fn down_fraction(endpoints: &[&Endpoint]) -> f64 {
    if endpoints.is_empty() {
        return 0.0;
    }
    let down = endpoints.iter().filter(|ep| ep.status == EndpointStatus::Down).count();
    down as f64 / endpoints.len() as f64
}

/// Monitored hops used by at least two of `endpoints`, in address order
pub fn shared_hops(endpoints: &[&Endpoint]) -> Vec<Ipv4Addr> {
    let mut counts: BTreeMap<Ipv4Addr, usize> = BTreeMap::new();
    for ep in endpoints {
        if let (true, Some(hop)) = (ep.use_hop, ep.monitored_hop) {
            *counts.entry(hop).or_default() += 1;
        }
    }
    counts.into_iter().filter(|&(_, n)| n >= 2).map(|(hop, _)| hop).collect()
}

async fn hop_is_dark(database: &dyn Database, hop: Ipv4Addr) -> bool {
    match database.find_endpoints_by_monitored_hop(hop).await {
        Ok(behind) => {
            behind.len() >= 2 && behind.iter().all(|ep| ep.status != EndpointStatus::Up)
        }
        Err(e) => {
            tracing::warn!("Failed to load endpoints behind hop {}: {}", hop, e);
            false
        }
    }
}

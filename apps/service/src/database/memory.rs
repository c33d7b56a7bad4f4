//! In-memory `Database` used by scheduler, registry and retention tests.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use super::models::{
    Endpoint, EndpointMetrics, EndpointStatus, Event, EventType, IspStats, UptimeSnapshot,
};
use super::repository::Database;

#[derive(Default)]
struct State {
    endpoints: BTreeMap<String, Endpoint>,
    events: Vec<Event>,
    snapshots: Vec<UptimeSnapshot>,
    settings: BTreeMap<String, String>,
    failing_status_updates: HashSet<String>,
    failing_touches: bool,
}

#[derive(Default)]
pub struct MemoryDatabase {
    state: Mutex<State>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_endpoints(endpoints: impl IntoIterator<Item = Endpoint>) -> Self {
        let db = Self::new();
        {
            let mut state = db.state.lock().unwrap();
            for ep in endpoints {
                state.endpoints.insert(ep.id.clone(), ep);
            }
        }
        db
    }

    /// Make status writes for `id` fail until further notice
    pub fn fail_status_updates_for(&self, id: &str) {
        self.state.lock().unwrap().failing_status_updates.insert(id.to_string());
    }

    /// Make every `touch_last_seen` fail
    pub fn fail_touches(&self) {
        self.state.lock().unwrap().failing_touches = true;
    }

    pub fn endpoint(&self, id: &str) -> Option<Endpoint> {
        self.state.lock().unwrap().endpoints.get(id).cloned()
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn events_of(&self, event_type: EventType) -> Vec<Event> {
        self.events().into_iter().filter(|e| e.event_type == event_type).collect()
    }

    pub fn snapshots(&self) -> Vec<UptimeSnapshot> {
        self.state.lock().unwrap().snapshots.clone()
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn list_all_endpoints(&self) -> Result<Vec<Endpoint>> {
        Ok(self.state.lock().unwrap().endpoints.values().cloned().collect())
    }

    async fn update_endpoint_status(
        &self,
        id: &str,
        status: EndpointStatus,
        last_ok: Option<SystemTime>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.failing_status_updates.contains(id) {
            return Err(anyhow!("simulated write failure for {}", id));
        }
        if let Some(ep) = state.endpoints.get_mut(id) {
            ep.status = status;
            if last_ok.is_some() {
                ep.last_ok = last_ok;
            }
        }
        Ok(())
    }

    async fn update_monitored_hop(&self, id: &str, hop: Ipv4Addr, hop_distance: u8) -> Result<()> {
        if let Some(ep) = self.state.lock().unwrap().endpoints.get_mut(id) {
            ep.monitored_hop = Some(hop);
            ep.hop_number = hop_distance;
            ep.use_hop = true;
        }
        Ok(())
    }

    async fn find_endpoints_by_monitored_hop(&self, hop: Ipv4Addr) -> Result<Vec<Endpoint>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .endpoints
            .values()
            .filter(|ep| ep.monitored_hop == Some(hop))
            .cloned()
            .collect())
    }

    async fn delete_endpoints_unseen_since(&self, cutoff: SystemTime) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        let before = state.endpoints.len();
        state.endpoints.retain(|_, ep| ep.last_seen >= cutoff);
        Ok((before - state.endpoints.len()) as u64)
    }

    async fn delete_endpoint(&self, id: &str) -> Result<bool> {
        Ok(self.state.lock().unwrap().endpoints.remove(id).is_some())
    }

    async fn append_event(
        &self,
        event_type: EventType,
        isp: Option<&str>,
        endpoint_id: Option<&str>,
        message: &str,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let id = state.events.len() as i64 + 1;
        state.events.push(Event {
            id: Some(id),
            timestamp: SystemTime::now(),
            event_type,
            isp: isp.map(str::to_string),
            endpoint_id: endpoint_id.map(str::to_string),
            message: message.to_string(),
        });
        Ok(())
    }

    async fn append_uptime_snapshot(&self, total: usize, up: usize, down: usize) -> Result<()> {
        self.state.lock().unwrap().snapshots.push(UptimeSnapshot {
            timestamp: SystemTime::now(),
            total: total as i64,
            up: up as i64,
            down: down as i64,
        });
        Ok(())
    }

    async fn delete_events_older_than(&self, max_age: Duration) -> Result<u64> {
        let cutoff = SystemTime::now().checked_sub(max_age).unwrap_or(SystemTime::UNIX_EPOCH);
        let mut state = self.state.lock().unwrap();
        let before = state.events.len();
        state.events.retain(|e| e.timestamp >= cutoff);
        Ok((before - state.events.len()) as u64)
    }

    async fn delete_snapshots_older_than(&self, max_age: Duration) -> Result<u64> {
        let cutoff = SystemTime::now().checked_sub(max_age).unwrap_or(SystemTime::UNIX_EPOCH);
        let mut state = self.state.lock().unwrap();
        let before = state.snapshots.len();
        state.snapshots.retain(|s| s.timestamp >= cutoff);
        Ok((before - state.snapshots.len()) as u64)
    }

    async fn create_endpoint(&self, endpoint: &Endpoint) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.endpoints.values().any(|ep| ep.address == endpoint.address) {
            return Err(anyhow!("address already registered"));
        }
        state.endpoints.insert(endpoint.id.clone(), endpoint.clone());
        Ok(())
    }

    async fn find_endpoint_by_address(&self, address: Ipv4Addr) -> Result<Option<Endpoint>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .endpoints
            .values()
            .find(|ep| ep.address == address)
            .cloned())
    }

    async fn touch_last_seen(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.failing_touches {
            return Err(anyhow!("simulated last_seen failure for {}", id));
        }
        if let Some(ep) = state.endpoints.get_mut(id) {
            ep.last_seen = SystemTime::now();
        }
        Ok(())
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        Ok(self.state.lock().unwrap().settings.get(key).cloned())
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.state.lock().unwrap().settings.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn recent_events(&self, since: Duration, limit: usize) -> Result<Vec<Event>> {
        let cutoff = SystemTime::now().checked_sub(since).unwrap_or(SystemTime::UNIX_EPOCH);
        let mut events: Vec<Event> =
            self.events().into_iter().filter(|e| e.timestamp >= cutoff).collect();
        events.reverse();
        events.truncate(limit);
        Ok(events)
    }

    async fn uptime_history(&self, since: Duration) -> Result<Vec<UptimeSnapshot>> {
        let cutoff = SystemTime::now().checked_sub(since).unwrap_or(SystemTime::UNIX_EPOCH);
        Ok(self.snapshots().into_iter().filter(|s| s.timestamp >= cutoff).collect())
    }

    async fn isp_stats(&self) -> Result<Vec<IspStats>> {
        let mut by_isp: BTreeMap<String, IspStats> = BTreeMap::new();
        for ep in self.state.lock().unwrap().endpoints.values() {
            let stats = by_isp
                .entry(ep.isp.clone())
                .or_insert_with(|| IspStats { name: ep.isp.clone(), ..Default::default() });
            stats.total += 1;
            match ep.status {
                EndpointStatus::Up => stats.up += 1,
                EndpointStatus::Down => stats.down += 1,
                EndpointStatus::Unknown => stats.unknown += 1,
                EndpointStatus::Unreachable => {}
            }
        }
        Ok(by_isp.into_values().collect())
    }

    async fn isp_stats_by_name(&self, isp: &str) -> Result<Option<IspStats>> {
        Ok(self.isp_stats().await?.into_iter().find(|stats| stats.name == isp))
    }

    async fn endpoint_metrics(&self) -> Result<EndpointMetrics> {
        let mut metrics = EndpointMetrics::default();
        for ep in self.state.lock().unwrap().endpoints.values() {
            metrics.total += 1;
            match ep.status {
                EndpointStatus::Up => metrics.up += 1,
                EndpointStatus::Down => metrics.down += 1,
                EndpointStatus::Unknown => metrics.unknown += 1,
                EndpointStatus::Unreachable => {}
            }
            if ep.use_hop {
                metrics.hop_monitored += 1;
            } else {
                metrics.direct += 1;
            }
        }
        Ok(metrics)
    }

    async fn shared_hop_count(&self) -> Result<u64> {
        let mut per_hop: HashMap<Ipv4Addr, usize> = HashMap::new();
        for hop in self.state.lock().unwrap().endpoints.values().filter_map(|ep| ep.monitored_hop) {
            *per_hop.entry(hop).or_default() += 1;
        }
        Ok(per_hop.values().filter(|&&count| count > 1).count() as u64)
    }
}

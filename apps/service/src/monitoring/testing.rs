//! Scriptable `Prober` for executor and scheduler tests.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::checker::Prober;
use super::types::{Hop, HopReply, PingResult, TracerouteResult};

#[derive(Default)]
pub struct FakeProber {
    answering: Mutex<HashSet<Ipv4Addr>>,
    paths: Mutex<HashMap<Ipv4Addr, (Ipv4Addr, u8, bool)>>,
    pings: AtomicUsize,
    traces: AtomicUsize,
    ping_delay: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl FakeProber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_up(&self, address: Ipv4Addr, up: bool) {
        let mut answering = self.answering.lock().unwrap();
        if up {
            answering.insert(address);
        } else {
            answering.remove(&address);
        }
    }

    /// Traceroute towards `destination` ends at `hop`, `distance` TTLs away
    pub fn set_path(&self, destination: Ipv4Addr, hop: Ipv4Addr, distance: u8, reached: bool) {
        self.paths.lock().unwrap().insert(destination, (hop, distance, reached));
    }

    /// Make every ping take `delay` before answering
    pub fn set_ping_delay(&self, delay: Duration) {
        *self.ping_delay.lock().unwrap() = Some(delay);
    }

    /// Most pings observed running at the same time
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn ping_count(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    pub fn trace_count(&self) -> usize {
        self.traces.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Prober for FakeProber {
    async fn ping(&self, address: Ipv4Addr) -> PingResult {
        self.pings.fetch_add(1, Ordering::SeqCst);
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(running, Ordering::SeqCst);
        let delay = *self.ping_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.answering.lock().unwrap().contains(&address) {
            PingResult::replied(&[Duration::from_millis(12)])
        } else {
            PingResult::failed("timeout")
        }
    }

    async fn traceroute(&self, destination: Ipv4Addr) -> TracerouteResult {
        self.traces.fetch_add(1, Ordering::SeqCst);
        let Some((hop, distance, reached)) = self.paths.lock().unwrap().get(&destination).copied() else {
            return TracerouteResult {
                hops: vec![Hop::silent(1), Hop::silent(2)],
                ..Default::default()
            };
        };

        let last = Hop {
            ttl: distance,
            address: Some(hop),
            rtt: Some(Duration::from_millis(5)),
            reply: Some(if reached { HopReply::EchoReply } else { HopReply::TimeExceeded }),
        };
        let mut hops: Vec<Hop> = (1..distance).map(Hop::silent).collect();
        hops.push(last.clone());
        TracerouteResult { hops, last_hop: Some(last), reached_destination: reached, error: None }
    }
}

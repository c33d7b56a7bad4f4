use std::net::Ipv4Addr;
use std::time::{Duration, SystemTime};

use crate::database::models::{Endpoint, EndpointStatus};

/// Outcome of one burst of ICMP echo requests
#[derive(Debug, Clone, PartialEq)]
pub struct PingResult {
    /// At least one reply came back
    pub success: bool,
    /// Mean round trip over the replies received
    pub avg_rtt: Option<Duration>,
    pub error: Option<String>,
}

impl PingResult {
    pub fn replied(rtts: &[Duration]) -> Self {
        if rtts.is_empty() {
            return Self::failed("no echo reply received");
        }
        let total: Duration = rtts.iter().sum();
        Self { success: true, avg_rtt: Some(total / rtts.len() as u32), error: None }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self { success: false, avg_rtt: None, error: Some(error.into()) }
    }
}

/// ICMP message that answered a TTL-limited probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HopReply {
    EchoReply,
    TimeExceeded,
    DestinationUnreachable,
}

impl HopReply {
    /// Whether this reply ends the trace
    pub fn reaches_destination(self) -> bool {
        matches!(self, HopReply::EchoReply | HopReply::DestinationUnreachable)
    }
}

/// One TTL step of a traceroute
#[derive(Debug, Clone, PartialEq)]
pub struct Hop {
    pub ttl: u8,
    /// `None` when nothing answered within the hop timeout
    pub address: Option<Ipv4Addr>,
    pub rtt: Option<Duration>,
    pub reply: Option<HopReply>,
}

impl Hop {
    pub fn silent(ttl: u8) -> Self {
        Self { ttl, address: None, rtt: None, reply: None }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TracerouteResult {
    pub hops: Vec<Hop>,
    /// Highest-TTL hop that answered at all
    pub last_hop: Option<Hop>,
    pub reached_destination: bool,
    pub error: Option<String>,
}

impl TracerouteResult {
    pub fn failed(error: impl Into<String>) -> Self {
        Self { error: Some(error.into()), ..Default::default() }
    }
}

/// Last answering router on the path and whether the destination was reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LastHop {
    pub address: Ipv4Addr,
    pub distance: u8,
    pub reached_destination: bool,
}

/// What one endpoint's probe produced this cycle
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub status: EndpointStatus,
    /// Set only when something answered this cycle
    pub last_ok: Option<SystemTime>,
    /// Hop recorded this cycle when the endpoint switched to hop monitoring
    pub new_hop: Option<LastHop>,
    pub rtt: Option<Duration>,
}

/// Worker → collector message
#[derive(Debug, Clone)]
pub struct CycleResult {
    pub endpoint: Endpoint,
    pub outcome: ProbeOutcome,
}

/// Totals of one completed cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub total: usize,
    pub up: usize,
    pub down: usize,
    pub status_events: usize,
    pub outage_events: usize,
}

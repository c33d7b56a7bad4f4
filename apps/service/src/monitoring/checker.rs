use anyhow::{Context, Result};
use socket2::Type;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use surge_ping::{Client as PingClient, Config as PingConfig, ICMP, PingIdentifier, PingSequence};

use super::traceroute::Tracer;
use super::types::{LastHop, PingResult, TracerouteResult};

const PING_PAYLOAD: [u8; 56] = [0u8; 56];

/// Network probing primitives used by the scheduler
#[async_trait::async_trait]
pub trait Prober: Send + Sync {
    /// Send a burst of echo requests; never fails, failures are in the result
    async fn ping(&self, address: Ipv4Addr) -> PingResult;

    /// Walk TTLs towards `destination` until it answers or hops run out
    async fn traceroute(&self, destination: Ipv4Addr) -> TracerouteResult;

    /// Last answering router, kept even when the trace ended on an error
    async fn find_last_responding_hop(&self, destination: Ipv4Addr) -> Option<LastHop> {
        let result = self.traceroute(destination).await;
        if let Some(error) = &result.error {
            tracing::debug!("Traceroute to {} ended early: {}", destination, error);
        }
        let hop = result.last_hop?;
        Some(LastHop {
            address: hop.address?,
            distance: hop.ttl,
            reached_destination: result.reached_destination,
        })
    }
}

/// Probe settings taken from the monitoring configuration
#[derive(Debug, Clone)]
pub struct ProbeSettings {
    pub ping_timeout: Duration,
    pub ping_count: u16,
    pub privileged: bool,
    pub trace_max_hops: u8,
    pub trace_hop_timeout: Duration,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            ping_timeout: Duration::from_secs(5),
            ping_count: 3,
            privileged: false,
            trace_max_hops: 30,
            trace_hop_timeout: Duration::from_secs(2),
        }
    }
}

/// ICMP prober: surge-ping for echo bursts, raw sockets for traceroute
pub struct IcmpProber {
    client: PingClient,
    tracer: Tracer,
    timeout: Duration,
    count: u16,
}

impl IcmpProber {
    pub fn new(settings: &ProbeSettings) -> Result<Self> {
        let mut builder = PingConfig::builder().kind(ICMP::V4);
        if settings.privileged {
            builder = builder.sock_type_hint(Type::RAW);
        }
        let client = PingClient::new(&builder.build())
            .context("Failed to create ICMP client (check CAP_NET_RAW or net.ipv4.ping_group_range)")?;

        Ok(Self {
            client,
            tracer: Tracer::new(settings.trace_max_hops, settings.trace_hop_timeout),
            timeout: settings.ping_timeout,
            count: settings.ping_count.max(1),
        })
    }
}

#[async_trait::async_trait]
impl Prober for IcmpProber {
    async fn ping(&self, address: Ipv4Addr) -> PingResult {
        let mut pinger = self.client.pinger(IpAddr::V4(address), PingIdentifier(rand::random())).await;
        pinger.timeout(self.timeout);

        let mut rtts = Vec::with_capacity(self.count as usize);
        let mut last_error = None;
        for seq in 0..self.count {
            match pinger.ping(PingSequence(seq), &PING_PAYLOAD).await {
                Ok((_, rtt)) => rtts.push(rtt),
                Err(e) => last_error = Some(e.to_string()),
            }
        }

        if rtts.is_empty() {
            PingResult::failed(last_error.unwrap_or_else(|| "no echo reply received".to_string()))
        } else {
            PingResult::replied(&rtts)
        }
    }

    async fn traceroute(&self, destination: Ipv4Addr) -> TracerouteResult {
        self.tracer.trace(destination).await
    }
}

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Convert SystemTime to Unix timestamp
pub fn timestamp_to_i64(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

/// Convert Unix timestamp to SystemTime
pub fn i64_to_timestamp(timestamp: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(timestamp.max(0) as u64)
}

/// Reachability state of a registered endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EndpointStatus {
    #[default]
    Unknown,
    Up,
    Down,
    /// The direct address has never answered a probe.
    Unreachable,
}

impl fmt::Display for EndpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointStatus::Unknown => write!(f, "unknown"),
            EndpointStatus::Up => write!(f, "up"),
            EndpointStatus::Down => write!(f, "down"),
            EndpointStatus::Unreachable => write!(f, "unreachable"),
        }
    }
}

impl FromStr for EndpointStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(EndpointStatus::Unknown),
            "up" => Ok(EndpointStatus::Up),
            "down" => Ok(EndpointStatus::Down),
            "unreachable" => Ok(EndpointStatus::Unreachable),
            other => Err(anyhow::anyhow!("Unknown endpoint status: {}", other)),
        }
    }
}

/// Endpoint model - one registered resident connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    /// Opaque identifier, e.g. "CCC-Endpoint-0a1b2c3d"
    pub id: String,
    /// Probed address; kept out of every serialized view
    #[serde(skip_serializing)]
    pub address: Ipv4Addr,
    pub isp: String,
    pub status: EndpointStatus,
    pub created_at: SystemTime,
    pub last_seen: SystemTime,
    pub last_ok: Option<SystemTime>,
    #[serde(skip_serializing)]
    pub monitored_hop: Option<Ipv4Addr>,
    /// TTL distance of the monitored hop (0 = direct)
    pub hop_number: u8,
    pub use_hop: bool,
}

impl Endpoint {
    /// Create a freshly registered endpoint with unknown status
    pub fn new(id: String, address: Ipv4Addr, isp: String) -> Self {
        let now = SystemTime::now();
        Self {
            id,
            address,
            isp,
            status: EndpointStatus::Unknown,
            created_at: now,
            last_seen: now,
            last_ok: None,
            monitored_hop: None,
            hop_number: 0,
            use_hop: false,
        }
    }

    /// Address the scheduler should ping this cycle
    pub fn probe_target(&self) -> Ipv4Addr {
        match (self.use_hop, self.monitored_hop) {
            (true, Some(hop)) => hop,
            _ => self.address,
        }
    }
}

/// Kind of entry in the append-only event log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Down,
    Up,
    Outage,
    Recovery,
    Registered,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Down => write!(f, "down"),
            EventType::Up => write!(f, "up"),
            EventType::Outage => write!(f, "outage"),
            EventType::Recovery => write!(f, "recovery"),
            EventType::Registered => write!(f, "registered"),
        }
    }
}

impl FromStr for EventType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "down" => Ok(EventType::Down),
            "up" => Ok(EventType::Up),
            "outage" => Ok(EventType::Outage),
            "recovery" => Ok(EventType::Recovery),
            "registered" => Ok(EventType::Registered),
            other => Err(anyhow::anyhow!("Unknown event type: {}", other)),
        }
    }
}

/// Event model - a status transition or ISP outage/recovery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Option<i64>,
    pub timestamp: SystemTime,
    pub event_type: EventType,
    pub isp: Option<String>,
    pub endpoint_id: Option<String>,
    pub message: String,
}

/// Totals recorded at the end of each completed ping cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UptimeSnapshot {
    pub timestamp: SystemTime,
    pub total: i64,
    pub up: i64,
    pub down: i64,
}

impl UptimeSnapshot {
    pub fn uptime_pct(&self) -> f64 {
        let counted = self.up + self.down;
        if counted == 0 {
            return 0.0;
        }
        self.up as f64 / counted as f64 * 100.0
    }
}

/// Aggregated per-ISP counts
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IspStats {
    pub name: String,
    pub total: i64,
    pub up: i64,
    pub down: i64,
    pub unknown: i64,
}

/// Population-wide counts, including how endpoints are being probed
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EndpointMetrics {
    pub total: i64,
    pub up: i64,
    pub down: i64,
    pub unknown: i64,
    /// Probed at their own address
    pub direct: i64,
    /// Probed through a recorded upstream hop
    pub hop_monitored: i64,
}

use anyhow::{Context, Result};
use async_trait::async_trait;
use libsql::{Row, params};
use sha2::{Digest, Sha256};
use std::net::Ipv4Addr;
use std::time::{Duration, SystemTime};

use super::models::{
    Endpoint, EndpointMetrics, EndpointStatus, Event, EventType, IspStats, UptimeSnapshot,
    i64_to_timestamp, timestamp_to_i64,
};
use crate::pool::LibsqlPool;

/// Settings key holding a runtime override of the outage threshold
pub const SETTING_OUTAGE_THRESHOLD: &str = "outage_threshold";

const ENDPOINT_COLUMNS: &str = "id, ipv4, isp, status, created_at, last_seen, last_ok, \
     COALESCE(monitored_hop, ''), COALESCE(hop_number, 0), COALESCE(use_hop, 0)";

/// SHA-256 of the dotted address, used as the lookup key
pub fn hash_address(address: Ipv4Addr) -> String {
    hex::encode(Sha256::digest(address.to_string().as_bytes()))
}

/// Database trait for abstracting database operations
#[async_trait]
pub trait Database: Send + Sync {
    /// Every registered endpoint
    async fn list_all_endpoints(&self) -> Result<Vec<Endpoint>>;

    /// Store a new status; `last_ok` of `None` keeps the previous value
    async fn update_endpoint_status(
        &self,
        id: &str,
        status: EndpointStatus,
        last_ok: Option<SystemTime>,
    ) -> Result<()>;

    /// Switch an endpoint to hop-fallback monitoring
    async fn update_monitored_hop(&self, id: &str, hop: Ipv4Addr, hop_distance: u8) -> Result<()>;

    /// Endpoints of any ISP currently pointed at `hop`
    async fn find_endpoints_by_monitored_hop(&self, hop: Ipv4Addr) -> Result<Vec<Endpoint>>;

    /// Delete endpoints whose last-seen time is before `cutoff`
    async fn delete_endpoints_unseen_since(&self, cutoff: SystemTime) -> Result<u64>;

    /// Remove one endpoint; `false` when no such id exists
    async fn delete_endpoint(&self, id: &str) -> Result<bool>;

    async fn append_event(
        &self,
        event_type: EventType,
        isp: Option<&str>,
        endpoint_id: Option<&str>,
        message: &str,
    ) -> Result<()>;

    async fn append_uptime_snapshot(&self, total: usize, up: usize, down: usize) -> Result<()>;

    async fn delete_events_older_than(&self, max_age: Duration) -> Result<u64>;

    async fn delete_snapshots_older_than(&self, max_age: Duration) -> Result<u64>;

    async fn create_endpoint(&self, endpoint: &Endpoint) -> Result<()>;

    async fn find_endpoint_by_address(&self, address: Ipv4Addr) -> Result<Option<Endpoint>>;

    async fn touch_last_seen(&self, id: &str) -> Result<()>;

    async fn get_setting(&self, key: &str) -> Result<Option<String>>;

    async fn set_setting(&self, key: &str, value: &str) -> Result<()>;

    /// Newest-first events within `since`, at most `limit`
    async fn recent_events(&self, since: Duration, limit: usize) -> Result<Vec<Event>>;

    /// Oldest-first snapshots within `since`
    async fn uptime_history(&self, since: Duration) -> Result<Vec<UptimeSnapshot>>;

    async fn isp_stats(&self) -> Result<Vec<IspStats>>;

    /// Counts for a single ISP, `None` when it has no endpoints
    async fn isp_stats_by_name(&self, isp: &str) -> Result<Option<IspStats>>;

    async fn endpoint_metrics(&self) -> Result<EndpointMetrics>;

    /// Distinct monitored hops that more than one endpoint points at
    async fn shared_hop_count(&self) -> Result<u64>;

    /// Outage threshold from settings, or `default` when unset or invalid
    async fn outage_threshold(&self, default: f64) -> f64 {
        match self.get_setting(SETTING_OUTAGE_THRESHOLD).await {
            Ok(Some(raw)) => match raw.trim().parse::<f64>() {
                Ok(value) if (0.0..=1.0).contains(&value) => value,
                _ => {
                    tracing::warn!("Ignoring invalid outage_threshold setting: {}", raw);
                    default
                }
            },
            Ok(None) => default,
            Err(e) => {
                tracing::warn!("Failed to read outage_threshold setting: {}", e);
                default
            }
        }
    }
}

/// LibSQL database implementation
pub struct DatabaseImpl {
    pool: LibsqlPool,
}

impl DatabaseImpl {
    /// Create a new database instance from a pool
    pub fn new_from_pool(pool: LibsqlPool) -> Self {
        Self { pool }
    }

    /// Get a connection from the pool
    async fn get_conn(&self) -> Result<deadpool::managed::Object<crate::pool::LibsqlManager>> {
        Ok(self.pool.get().await?)
    }

    async fn query_endpoints(&self, filter: &str, args: Vec<libsql::Value>) -> Result<Vec<Endpoint>> {
        let conn = self.get_conn().await?;
        let sql = format!("SELECT {} FROM endpoints {}", ENDPOINT_COLUMNS, filter);
        let mut rows = conn.query(&sql, args).await?;

        let mut endpoints = Vec::new();
        while let Some(row) = rows.next().await? {
            endpoints.push(endpoint_from_row(&row)?);
        }
        Ok(endpoints)
    }
}

fn endpoint_from_row(row: &Row) -> Result<Endpoint> {
    let address: String = row.get(1)?;
    let status: String = row.get(3)?;
    let last_ok: Option<i64> = row.get(6)?;
    let hop: String = row.get(7)?;

    Ok(Endpoint {
        id: row.get(0)?,
        address: address.parse().with_context(|| format!("Bad stored address: {}", address))?,
        isp: row.get(2)?,
        status: status.parse()?,
        created_at: i64_to_timestamp(row.get(4)?),
        last_seen: i64_to_timestamp(row.get(5)?),
        last_ok: last_ok.map(i64_to_timestamp),
        monitored_hop: if hop.is_empty() { None } else { Some(hop.parse()?) },
        hop_number: row.get::<i64>(8)?.clamp(0, u8::MAX as i64) as u8,
        use_hop: row.get::<i64>(9)? != 0,
    })
}

const ISP_STATS_COLUMNS: &str = "isp,
        COUNT(*),
        SUM(CASE WHEN status = 'up' THEN 1 ELSE 0 END),
        SUM(CASE WHEN status = 'down' THEN 1 ELSE 0 END),
        SUM(CASE WHEN status = 'unknown' THEN 1 ELSE 0 END)";

fn isp_stats_from_row(row: &Row) -> Result<IspStats> {
    Ok(IspStats {
        name: row.get(0)?,
        total: row.get(1)?,
        up: row.get(2)?,
        down: row.get(3)?,
        unknown: row.get(4)?,
    })
}

fn event_from_row(row: &Row) -> Result<Event> {
    let event_type: String = row.get(2)?;
    let isp: Option<String> = row.get(3)?;
    let endpoint_id: Option<String> = row.get(4)?;

    Ok(Event {
        id: Some(row.get(0)?),
        timestamp: i64_to_timestamp(row.get(1)?),
        event_type: event_type.parse()?,
        isp: isp.filter(|s| !s.is_empty()),
        endpoint_id: endpoint_id.filter(|s| !s.is_empty()),
        message: row.get(5)?,
    })
}

fn cutoff_for(max_age: Duration) -> i64 {
    timestamp_to_i64(SystemTime::now().checked_sub(max_age).unwrap_or(SystemTime::UNIX_EPOCH))
}

#[async_trait]
impl Database for DatabaseImpl {
    async fn list_all_endpoints(&self) -> Result<Vec<Endpoint>> {
        self.query_endpoints("", Vec::new()).await
    }

    async fn update_endpoint_status(
        &self,
        id: &str,
        status: EndpointStatus,
        last_ok: Option<SystemTime>,
    ) -> Result<()> {
        let conn = self.get_conn().await?;
        conn.execute(
            "UPDATE endpoints SET status = ?, last_ok = COALESCE(?, last_ok) WHERE id = ?",
            params![status.to_string(), last_ok.map(timestamp_to_i64), id],
        )
        .await?;
        Ok(())
    }

    async fn update_monitored_hop(&self, id: &str, hop: Ipv4Addr, hop_distance: u8) -> Result<()> {
        let conn = self.get_conn().await?;
        conn.execute(
            "UPDATE endpoints SET monitored_hop = ?, hop_number = ?, use_hop = 1 WHERE id = ?",
            params![hop.to_string(), hop_distance as i64, id],
        )
        .await?;
        Ok(())
    }

    async fn find_endpoints_by_monitored_hop(&self, hop: Ipv4Addr) -> Result<Vec<Endpoint>> {
        self.query_endpoints("WHERE monitored_hop = ?", vec![hop.to_string().into()]).await
    }

    async fn delete_endpoints_unseen_since(&self, cutoff: SystemTime) -> Result<u64> {
        let conn = self.get_conn().await?;
        let deleted = conn
            .execute("DELETE FROM endpoints WHERE last_seen < ?", params![timestamp_to_i64(cutoff)])
            .await?;
        Ok(deleted)
    }

    async fn delete_endpoint(&self, id: &str) -> Result<bool> {
        let conn = self.get_conn().await?;
        let deleted = conn.execute("DELETE FROM endpoints WHERE id = ?", params![id]).await?;
        Ok(deleted > 0)
    }

    async fn append_event(
        &self,
        event_type: EventType,
        isp: Option<&str>,
        endpoint_id: Option<&str>,
        message: &str,
    ) -> Result<()> {
        let conn = self.get_conn().await?;
        conn.execute(
            "INSERT INTO events (timestamp, event_type, isp, endpoint_id, message) VALUES (?, ?, ?, ?, ?)",
            params![
                timestamp_to_i64(SystemTime::now()),
                event_type.to_string(),
                isp.map(str::to_string),
                endpoint_id.map(str::to_string),
                message
            ],
        )
        .await?;
        Ok(())
    }

    async fn append_uptime_snapshot(&self, total: usize, up: usize, down: usize) -> Result<()> {
        let conn = self.get_conn().await?;
        conn.execute(
            "INSERT INTO uptime_history (timestamp, total_endpoints, endpoints_up, endpoints_down) VALUES (?, ?, ?, ?)",
            params![timestamp_to_i64(SystemTime::now()), total as i64, up as i64, down as i64],
        )
        .await?;
        Ok(())
    }

    async fn delete_events_older_than(&self, max_age: Duration) -> Result<u64> {
        let conn = self.get_conn().await?;
        let deleted = conn
            .execute("DELETE FROM events WHERE timestamp < ?", params![cutoff_for(max_age)])
            .await?;
        Ok(deleted)
    }

    async fn delete_snapshots_older_than(&self, max_age: Duration) -> Result<u64> {
        let conn = self.get_conn().await?;
        let deleted = conn
            .execute("DELETE FROM uptime_history WHERE timestamp < ?", params![cutoff_for(max_age)])
            .await?;
        Ok(deleted)
    }

    async fn create_endpoint(&self, endpoint: &Endpoint) -> Result<()> {
        let conn = self.get_conn().await?;
        conn.execute(
            "INSERT INTO endpoints (id, ipv4, ip_hash, isp, status, created_at, last_seen, last_ok, monitored_hop, hop_number, use_hop) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                endpoint.id.clone(),
                endpoint.address.to_string(),
                hash_address(endpoint.address),
                endpoint.isp.clone(),
                endpoint.status.to_string(),
                timestamp_to_i64(endpoint.created_at),
                timestamp_to_i64(endpoint.last_seen),
                endpoint.last_ok.map(timestamp_to_i64),
                endpoint.monitored_hop.map(|hop| hop.to_string()),
                endpoint.hop_number as i64,
                if endpoint.use_hop { 1 } else { 0 }
            ],
        )
        .await
        .with_context(|| format!("Failed to create endpoint {}", endpoint.id))?;
        Ok(())
    }

    async fn find_endpoint_by_address(&self, address: Ipv4Addr) -> Result<Option<Endpoint>> {
        let mut found = self
            .query_endpoints("WHERE ip_hash = ?", vec![hash_address(address).into()])
            .await?;
        Ok(found.pop())
    }

    async fn touch_last_seen(&self, id: &str) -> Result<()> {
        let conn = self.get_conn().await?;
        conn.execute(
            "UPDATE endpoints SET last_seen = ? WHERE id = ?",
            params![timestamp_to_i64(SystemTime::now()), id],
        )
        .await?;
        Ok(())
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.get_conn().await?;
        let mut rows = conn.query("SELECT value FROM settings WHERE key = ?", params![key]).await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.get_conn().await?;
        conn.execute(
            "INSERT INTO settings (key, value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, timestamp_to_i64(SystemTime::now())],
        )
        .await?;
        Ok(())
    }

    async fn recent_events(&self, since: Duration, limit: usize) -> Result<Vec<Event>> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT id, timestamp, event_type, isp, endpoint_id, message FROM events
                 WHERE timestamp >= ? ORDER BY timestamp DESC, id DESC LIMIT ?",
                params![cutoff_for(since), limit as i64],
            )
            .await?;

        let mut events = Vec::new();
        while let Some(row) = rows.next().await? {
            events.push(event_from_row(&row)?);
        }
        Ok(events)
    }

    async fn uptime_history(&self, since: Duration) -> Result<Vec<UptimeSnapshot>> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT timestamp, total_endpoints, endpoints_up, endpoints_down FROM uptime_history
                 WHERE timestamp >= ? ORDER BY timestamp ASC, id ASC",
                params![cutoff_for(since)],
            )
            .await?;

        let mut history = Vec::new();
        while let Some(row) = rows.next().await? {
            history.push(UptimeSnapshot {
                timestamp: i64_to_timestamp(row.get(0)?),
                total: row.get(1)?,
                up: row.get(2)?,
                down: row.get(3)?,
            });
        }
        Ok(history)
    }

    async fn isp_stats(&self) -> Result<Vec<IspStats>> {
        let conn = self.get_conn().await?;
        let sql = format!(
            "SELECT {} FROM endpoints GROUP BY isp ORDER BY COUNT(*) DESC, isp ASC",
            ISP_STATS_COLUMNS
        );
        let mut rows = conn.query(&sql, ()).await?;

        let mut stats = Vec::new();
        while let Some(row) = rows.next().await? {
            stats.push(isp_stats_from_row(&row)?);
        }
        Ok(stats)
    }

    async fn isp_stats_by_name(&self, isp: &str) -> Result<Option<IspStats>> {
        let conn = self.get_conn().await?;
        let sql = format!("SELECT {} FROM endpoints WHERE isp = ? GROUP BY isp", ISP_STATS_COLUMNS);
        let mut rows = conn.query(&sql, params![isp]).await?;
        match rows.next().await? {
            Some(row) => Ok(Some(isp_stats_from_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn endpoint_metrics(&self) -> Result<EndpointMetrics> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT COUNT(*),
                        COALESCE(SUM(CASE WHEN status = 'up' THEN 1 ELSE 0 END), 0),
                        COALESCE(SUM(CASE WHEN status = 'down' THEN 1 ELSE 0 END), 0),
                        COALESCE(SUM(CASE WHEN status = 'unknown' THEN 1 ELSE 0 END), 0),
                        COALESCE(SUM(CASE WHEN COALESCE(use_hop, 0) = 0 THEN 1 ELSE 0 END), 0),
                        COALESCE(SUM(CASE WHEN use_hop = 1 THEN 1 ELSE 0 END), 0)
                 FROM endpoints",
                (),
            )
            .await?;

        let row = rows.next().await?.context("Endpoint metrics query returned no row")?;
        Ok(EndpointMetrics {
            total: row.get(0)?,
            up: row.get(1)?,
            down: row.get(2)?,
            unknown: row.get(3)?,
            direct: row.get(4)?,
            hop_monitored: row.get(5)?,
        })
    }

    async fn shared_hop_count(&self) -> Result<u64> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM (
                     SELECT monitored_hop FROM endpoints
                     WHERE monitored_hop IS NOT NULL AND monitored_hop != ''
                     GROUP BY monitored_hop HAVING COUNT(*) > 1
                 )",
                (),
            )
            .await?;

        let row = rows.next().await?.context("Shared hop query returned no row")?;
        Ok(row.get::<i64>(0)?.max(0) as u64)
    }
}

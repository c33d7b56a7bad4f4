use anyhow::Result;
use libsql::Connection;

use super::models::timestamp_to_i64;

/// Schema version - increment when making schema changes
const SCHEMA_VERSION: i32 = 3;

/// Run database migrations
///
/// Each step is recorded in `schema_migrations`, so reopening an existing
/// database only applies what is missing.
pub async fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL,
            description TEXT
        )",
        (),
    )
    .await?;

    let current_version = get_current_version(conn).await?;

    if current_version >= SCHEMA_VERSION {
        tracing::info!("Database schema is up to date (version {})", current_version);
        return Ok(());
    }

    tracing::info!("Running migrations from version {} to {}", current_version, SCHEMA_VERSION);

    if current_version < 1 {
        run_migration_v1(conn).await?;
        record_migration(conn, 1, "Initial endpoints and settings").await?;
    }

    if current_version < 2 {
        run_migration_v2(conn).await?;
        record_migration(conn, 2, "Add monitored hop columns to endpoints").await?;
    }

    if current_version < 3 {
        run_migration_v3(conn).await?;
        record_migration(conn, 3, "Add uptime history and event log").await?;
    }

    tracing::info!("Database migrations completed successfully (now at version {})", SCHEMA_VERSION);
    Ok(())
}

async fn get_current_version(conn: &Connection) -> Result<i32> {
    let mut rows = conn.query("SELECT MAX(version) FROM schema_migrations", ()).await?;

    if let Some(row) = rows.next().await? {
        let version: Option<i32> = row.get(0)?;
        Ok(version.unwrap_or(0))
    } else {
        Ok(0)
    }
}

async fn record_migration(conn: &Connection, version: i32, description: &str) -> Result<()> {
    let now = timestamp_to_i64(std::time::SystemTime::now());

    conn.execute(
        "INSERT INTO schema_migrations (version, applied_at, description) VALUES (?, ?, ?)",
        libsql::params![version, now, description],
    )
    .await?;

    tracing::info!("Applied migration v{}: {}", version, description);
    Ok(())
}

/// Migration v1: endpoints and settings
async fn run_migration_v1(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS endpoints (
            id TEXT PRIMARY KEY,
            ipv4 TEXT NOT NULL,
            ip_hash TEXT NOT NULL UNIQUE,
            isp TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'unknown',
            created_at INTEGER NOT NULL,
            last_seen INTEGER NOT NULL,
            last_ok INTEGER
        )",
        (),
    )
    .await?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )",
        (),
    )
    .await?;

    conn.execute("CREATE INDEX IF NOT EXISTS idx_endpoints_ip_hash ON endpoints(ip_hash)", ()).await?;
    conn.execute("CREATE INDEX IF NOT EXISTS idx_endpoints_isp ON endpoints(isp)", ()).await?;
    conn.execute("CREATE INDEX IF NOT EXISTS idx_endpoints_status ON endpoints(status)", ()).await?;
    conn.execute("CREATE INDEX IF NOT EXISTS idx_endpoints_last_seen ON endpoints(last_seen)", ()).await?;

    Ok(())
}

/// Migration v2: hop fallback columns
async fn run_migration_v2(conn: &Connection) -> Result<()> {
    conn.execute("ALTER TABLE endpoints ADD COLUMN monitored_hop TEXT", ()).await?;
    conn.execute("ALTER TABLE endpoints ADD COLUMN hop_number INTEGER NOT NULL DEFAULT 0", ()).await?;
    conn.execute("ALTER TABLE endpoints ADD COLUMN use_hop INTEGER NOT NULL DEFAULT 0", ()).await?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_endpoints_monitored_hop ON endpoints(monitored_hop)",
        (),
    )
    .await?;

    tracing::info!("Added monitored hop columns to endpoints table");
    Ok(())
}

/// Migration v3: uptime history and events
async fn run_migration_v3(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS uptime_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp INTEGER NOT NULL,
            total_endpoints INTEGER NOT NULL,
            endpoints_up INTEGER NOT NULL,
            endpoints_down INTEGER NOT NULL
        )",
        (),
    )
    .await?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp INTEGER NOT NULL,
            event_type TEXT NOT NULL,
            isp TEXT,
            endpoint_id TEXT,
            message TEXT NOT NULL
        )",
        (),
    )
    .await?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_uptime_history_timestamp ON uptime_history(timestamp)",
        (),
    )
    .await?;
    conn.execute("CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp DESC)", ()).await?;

    tracing::info!("Added uptime history and events tables");
    Ok(())
}

/// Persistence layer
///
/// Endpoint records, the event log, uptime snapshots and settings live in a
/// LibSQL (SQLite) database reached through a deadpool connection pool.

pub mod repository;
pub mod migrations;
pub mod models;

#[cfg(test)]
pub mod memory;

pub use repository::{Database, DatabaseImpl};

use anyhow::Result;

/// Initialize database with schema
pub async fn initialize_database(conn: &libsql::Connection) -> Result<()> {
    migrations::run_migrations(conn).await
}

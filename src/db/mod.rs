use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use std::path::Path;
use std::time::Duration;
use tokio_rusqlite::{Connection, rusqlite};

use crate::core::error::WipeError;

pub mod certificates;
pub mod jobs;

/// Database file inside the data directory.
pub const DB_FILE: &str = "ledger.db";

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn init(data_dir: &Path) -> Result<Connection> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

    let path = data_dir.join(DB_FILE);
    let conn = Connection::open(&path)
        .await
        .with_context(|| format!("Failed to open {}", path.display()))?;

    apply_schema(&conn).await?;
    Ok(conn)
}

pub async fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory().await?;
    apply_schema(&conn).await?;
    Ok(conn)
}

async fn apply_schema(conn: &Connection) -> Result<()> {
    conn.call(|conn| {
        let schema = include_str!("schema.sql");
        conn.execute_batch(schema)?;

        // Enable foreign keys (SQLite disables them by default!)
        conn.execute("PRAGMA foreign_keys = ON;", [])?;

        // Other handles on the same file queue behind an IMMEDIATE append.
        conn.busy_timeout(BUSY_TIMEOUT)?;

        Ok::<(), rusqlite::Error>(())
    })
    .await
    .context("Failed to apply database schema")?;

    Ok(())
}

/// Collapse a `conn.call` result whose closure already speaks `WipeError`.
pub(crate) fn flatten<T>(result: Result<T, tokio_rusqlite::Error<WipeError>>) -> Result<T, WipeError> {
    match result {
        Ok(value) => Ok(value),
        Err(tokio_rusqlite::Error::Error(err)) => Err(err),
        Err(other) => Err(WipeError::storage(other)),
    }
}

/// Timestamps are stored as RFC 3339 with microsecond precision.
pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

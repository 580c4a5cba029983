//! Persistence layer.
//!
//! Three logical stores, each behind its own SQLite pool so they can live in
//! separate database files: the settlement queue, the portfolio ledger and
//! tier asset inventory. Nothing spans two pools in one transaction.
//!
//! Decimals are stored as normalised text and timestamps as Unix
//! microseconds, so equality lookups and watermark comparisons are exact.

pub mod assets;
pub mod portfolio;
pub mod queue;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::types::{EngineError, EngineResult};

pub use assets::AssetStore;
pub use portfolio::PortfolioStore;
pub use queue::QueueStore;

/// Which logical store a pool backs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Queue,
    Portfolio,
    Assets,
}

impl StoreKind {
    fn migrator(self) -> Migrator {
        let mut migrator = match self {
            StoreKind::Queue => sqlx::migrate!("./migrations/queue"),
            StoreKind::Portfolio => sqlx::migrate!("./migrations/portfolio"),
            StoreKind::Assets => sqlx::migrate!("./migrations/assets"),
        };
        // Stores may share one database file; each migrator must tolerate
        // the others' applied versions.
        migrator.set_ignore_missing(true);
        migrator
    }

    pub fn name(self) -> &'static str {
        match self {
            StoreKind::Queue => "queue",
            StoreKind::Portfolio => "portfolio",
            StoreKind::Assets => "assets",
        }
    }
}

/// Open a pool for `url` and bring its schema up to date.
pub async fn connect(url: &str, max_connections: u32, kind: StoreKind) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(url)
        .with_context(|| format!("Invalid {} database url: {url}", kind.name()))?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    if let Some(dir) = options.get_filename().parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory {}", dir.display()))?;
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to connect to {} database", kind.name()))?;

    migrate(&pool, kind).await?;
    info!(store = kind.name(), url, "Database ready");
    Ok(pool)
}

/// A private in-memory database with the schema for `kind` applied.
///
/// Pinned to a single connection that never expires: every SQLite memory
/// connection is its own database.
pub async fn connect_in_memory(kind: StoreKind) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .context("Invalid in-memory url")?
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .context("Failed to open in-memory database")?;

    migrate(&pool, kind).await?;
    Ok(pool)
}

/// Run the embedded migrations for one store.
pub async fn migrate(pool: &SqlitePool, kind: StoreKind) -> Result<()> {
    kind.migrator()
        .run(pool)
        .await
        .with_context(|| format!("{} migrations failed", kind.name()))?;
    debug!(store = kind.name(), "Migrations applied");
    Ok(())
}

/// Connectivity check used by readiness endpoints.
pub async fn ping(pool: &SqlitePool) -> EngineResult<()> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Column codecs
// ---------------------------------------------------------------------------

/// Canonical text form: trailing zeros stripped, `-0` folded to `0`.
pub(crate) fn encode_decimal(d: Decimal) -> String {
    d.normalize().to_string()
}

pub(crate) fn decode_decimal(s: &str) -> EngineResult<Decimal> {
    Decimal::from_str(s).map_err(|e| EngineError::Decode(format!("bad decimal {s:?}: {e}")))
}

pub(crate) fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

pub(crate) fn from_micros(micros: i64) -> EngineResult<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| EngineError::Decode(format!("timestamp out of range: {micros}")))
}

/// Current time truncated to the stored precision, so values handed back to
/// callers compare equal to what a later read returns.
pub(crate) fn now() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_micros(now.timestamp_micros()).unwrap_or(now)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_decimal_encoding_is_canonical() {
        assert_eq!(encode_decimal(dec!(100.00)), "100");
        assert_eq!(encode_decimal(dec!(100)), "100");
        assert_eq!(encode_decimal(dec!(-12.50)), "-12.5");
        assert_eq!(encode_decimal(-dec!(0)), "0");
    }

    #[test]
    fn test_decimal_decode_rejects_garbage() {
        assert_eq!(decode_decimal("5500.25").unwrap(), dec!(5500.25));
        assert!(matches!(decode_decimal("abc"), Err(EngineError::Decode(_))));
    }

    #[test]
    fn test_micros_roundtrip_keeps_precision() {
        let ts = now();
        assert_eq!(from_micros(to_micros(ts)).unwrap(), ts);
    }

    #[tokio::test]
    async fn test_in_memory_stores_share_nothing() {
        let queue = connect_in_memory(StoreKind::Queue).await.unwrap();
        let assets = connect_in_memory(StoreKind::Assets).await.unwrap();
        ping(&queue).await.unwrap();

        let has_queue: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'queue'",
        )
        .fetch_one(&assets)
        .await
        .unwrap();
        assert_eq!(has_queue.0, 0);
    }

    #[tokio::test]
    async fn test_shared_file_runs_all_migrations() {
        let path = std::env::temp_dir().join(format!("tierflow_{}.db", uuid::Uuid::new_v4()));
        let url = format!("sqlite://{}", path.display());

        connect(&url, 2, StoreKind::Queue).await.unwrap();
        connect(&url, 2, StoreKind::Portfolio).await.unwrap();
        let pool = connect(&url, 2, StoreKind::Assets).await.unwrap();

        let (tables,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' \
             AND name IN ('queue', 'portfolio', 'portfolio_transactions', 'assets', 'order_log')",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(tables, 5);

        pool.close().await;
        let _ = std::fs::remove_file(&path);
    }
}

//! Database module.
//!
//! SQLite persistence through sqlx: connection pool setup, migrations,
//! models and the [`Persistence`] mirror.

pub mod models;
pub mod repository;
pub mod time;

pub use models::{ArchiveRecord, NewArchiveRecord, PluginDbModel, SourceDbModel};
pub use repository::{Persistence, SqlitePersistence};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;
use std::time::Duration;

use crate::Result;

pub type DbPool = Pool<Sqlite>;

/// Connections kept by a file-backed pool.
const POOL_SIZE: u32 = 5;

/// How long a writer waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Pages written before SQLite folds the WAL back into the main file.
const WAL_CHECKPOINT_PAGES: i32 = 1000;

/// Open the archive database at `database_url` in WAL mode.
///
/// The file is created when missing. Every connection gets the same pragmas.
pub async fn init_pool(database_url: &str) -> Result<DbPool> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(BUSY_TIMEOUT);

    let pool = SqlitePoolOptions::new()
        .max_connections(POOL_SIZE)
        .acquire_timeout(BUSY_TIMEOUT)
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                for pragma in [
                    format!("PRAGMA wal_autocheckpoint = {WAL_CHECKPOINT_PAGES}"),
                    "PRAGMA temp_store = MEMORY".to_string(),
                ] {
                    sqlx::query(&pragma).execute(&mut *conn).await?;
                }
                Ok(())
            })
        })
        .connect_with(options)
        .await?;

    let (mode,): (String,) = sqlx::query_as("PRAGMA journal_mode")
        .fetch_one(&pool)
        .await?;
    if !mode.eq_ignore_ascii_case("wal") {
        tracing::warn!(mode = %mode, "Database did not switch to WAL journaling");
    }

    tracing::info!(url = %database_url, connections = POOL_SIZE, "Database pool ready");
    Ok(pool)
}

/// A private in-memory database.
///
/// Every SQLite connection to `:memory:` opens its own database, so the pool
/// is pinned to a single connection that never expires.
pub async fn init_memory_pool() -> Result<DbPool> {
    let connect_options = SqliteConnectOptions::from_str("sqlite::memory:")?;
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(connect_options)
        .await?;
    Ok(pool)
}

/// Bring the schema up to date.
pub async fn run_migrations(pool: &DbPool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::debug!("Schema migrations applied");
    Ok(())
}

//! Durable mirror of the in-memory state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use super::models::{ArchiveRecord, NewArchiveRecord, PluginDbModel, SourceDbModel};
use super::time::{datetime_to_ms, now_ms};
use crate::{Error, Result};

/// Write-through persistence for sources, plugins and archive records.
///
/// The in-memory state is authoritative; these calls mirror every mutation
/// and are read once at startup to rehydrate.
#[async_trait]
pub trait Persistence: Send + Sync {
    // Sources
    async fn add_source(&self, url: &str, plugins: &[String]) -> Result<()>;
    async fn remove_source(&self, url: &str) -> Result<()>;
    async fn update_last_seen(&self, url: &str, at: DateTime<Utc>) -> Result<()>;
    async fn reorder_source_plugin(&self, url: &str, from: usize, to: usize) -> Result<()>;
    async fn fetch_sources(&self) -> Result<Vec<SourceDbModel>>;

    // Plugins
    /// Return the stored plugin, creating it at the lowest priority if new.
    async fn upsert_plugin(&self, name: &str) -> Result<PluginDbModel>;
    async fn reorder_plugin(&self, from: usize, to: usize) -> Result<()>;
    async fn enable_plugin(&self, id: i64, enabled: bool) -> Result<()>;
    async fn fetch_plugins(&self) -> Result<Vec<PluginDbModel>>;

    // Archive
    async fn add_archive_record(&self, record: &NewArchiveRecord) -> Result<ArchiveRecord>;
    async fn remove_archive_record(&self, id: i64) -> Result<()>;
    async fn fetch_archive_records(&self) -> Result<Vec<ArchiveRecord>>;
}

/// Move `from` to `to` in a list, shifting the others.
fn move_entry<T>(items: &mut Vec<T>, from: usize, to: usize) -> Result<()> {
    let len = items.len();
    if from >= len || to >= len {
        return Err(Error::validation(format!(
            "Index out of range: {} -> {} (len {})",
            from, to, len
        )));
    }
    let item = items.remove(from);
    items.insert(to, item);
    Ok(())
}

/// SQLx implementation of [`Persistence`].
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn get_source(&self, url: &str) -> Result<SourceDbModel> {
        sqlx::query_as::<_, SourceDbModel>("SELECT * FROM sources WHERE url = ?")
            .bind(url)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Source", url))
    }
}

#[async_trait]
impl Persistence for SqlitePersistence {
    async fn add_source(&self, url: &str, plugins: &[String]) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sources (url, last_known_validity, plugin_order, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(url)
        .bind(!plugins.is_empty())
        .bind(serde_json::to_string(plugins)?)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_source(&self, url: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM sources WHERE url = ?")
            .bind(url)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("Source", url));
        }
        Ok(())
    }

    async fn update_last_seen(&self, url: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE sources SET last_seen_at = ? WHERE url = ?")
            .bind(datetime_to_ms(at))
            .bind(url)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn reorder_source_plugin(&self, url: &str, from: usize, to: usize) -> Result<()> {
        let source = self.get_source(url).await?;
        let mut names = source.plugin_names()?;
        move_entry(&mut names, from, to)?;

        sqlx::query("UPDATE sources SET plugin_order = ? WHERE id = ?")
            .bind(serde_json::to_string(&names)?)
            .bind(source.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn fetch_sources(&self) -> Result<Vec<SourceDbModel>> {
        let sources = sqlx::query_as::<_, SourceDbModel>("SELECT * FROM sources ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(sources)
    }

    async fn upsert_plugin(&self, name: &str) -> Result<PluginDbModel> {
        if let Some(existing) =
            sqlx::query_as::<_, PluginDbModel>("SELECT * FROM plugins WHERE name = ?")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?
        {
            return Ok(existing);
        }

        let plugin = sqlx::query_as::<_, PluginDbModel>(
            r#"
            INSERT INTO plugins (name, enabled, priority)
            VALUES (?, 1, (SELECT COALESCE(MAX(priority) + 1, 0) FROM plugins))
            RETURNING *
            "#,
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(plugin)
    }

    async fn reorder_plugin(&self, from: usize, to: usize) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let mut ids: Vec<(i64,)> = sqlx::query_as("SELECT id FROM plugins ORDER BY priority, id")
            .fetch_all(&mut *tx)
            .await?;
        move_entry(&mut ids, from, to)?;

        for (priority, (id,)) in ids.iter().enumerate() {
            sqlx::query("UPDATE plugins SET priority = ? WHERE id = ?")
                .bind(priority as i64)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn enable_plugin(&self, id: i64, enabled: bool) -> Result<()> {
        let result = sqlx::query("UPDATE plugins SET enabled = ? WHERE id = ?")
            .bind(enabled)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("Plugin", id.to_string()));
        }
        Ok(())
    }

    async fn fetch_plugins(&self) -> Result<Vec<PluginDbModel>> {
        let plugins =
            sqlx::query_as::<_, PluginDbModel>("SELECT * FROM plugins ORDER BY priority, id")
                .fetch_all(&self.pool)
                .await?;
        Ok(plugins)
    }

    async fn add_archive_record(&self, record: &NewArchiveRecord) -> Result<ArchiveRecord> {
        let record = sqlx::query_as::<_, ArchiveRecord>(
            r#"
            INSERT INTO archive_records (label, path, size_bytes, duration_secs, created_at)
            VALUES (?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(&record.label)
        .bind(&record.path)
        .bind(record.size_bytes)
        .bind(record.duration_secs)
        .bind(now_ms())
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    async fn remove_archive_record(&self, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM archive_records WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("ArchiveRecord", id.to_string()));
        }
        Ok(())
    }

    async fn fetch_archive_records(&self) -> Result<Vec<ArchiveRecord>> {
        let records = sqlx::query_as::<_, ArchiveRecord>(
            "SELECT * FROM archive_records ORDER BY created_at, id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{init_memory_pool, run_migrations};

    async fn persistence() -> SqlitePersistence {
        let pool = init_memory_pool().await.unwrap();
        run_migrations(&pool).await.unwrap();
        SqlitePersistence::new(pool)
    }

    #[tokio::test]
    async fn test_upsert_plugin_assigns_ids_and_priority() {
        let db = persistence().await;
        let a = db.upsert_plugin("a").await.unwrap();
        let b = db.upsert_plugin("b").await.unwrap();
        assert_eq!(a.priority, 0);
        assert_eq!(b.priority, 1);
        assert!(a.enabled);

        let again = db.upsert_plugin("a").await.unwrap();
        assert_eq!(again, a);
    }

    #[tokio::test]
    async fn test_reorder_and_enable_plugins() {
        let db = persistence().await;
        for name in ["a", "b", "c"] {
            db.upsert_plugin(name).await.unwrap();
        }
        db.reorder_plugin(2, 0).await.unwrap();

        let plugins = db.fetch_plugins().await.unwrap();
        let names: Vec<&str> = plugins.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["c", "a", "b"]);
        assert!(db.reorder_plugin(3, 0).await.is_err());

        db.enable_plugin(plugins[1].id, false).await.unwrap();
        let plugins = db.fetch_plugins().await.unwrap();
        assert!(!plugins[1].enabled);
        assert!(matches!(
            db.enable_plugin(999, true).await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_source_lifecycle() {
        let db = persistence().await;
        db.add_source("https://a.tv/X", &["site".into(), "generic".into()])
            .await
            .unwrap();
        db.add_source("rtmp://b.tv/y", &[]).await.unwrap();

        // URLs are unique regardless of case.
        assert!(db.add_source("https://A.TV/x", &[]).await.is_err());

        db.reorder_source_plugin("https://a.tv/x", 1, 0).await.unwrap();
        let seen = Utc::now();
        db.update_last_seen("https://a.tv/X", seen).await.unwrap();

        let sources = db.fetch_sources().await.unwrap();
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].plugin_names().unwrap(), vec!["generic", "site"]);
        assert_eq!(
            sources[0].last_seen().unwrap().timestamp_millis(),
            seen.timestamp_millis()
        );
        assert_eq!(sources[0].last_known_validity, Some(true));
        assert_eq!(sources[1].last_known_validity, Some(false));

        db.remove_source("rtmp://b.tv/y").await.unwrap();
        assert!(db.remove_source("rtmp://b.tv/y").await.is_err());
        assert_eq!(db.fetch_sources().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_archive_records() {
        let db = persistence().await;
        let record = db
            .add_archive_record(&NewArchiveRecord {
                label: "https://a.tv/x".into(),
                path: "/archive/a.ts".into(),
                size_bytes: 1024,
                duration_secs: 12.5,
            })
            .await
            .unwrap();
        assert!(record.id > 0);
        assert_eq!(record.path, "/archive/a.ts");

        let records = db.fetch_archive_records().await.unwrap();
        assert_eq!(records, vec![record.clone()]);

        db.remove_archive_record(record.id).await.unwrap();
        assert!(db.fetch_archive_records().await.unwrap().is_empty());
        assert!(db.remove_archive_record(record.id).await.is_err());
    }
}

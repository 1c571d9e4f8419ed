//! Metadata store trait and implementations.

use crate::error::MetadataResult;
use crate::repos::{FileRepo, LinkRepo, PackageRepo, QueueRepo};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore: FileRepo + LinkRepo + QueueRepo + PackageRepo + Send + Sync {
    /// Run database migrations.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;
}

/// SQLite-based metadata store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open (creating if needed) a SQLite store and apply the schema.
    pub async fn new(path: impl AsRef<Path>, busy_timeout_secs: Option<u64>) -> MetadataResult<Self> {
        let path = path.as_ref();

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(busy_timeout_secs.unwrap_or(5)));

        // One connection serialises every write, so table mutations never interleave.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;

        tracing::debug!(path = %path.display(), "opened sqlite metadata store");

        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

mod sqlite_impl {
    use super::*;
    use crate::models::*;
    use crate::repos::StaleFilter;
    use larder_core::FileLink;

    const FILE_COLUMNS: &str = "f.site_id, f.file_id, f.url, f.path, f.extension, f.size, \
        f.revision, f.time_modified, f.is_external_file, f.repository_type, f.stale, f.download_time";

    const QUEUE_ORDER: &str = "ORDER BY priority DESC, added ASC, rowid ASC";

    #[async_trait]
    impl FileRepo for SqliteStore {
        async fn get_file(&self, site_id: &str, file_id: &str) -> MetadataResult<Option<FileRow>> {
            let row = sqlx::query_as::<_, FileRow>(&format!(
                "SELECT {FILE_COLUMNS} FROM files f WHERE f.site_id = ? AND f.file_id = ?"
            ))
            .bind(site_id)
            .bind(file_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn upsert_file(&self, file: &FileRow) -> MetadataResult<()> {
            sqlx::query(
                r#"
                INSERT INTO files (
                    site_id, file_id, url, path, extension, size, revision,
                    time_modified, is_external_file, repository_type, stale, download_time
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(site_id, file_id) DO UPDATE SET
                    url = excluded.url,
                    path = excluded.path,
                    extension = excluded.extension,
                    size = excluded.size,
                    revision = excluded.revision,
                    time_modified = excluded.time_modified,
                    is_external_file = excluded.is_external_file,
                    repository_type = excluded.repository_type,
                    stale = excluded.stale,
                    download_time = excluded.download_time
                "#,
            )
            .bind(&file.site_id)
            .bind(&file.file_id)
            .bind(&file.url)
            .bind(&file.path)
            .bind(&file.extension)
            .bind(file.size)
            .bind(file.revision)
            .bind(file.time_modified)
            .bind(file.is_external_file)
            .bind(&file.repository_type)
            .bind(file.stale)
            .bind(file.download_time)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn delete_file(&self, site_id: &str, file_id: &str) -> MetadataResult<bool> {
            let mut tx = self.pool.begin().await?;

            sqlx::query("DELETE FROM file_links WHERE site_id = ? AND file_id = ?")
                .bind(site_id)
                .bind(file_id)
                .execute(&mut *tx)
                .await?;

            let result = sqlx::query("DELETE FROM files WHERE site_id = ? AND file_id = ?")
                .bind(site_id)
                .bind(file_id)
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;
            Ok(result.rows_affected() > 0)
        }

        async fn mark_file_stale(&self, site_id: &str, file_id: &str) -> MetadataResult<bool> {
            let result = sqlx::query("UPDATE files SET stale = 1 WHERE site_id = ? AND file_id = ?")
                .bind(site_id)
                .bind(file_id)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn mark_stale(&self, site_id: &str, filter: StaleFilter) -> MetadataResult<u64> {
            let sql = match filter {
                StaleFilter::All => "UPDATE files SET stale = 1 WHERE site_id = ?",
                StaleFilter::UnknownFreshness => {
                    r#"
                    UPDATE files SET stale = 1
                    WHERE site_id = ?
                      AND (is_external_file = 1
                           OR (COALESCE(revision, 0) = 0 AND COALESCE(time_modified, 0) = 0))
                    "#
                }
            };
            let result = sqlx::query(sql).bind(site_id).execute(&self.pool).await?;
            Ok(result.rows_affected())
        }

        async fn list_files(&self, site_id: &str) -> MetadataResult<Vec<FileRow>> {
            let rows = sqlx::query_as::<_, FileRow>(&format!(
                "SELECT {FILE_COLUMNS} FROM files f WHERE f.site_id = ? ORDER BY f.file_id"
            ))
            .bind(site_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }
    }

    #[async_trait]
    impl LinkRepo for SqliteStore {
        async fn add_links(
            &self,
            site_id: &str,
            file_id: &str,
            links: &[FileLink],
        ) -> MetadataResult<()> {
            if links.is_empty() {
                return Ok(());
            }

            let mut tx = self.pool.begin().await?;
            for link in links {
                sqlx::query(
                    r#"
                    INSERT OR IGNORE INTO file_links (site_id, file_id, component, component_id)
                    VALUES (?, ?, ?, ?)
                    "#,
                )
                .bind(site_id)
                .bind(file_id)
                .bind(&link.component)
                .bind(&link.component_id)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
            Ok(())
        }

        async fn links_for_file(
            &self,
            site_id: &str,
            file_id: &str,
        ) -> MetadataResult<Vec<FileLinkRow>> {
            let rows = sqlx::query_as::<_, FileLinkRow>(
                r#"
                SELECT site_id, file_id, component, component_id
                FROM file_links
                WHERE site_id = ? AND file_id = ?
                ORDER BY component, component_id
                "#,
            )
            .bind(site_id)
            .bind(file_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn files_for_component(
            &self,
            site_id: &str,
            component: &str,
            component_id: Option<&str>,
        ) -> MetadataResult<Vec<FileRow>> {
            let rows = sqlx::query_as::<_, FileRow>(&format!(
                r#"
                SELECT DISTINCT {FILE_COLUMNS}
                FROM files f
                JOIN file_links l ON l.site_id = f.site_id AND l.file_id = f.file_id
                WHERE f.site_id = ? AND l.component = ?
                  AND (? IS NULL OR l.component_id = ?)
                ORDER BY f.file_id
                "#
            ))
            .bind(site_id)
            .bind(component)
            .bind(component_id)
            .bind(component_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn delete_component_links(
            &self,
            site_id: &str,
            component: &str,
            component_id: Option<&str>,
        ) -> MetadataResult<u64> {
            let result = sqlx::query(
                r#"
                DELETE FROM file_links
                WHERE site_id = ? AND component = ?
                  AND (? IS NULL OR component_id = ?)
                "#,
            )
            .bind(site_id)
            .bind(component)
            .bind(component_id)
            .bind(component_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        }

        async fn count_file_links(&self, site_id: &str, file_id: &str) -> MetadataResult<u64> {
            let count: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM file_links WHERE site_id = ? AND file_id = ?",
            )
            .bind(site_id)
            .bind(file_id)
            .fetch_one(&self.pool)
            .await?;
            Ok(count as u64)
        }

        async fn component_disk_usage(
            &self,
            site_id: &str,
            component: &str,
            component_id: Option<&str>,
        ) -> MetadataResult<u64> {
            let total: i64 = sqlx::query_scalar(
                r#"
                SELECT COALESCE(SUM(size), 0) FROM files
                WHERE site_id = ? AND file_id IN (
                    SELECT file_id FROM file_links
                    WHERE site_id = ? AND component = ?
                      AND (? IS NULL OR component_id = ?)
                )
                "#,
            )
            .bind(site_id)
            .bind(site_id)
            .bind(component)
            .bind(component_id)
            .bind(component_id)
            .fetch_one(&self.pool)
            .await?;
            Ok(total.max(0) as u64)
        }
    }

    #[async_trait]
    impl QueueRepo for SqliteStore {
        async fn get_queue_entry(
            &self,
            site_id: &str,
            file_id: &str,
        ) -> MetadataResult<Option<QueueEntryRow>> {
            let row = sqlx::query_as::<_, QueueEntryRow>(
                r#"
                SELECT site_id, file_id, url, priority, revision, time_modified, path,
                       added, links, is_external_file, repository_type
                FROM download_queue
                WHERE site_id = ? AND file_id = ?
                "#,
            )
            .bind(site_id)
            .bind(file_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn insert_queue_entry(&self, entry: &QueueEntryRow) -> MetadataResult<bool> {
            let result = sqlx::query(
                r#"
                INSERT INTO download_queue (
                    site_id, file_id, url, priority, revision, time_modified, path,
                    added, links, is_external_file, repository_type
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(site_id, file_id) DO NOTHING
                "#,
            )
            .bind(&entry.site_id)
            .bind(&entry.file_id)
            .bind(&entry.url)
            .bind(entry.priority)
            .bind(entry.revision)
            .bind(entry.time_modified)
            .bind(&entry.path)
            .bind(entry.added)
            .bind(&entry.links)
            .bind(entry.is_external_file)
            .bind(&entry.repository_type)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn update_queue_entry(&self, entry: &QueueEntryRow) -> MetadataResult<()> {
            let result = sqlx::query(
                r#"
                UPDATE download_queue SET
                    url = ?, priority = ?, revision = ?, time_modified = ?, path = ?,
                    links = ?, is_external_file = ?, repository_type = ?
                WHERE site_id = ? AND file_id = ?
                "#,
            )
            .bind(&entry.url)
            .bind(entry.priority)
            .bind(entry.revision)
            .bind(entry.time_modified)
            .bind(&entry.path)
            .bind(&entry.links)
            .bind(entry.is_external_file)
            .bind(&entry.repository_type)
            .bind(&entry.site_id)
            .bind(&entry.file_id)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 0 {
                return Err(crate::MetadataError::NotFound(format!(
                    "queued file {} for site {}",
                    entry.file_id, entry.site_id
                )));
            }
            Ok(())
        }

        async fn delete_queue_entry(&self, site_id: &str, file_id: &str) -> MetadataResult<bool> {
            let result = sqlx::query("DELETE FROM download_queue WHERE site_id = ? AND file_id = ?")
                .bind(site_id)
                .bind(file_id)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn next_queue_entry(&self) -> MetadataResult<Option<QueueEntryRow>> {
            let row = sqlx::query_as::<_, QueueEntryRow>(&format!(
                r#"
                SELECT site_id, file_id, url, priority, revision, time_modified, path,
                       added, links, is_external_file, repository_type
                FROM download_queue
                {QUEUE_ORDER}
                LIMIT 1
                "#
            ))
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn list_queue_entries(
            &self,
            site_id: Option<&str>,
        ) -> MetadataResult<Vec<QueueEntryRow>> {
            let rows = sqlx::query_as::<_, QueueEntryRow>(&format!(
                r#"
                SELECT site_id, file_id, url, priority, revision, time_modified, path,
                       added, links, is_external_file, repository_type
                FROM download_queue
                WHERE ? IS NULL OR site_id = ?
                {QUEUE_ORDER}
                "#
            ))
            .bind(site_id)
            .bind(site_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn count_queue_entries(&self) -> MetadataResult<u64> {
            let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM download_queue")
                .fetch_one(&self.pool)
                .await?;
            Ok(count as u64)
        }
    }

    #[async_trait]
    impl PackageRepo for SqliteStore {
        async fn get_package(
            &self,
            site_id: &str,
            package_id: &str,
        ) -> MetadataResult<Option<PackageRow>> {
            let row = sqlx::query_as::<_, PackageRow>(
                r#"
                SELECT site_id, package_id, component, component_id, status, previous_status,
                       updated_at, download_time, previous_download_time, extra
                FROM packages
                WHERE site_id = ? AND package_id = ?
                "#,
            )
            .bind(site_id)
            .bind(package_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn upsert_package(&self, package: &PackageRow) -> MetadataResult<()> {
            sqlx::query(
                r#"
                INSERT INTO packages (
                    site_id, package_id, component, component_id, status, previous_status,
                    updated_at, download_time, previous_download_time, extra
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(site_id, package_id) DO UPDATE SET
                    status = excluded.status,
                    previous_status = excluded.previous_status,
                    updated_at = excluded.updated_at,
                    download_time = excluded.download_time,
                    previous_download_time = excluded.previous_download_time,
                    extra = excluded.extra
                "#,
            )
            .bind(&package.site_id)
            .bind(&package.package_id)
            .bind(&package.component)
            .bind(&package.component_id)
            .bind(&package.status)
            .bind(&package.previous_status)
            .bind(package.updated_at)
            .bind(package.download_time)
            .bind(package.previous_download_time)
            .bind(&package.extra)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn list_packages(
            &self,
            site_id: &str,
            component: Option<&str>,
        ) -> MetadataResult<Vec<PackageRow>> {
            let rows = sqlx::query_as::<_, PackageRow>(
                r#"
                SELECT site_id, package_id, component, component_id, status, previous_status,
                       updated_at, download_time, previous_download_time, extra
                FROM packages
                WHERE site_id = ? AND (? IS NULL OR component = ?)
                ORDER BY component, component_id
                "#,
            )
            .bind(site_id)
            .bind(component)
            .bind(component)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn delete_site_packages(&self, site_id: &str) -> MetadataResult<u64> {
            let result = sqlx::query("DELETE FROM packages WHERE site_id = ?")
                .bind(site_id)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected())
        }
    }
}

const SCHEMA_SQL: &str = r#"
-- File registry, partitioned per site
CREATE TABLE IF NOT EXISTS files (
    site_id TEXT NOT NULL,
    file_id TEXT NOT NULL,
    url TEXT NOT NULL,
    path TEXT NOT NULL,
    extension TEXT,
    size INTEGER NOT NULL DEFAULT 0,
    revision INTEGER,
    time_modified INTEGER,
    is_external_file INTEGER NOT NULL DEFAULT 0,
    repository_type TEXT,
    stale INTEGER NOT NULL DEFAULT 0,
    download_time TEXT NOT NULL,
    PRIMARY KEY (site_id, file_id)
);

-- File to component links
CREATE TABLE IF NOT EXISTS file_links (
    site_id TEXT NOT NULL,
    file_id TEXT NOT NULL,
    component TEXT NOT NULL,
    component_id TEXT NOT NULL DEFAULT '',
    PRIMARY KEY (site_id, file_id, component, component_id)
);
CREATE INDEX IF NOT EXISTS idx_file_links_component ON file_links(site_id, component, component_id);

-- Download queue, shared by all sites
CREATE TABLE IF NOT EXISTS download_queue (
    site_id TEXT NOT NULL,
    file_id TEXT NOT NULL,
    url TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    revision INTEGER,
    time_modified INTEGER,
    path TEXT,
    added INTEGER NOT NULL,
    links TEXT NOT NULL DEFAULT '[]',
    is_external_file INTEGER NOT NULL DEFAULT 0,
    repository_type TEXT,
    PRIMARY KEY (site_id, file_id)
);
CREATE INDEX IF NOT EXISTS idx_download_queue_order ON download_queue(priority DESC, added ASC);

-- Package status, partitioned per site
CREATE TABLE IF NOT EXISTS packages (
    site_id TEXT NOT NULL,
    package_id TEXT NOT NULL,
    component TEXT NOT NULL,
    component_id TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL,
    previous_status TEXT,
    updated_at TEXT NOT NULL,
    download_time TEXT,
    previous_download_time TEXT,
    extra TEXT,
    PRIMARY KEY (site_id, package_id)
);
CREATE INDEX IF NOT EXISTS idx_packages_component ON packages(site_id, component);
"#;

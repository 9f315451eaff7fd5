//! Durable catalog of media sources, installed archives and the encode
//! queue.
//!
//! Three tables back the whole cluster state:
//! `sourcefiles(id, path, size)`, `archives(id, path)` and
//! `queue(id, status, count, start, comment)`. A queue row moves
//! `NOT_STARTED -> STARTED -> <result>`; retriable results may loop back to
//! `STARTED` up to the retry cap. Every write happens under one
//! process-wide lock, inside a transaction, so a crash never leaves a
//! half-applied transition.

use common::media::{status, EncodedFile};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

const RETRY_LIMIT: i64 = 3;

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("database is not initialized")]
    EmptyDatabase,
    #[error(transparent)]
    Sql(#[from] sqlx::Error),
    #[error("inconsistent catalog data: {0}")]
    Inconsistent(String),
}

/// A file known to the catalog, as stored in `sourcefiles`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceFile {
    pub id: i64,
    pub path: std::path::PathBuf,
    pub size: u64,
}

/// Path and size of an observed file, input to [`Catalog::add_file`].
#[derive(Clone, Debug)]
pub struct FileInfo {
    pub path: std::path::PathBuf,
    pub size: u64,
}

/// One row of the queue table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueEntry {
    pub status: i8,
    pub count: u32,
    pub comment: Option<String>,
}

pub struct Catalog {
    pool: SqlitePool,
    write_lock: tokio::sync::Mutex<()>,
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn path_text(path: &std::path::Path) -> String {
    path.to_string_lossy().into_owned()
}

impl Catalog {
    /// Open the store at `path`. Missing tables are created in a single
    /// transaction when `create` is set, otherwise opening fails with
    /// [`CatalogError::EmptyDatabase`].
    pub async fn open(path: &std::path::Path, create: bool) -> Result<Self, CatalogError> {
        if !create && !path.exists() {
            return Err(CatalogError::EmptyDatabase);
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(create)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let catalog = Self {
            pool,
            write_lock: tokio::sync::Mutex::new(()),
        };
        let (tables,): (i64,) = sqlx::query_as(
            "SELECT count(*) FROM sqlite_master WHERE type = 'table' \
             AND name IN ('sourcefiles', 'archives', 'queue')",
        )
        .fetch_one(&catalog.pool)
        .await?;
        if tables != 3 {
            if !create {
                return Err(CatalogError::EmptyDatabase);
            }
            catalog.setup_tables().await?;
        }
        Ok(catalog)
    }

    async fn setup_tables(&self) -> Result<(), CatalogError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sourcefiles \
             (id INTEGER PRIMARY KEY AUTOINCREMENT, path TEXT, size INTEGER)",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query("CREATE TABLE IF NOT EXISTS archives (id INTEGER, path TEXT)")
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS queue \
             (id INTEGER, status INTEGER, count INTEGER, start TIMESTAMP, comment TEXT)",
        )
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Atomically choose the next source matching `filter` and mark its
    /// queue row `STARTED`. Candidates are, in one union: queued sources
    /// within the size limit, sources never queued, and sources whose last
    /// attempt was retriable with fewer than three attempts.
    pub async fn reserve_next(
        &self,
        max_file_size: u64,
    ) -> Result<Option<SourceFile>, CatalogError> {
        let max_size: i64 = if max_file_size > 0 {
            i64::try_from(max_file_size).unwrap_or(i64::MAX)
        } else {
            i64::MAX
        };
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let row: Option<(i64, String, i64)> = sqlx::query_as(
            "SELECT s.id, s.path, s.size FROM sourcefiles s \
               JOIN queue q ON q.id = s.id \
               WHERE s.size <= ?1 AND q.status = ?2 \
             UNION \
             SELECT s.id, s.path, s.size FROM sourcefiles s \
               WHERE s.size <= ?1 AND s.id NOT IN (SELECT id FROM queue) \
             UNION \
             SELECT s.id, s.path, s.size FROM sourcefiles s \
               JOIN queue q ON q.id = s.id \
               WHERE s.size <= ?1 AND q.status < 0 AND q.status >= -99 AND q.count < ?3 \
             LIMIT 1",
        )
        .bind(max_size)
        .bind(i64::from(status::NOT_STARTED))
        .bind(RETRY_LIMIT)
        .fetch_optional(&mut *tx)
        .await?;
        let Some((id, path, size)) = row else {
            return Ok(None);
        };
        let queued: Option<(i64,)> = sqlx::query_as("SELECT count FROM queue WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        if queued.is_some() {
            sqlx::query("UPDATE queue SET status = ?, count = count + 1, start = ? WHERE id = ?")
                .bind(i64::from(status::STARTED))
                .bind(now())
                .bind(id)
                .execute(&mut *tx)
                .await?;
        } else {
            sqlx::query("INSERT INTO queue (id, status, count, start) VALUES (?, ?, 1, ?)")
                .bind(id)
                .bind(i64::from(status::STARTED))
                .bind(now())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(Some(SourceFile {
            id,
            path: std::path::PathBuf::from(path),
            size: u64::try_from(size)
                .map_err(|_| CatalogError::Inconsistent(format!("negative size for id {id}")))?,
        }))
    }

    /// Idempotent upsert driven by file-system observations. Ensures the
    /// source row exists, enqueues it when requested or when its archive
    /// was seen, and links the archive row. Returns the source id, 0 when
    /// nothing could be attributed.
    pub async fn add_file(
        &self,
        src: Option<&FileInfo>,
        dst: Option<&FileInfo>,
        enqueue: bool,
    ) -> Result<i64, CatalogError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let mut src_id: i64 = 0;
        let mut in_queue = false;
        let mut processed = false;
        let mut archive_name: Option<String> = None;

        if let Some(src) = src {
            let src_path = path_text(&src.path);
            let row: Option<(i64, Option<i64>, Option<String>)> = sqlx::query_as(
                "SELECT s.id, q.status, a.path FROM sourcefiles s \
                 LEFT JOIN queue q ON q.id = s.id \
                 LEFT JOIN archives a ON a.id = s.id \
                 WHERE s.path = ?",
            )
            .bind(&src_path)
            .fetch_optional(&mut *tx)
            .await?;
            if let Some((id, queue_status, a_path)) = row {
                src_id = id;
                in_queue = queue_status.is_some();
                processed = queue_status.is_some_and(|s| s >= i64::from(status::OK));
                archive_name = a_path.filter(|p| !p.is_empty());
            } else {
                let done = sqlx::query("INSERT INTO sourcefiles (path, size) VALUES (?, ?)")
                    .bind(&src_path)
                    .bind(i64::try_from(src.size).unwrap_or(i64::MAX))
                    .execute(&mut *tx)
                    .await?;
                src_id = done.last_insert_rowid();
            }
            if !in_queue && (enqueue || dst.is_some()) {
                let initial = if dst.is_some() {
                    status::OK
                } else {
                    status::NOT_STARTED
                };
                sqlx::query("INSERT INTO queue (id, status, count, start) VALUES (?, ?, 0, ?)")
                    .bind(src_id)
                    .bind(i64::from(initial))
                    .bind(now())
                    .execute(&mut *tx)
                    .await?;
                processed = dst.is_some();
                in_queue = true;
            }
        }

        if let Some(dst) = dst {
            let dst_path = path_text(&dst.path);
            if let Some(ref known) = archive_name {
                if *known != dst_path {
                    tracing::warn!(
                        "destination already recorded under another name: {:?} != {:?}",
                        dst_path,
                        known
                    );
                } else {
                    // archive link already in place
                    tx.commit().await?;
                    return Ok(src_id);
                }
            }
            let src_id_from_source = src_id;
            let row: Option<(i64, Option<i64>)> = sqlx::query_as(
                "SELECT a.id, q.status FROM archives a \
                 LEFT JOIN queue q ON q.id = a.id WHERE a.path = ?",
            )
            .bind(&dst_path)
            .fetch_optional(&mut *tx)
            .await?;
            let found = row.is_some();
            if let Some((id, queue_status)) = row {
                src_id = id;
                in_queue = queue_status.is_some();
                processed = queue_status.is_some_and(|s| s >= i64::from(status::OK));
            }
            if archive_name.is_some() && src_id != src_id_from_source {
                tracing::warn!(
                    "conflicting source ids {} != {} for encoded file {:?}",
                    src_id,
                    src_id_from_source,
                    dst_path
                );
            }
            if !found {
                if src_id != 0 {
                    sqlx::query("INSERT INTO archives (id, path) VALUES (?, ?)")
                        .bind(src_id)
                        .bind(&dst_path)
                        .execute(&mut *tx)
                        .await?;
                } else {
                    tracing::warn!(
                        "archive {:?} observed without a known source, not recording",
                        dst_path
                    );
                }
            }
            if src_id != 0 {
                if !in_queue {
                    sqlx::query(
                        "INSERT INTO queue (id, status, count, start) VALUES (?, ?, 0, ?)",
                    )
                    .bind(src_id)
                    .bind(i64::from(status::OK))
                    .bind(now())
                    .execute(&mut *tx)
                    .await?;
                } else if !processed {
                    sqlx::query(
                        "UPDATE queue SET status = ?, start = ?, comment = NULL WHERE id = ?",
                    )
                    .bind(i64::from(status::OK))
                    .bind(now())
                    .bind(src_id)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }

        tx.commit().await?;
        Ok(src_id)
    }

    /// Record the outcome of an encode attempt. The archive row is
    /// installed (replacing any previous one) only for an `OK` result.
    pub async fn add_encoded(&self, file: &EncodedFile) -> Result<(), CatalogError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let comment = if file.info.error.is_empty() {
            None
        } else {
            Some(file.info.error.clone())
        };
        sqlx::query("UPDATE queue SET status = ?, start = ?, comment = ? WHERE id = ?")
            .bind(i64::from(file.info.status))
            .bind(now())
            .bind(comment)
            .bind(file.source_id)
            .execute(&mut *tx)
            .await?;
        if file.info.status == status::OK {
            sqlx::query("DELETE FROM archives WHERE id = ?")
                .bind(file.source_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("INSERT INTO archives (id, path) VALUES (?, ?)")
                .bind(file.source_id)
                .bind(path_text(&file.path))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Put an aborted job back in line; the attempt count stays.
    pub async fn reset(&self, source_id: i64) -> Result<(), CatalogError> {
        let _guard = self.write_lock.lock().await;
        sqlx::query("UPDATE queue SET status = ?, comment = NULL WHERE id = ?")
            .bind(i64::from(status::NOT_STARTED))
            .bind(source_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Read back the queue row of a source, if any.
    pub async fn queue_entry(&self, source_id: i64) -> Result<Option<QueueEntry>, CatalogError> {
        let row: Option<(i64, i64, Option<String>)> =
            sqlx::query_as("SELECT status, count, comment FROM queue WHERE id = ?")
                .bind(source_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(queue_status, count, comment)| QueueEntry {
            status: queue_status as i8,
            count: count as u32,
            comment,
        }))
    }

    /// Path of the archive row linked to a source, if any.
    pub async fn archive_path(
        &self,
        source_id: i64,
    ) -> Result<Option<std::path::PathBuf>, CatalogError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT path FROM archives WHERE id = ?")
            .bind(source_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(path,)| std::path::PathBuf::from(path)))
    }
}

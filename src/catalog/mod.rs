//! Durable home of file and transcoding-job state.
//!
//! All policy-relevant reads and every state transition happen inside short
//! transactions on a single SQLite database shared by the API server and the
//! worker processes (WAL mode). The single-active-job rule is enforced twice:
//! by the `create_jobs` transaction and, as a cross-process backstop, by a
//! partial unique index over active rows.

pub mod models;

use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::{debug, info};

use models::{
    FileRecord, JobPatch, JobStatus, NewFile, SkippedQuality, TranscodingJob, VideoMetadata,
};

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("stored JSON is invalid: {0}")]
    Json(#[from] serde_json::Error),
    #[error("duplicate object key: {0}")]
    DuplicateObjectKey(String),
    #[error("file {0} not found")]
    MissingFile(i64),
    #[error("job {0} not found")]
    MissingJob(i64),
    #[error("job {job_id} is {current}, cannot transition to {to}")]
    StateConflict {
        job_id: i64,
        current: JobStatus,
        to: JobStatus,
    },
}

#[derive(Debug, Clone)]
pub struct Catalog {
    pool: SqlitePool,
}

impl Catalog {
    /// Open (creating if missing) the catalog database and bootstrap the schema.
    pub async fn new(database_url: &str) -> Result<Self, CatalogError> {
        info!("Connecting to {}", database_url);
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        let catalog = Catalog { pool };
        catalog.create_tables().await?;
        Ok(catalog)
    }

    /// Create all necessary tables and indices
    async fn create_tables(&self) -> Result<(), CatalogError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS files (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                filename TEXT NOT NULL,
                object_key TEXT NOT NULL UNIQUE,
                size INTEGER NOT NULL,
                mime_type TEXT NOT NULL,
                file_hash TEXT,
                description TEXT,
                user_id INTEGER,
                video_metadata TEXT,
                transcoded_variants TEXT,
                upload_date TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS ix_files_filename ON files (filename)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS transcoding_jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                file_id INTEGER NOT NULL,
                target_quality INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                progress REAL NOT NULL DEFAULT 0,
                output_key TEXT,
                output_size INTEGER,
                error_message TEXT,
                encoder_metadata TEXT,
                queue_task_id TEXT,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                FOREIGN KEY (file_id) REFERENCES files (id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS ix_transcoding_jobs_file_id ON transcoding_jobs (file_id)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS ix_transcoding_jobs_status ON transcoding_jobs (status)",
        )
        .execute(&self.pool)
        .await?;

        // At most one active job per (file, quality), even across processes
        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS ux_transcoding_jobs_one_active
            ON transcoding_jobs (file_id, target_quality)
            WHERE status IN ('pending', 'processing')
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Liveness probe for /health.
    pub async fn ping(&self) -> Result<(), CatalogError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Files
    // ------------------------------------------------------------------

    /// Register a file. The object must already be durable in the store and
    /// `size` must be the store-reported size.
    pub async fn insert_file(&self, new: NewFile) -> Result<FileRecord, CatalogError> {
        let row = sqlx::query(
            r#"
            INSERT INTO files
                (filename, object_key, size, mime_type, file_hash, description, user_id, upload_date)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            RETURNING *
            "#,
        )
        .bind(&new.filename)
        .bind(&new.object_key)
        .bind(new.size)
        .bind(&new.mime_type)
        .bind(&new.file_hash)
        .bind(&new.description)
        .bind(new.user_id)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                CatalogError::DuplicateObjectKey(new.object_key.clone())
            }
            _ => CatalogError::Database(e),
        })?;

        row_to_file(&row)
    }

    pub async fn get_file(&self, id: i64) -> Result<Option<FileRecord>, CatalogError> {
        let row = sqlx::query("SELECT * FROM files WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_file).transpose()
    }

    /// Newest first, paginated. The API clamps `limit` to 1..=100.
    pub async fn list_files(
        &self,
        skip: i64,
        limit: i64,
        user_id: Option<i64>,
    ) -> Result<Vec<FileRecord>, CatalogError> {
        let rows = match user_id {
            Some(uid) => {
                sqlx::query(
                    "SELECT * FROM files WHERE user_id = ?1 ORDER BY upload_date DESC LIMIT ?2 OFFSET ?3",
                )
                .bind(uid)
                .bind(limit)
                .bind(skip)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM files ORDER BY upload_date DESC LIMIT ?1 OFFSET ?2")
                    .bind(limit)
                    .bind(skip)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(row_to_file).collect()
    }

    /// Backfill the source probe result onto the file record.
    pub async fn set_video_metadata(
        &self,
        file_id: i64,
        metadata: &VideoMetadata,
    ) -> Result<(), CatalogError> {
        sqlx::query("UPDATE files SET video_metadata = ?1 WHERE id = ?2")
            .bind(serde_json::to_string(metadata)?)
            .bind(file_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Remove a file row together with all of its jobs (terminal ones
    /// included; the pruning is logged, not silent). Object deletion is the
    /// caller's responsibility — the catalog only owns rows.
    pub async fn delete_file_rows(&self, file_id: i64) -> Result<bool, CatalogError> {
        let mut tx = self.pool.begin().await?;
        let pruned = sqlx::query("DELETE FROM transcoding_jobs WHERE file_id = ?1")
            .bind(file_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let deleted = sqlx::query("DELETE FROM files WHERE id = ?1")
            .bind(file_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;

        if deleted > 0 && pruned > 0 {
            info!(file_id, jobs = pruned, "pruned transcoding jobs with file");
        }
        Ok(deleted > 0)
    }

    // ------------------------------------------------------------------
    // Transcoding jobs
    // ------------------------------------------------------------------

    /// Atomically create jobs for the requested qualities, filtering out
    /// those that already have an active job or a published variant. Two
    /// concurrent callers cannot both create a job for the same quality: the
    /// filter runs inside the transaction and the partial unique index backs
    /// it up.
    pub async fn create_jobs(
        &self,
        file_id: i64,
        qualities: &[i64],
    ) -> Result<(Vec<TranscodingJob>, Vec<SkippedQuality>), CatalogError> {
        // Read-then-insert: take the write lock up front (BEGIN IMMEDIATE)
        // so a concurrent caller blocks until this decision has committed
        // instead of racing it on a stale snapshot.
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
        let result = self.create_jobs_locked(&mut conn, file_id, qualities).await;
        match &result {
            Ok(_) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
            }
            Err(_) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
            }
        }
        result
    }

    async fn create_jobs_locked(
        &self,
        conn: &mut sqlx::SqliteConnection,
        file_id: i64,
        qualities: &[i64],
    ) -> Result<(Vec<TranscodingJob>, Vec<SkippedQuality>), CatalogError> {
        let file_row = sqlx::query("SELECT transcoded_variants FROM files WHERE id = ?1")
            .bind(file_id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or(CatalogError::MissingFile(file_id))?;
        let variants: Option<String> = file_row.try_get("transcoded_variants")?;
        let variants: HashSet<String> = variants
            .as_deref()
            .map(serde_json::from_str::<std::collections::BTreeMap<String, String>>)
            .transpose()?
            .map(|m| m.into_keys().collect())
            .unwrap_or_default();

        let active_rows = sqlx::query(
            "SELECT target_quality FROM transcoding_jobs
             WHERE file_id = ?1 AND status IN ('pending', 'processing')",
        )
        .bind(file_id)
        .fetch_all(&mut *conn)
        .await?;
        let mut active: HashSet<i64> = active_rows
            .iter()
            .map(|r| r.try_get::<i64, _>("target_quality"))
            .collect::<Result<_, _>>()?;

        let mut created = Vec::new();
        let mut skipped = Vec::new();
        for &quality in qualities {
            if variants.contains(&quality.to_string()) {
                skipped.push(SkippedQuality {
                    quality,
                    reason: "already transcoded".to_string(),
                });
                continue;
            }
            if active.contains(&quality) {
                skipped.push(SkippedQuality {
                    quality,
                    reason: "already in progress".to_string(),
                });
                continue;
            }

            let inserted = sqlx::query(
                r#"
                INSERT INTO transcoding_jobs (file_id, target_quality, status, progress, created_at)
                VALUES (?1, ?2, 'pending', 0, ?3)
                RETURNING *
                "#,
            )
            .bind(file_id)
            .bind(quality)
            .bind(Utc::now())
            .fetch_one(&mut *conn)
            .await;

            match inserted {
                Ok(row) => {
                    active.insert(quality);
                    created.push(row_to_job(&row)?);
                }
                Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                    skipped.push(SkippedQuality {
                        quality,
                        reason: "already in progress".to_string(),
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok((created, skipped))
    }

    pub async fn get_job(&self, job_id: i64) -> Result<Option<TranscodingJob>, CatalogError> {
        let row = sqlx::query("SELECT * FROM transcoding_jobs WHERE id = ?1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_job).transpose()
    }

    pub async fn jobs_for_file(&self, file_id: i64) -> Result<Vec<TranscodingJob>, CatalogError> {
        let rows = sqlx::query(
            "SELECT * FROM transcoding_jobs WHERE file_id = ?1 ORDER BY created_at DESC, id DESC",
        )
        .bind(file_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_job).collect()
    }

    /// Paginated job listing with optional status filter. Returns the page
    /// plus the filtered total; each job is paired with its file's name when
    /// the file still exists.
    pub async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        skip: i64,
        limit: i64,
    ) -> Result<(Vec<(TranscodingJob, Option<String>)>, i64), CatalogError> {
        let (total, rows) = match status {
            Some(s) => {
                let total: i64 =
                    sqlx::query_scalar("SELECT COUNT(*) FROM transcoding_jobs WHERE status = ?1")
                        .bind(s)
                        .fetch_one(&self.pool)
                        .await?;
                let rows = sqlx::query(
                    r#"
                    SELECT j.*, f.filename AS source_filename
                    FROM transcoding_jobs j LEFT JOIN files f ON f.id = j.file_id
                    WHERE j.status = ?1
                    ORDER BY j.created_at DESC, j.id DESC LIMIT ?2 OFFSET ?3
                    "#,
                )
                .bind(s)
                .bind(limit)
                .bind(skip)
                .fetch_all(&self.pool)
                .await?;
                (total, rows)
            }
            None => {
                let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM transcoding_jobs")
                    .fetch_one(&self.pool)
                    .await?;
                let rows = sqlx::query(
                    r#"
                    SELECT j.*, f.filename AS source_filename
                    FROM transcoding_jobs j LEFT JOIN files f ON f.id = j.file_id
                    ORDER BY j.created_at DESC, j.id DESC LIMIT ?1 OFFSET ?2
                    "#,
                )
                .bind(limit)
                .bind(skip)
                .fetch_all(&self.pool)
                .await?;
                (total, rows)
            }
        };

        let jobs = rows
            .iter()
            .map(|row| {
                let filename: Option<String> = row.try_get("source_filename")?;
                Ok((row_to_job(row)?, filename))
            })
            .collect::<Result<Vec<_>, CatalogError>>()?;
        Ok((jobs, total))
    }

    pub async fn set_queue_task_id(
        &self,
        job_id: i64,
        task_id: &str,
    ) -> Result<(), CatalogError> {
        sqlx::query("UPDATE transcoding_jobs SET queue_task_id = ?1 WHERE id = ?2")
            .bind(task_id)
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Compare-and-set status transition with an attached field patch.
    /// Succeeds only if the current status is in `from`; otherwise returns
    /// `StateConflict` (or `MissingJob`). `started_at`/`completed_at` are
    /// stamped automatically based on the target state.
    pub async fn transition_job(
        &self,
        job_id: i64,
        from: &[JobStatus],
        to: JobStatus,
        patch: JobPatch,
    ) -> Result<TranscodingJob, CatalogError> {
        let from_list = from
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            r#"
            UPDATE transcoding_jobs SET
                status = ?1,
                progress = COALESCE(?2, progress),
                output_key = COALESCE(?3, output_key),
                output_size = COALESCE(?4, output_size),
                error_message = COALESCE(?5, error_message),
                encoder_metadata = COALESCE(?6, encoder_metadata),
                queue_task_id = COALESCE(?7, queue_task_id),
                started_at = CASE WHEN ?1 = 'processing' THEN ?8 ELSE started_at END,
                completed_at = CASE WHEN ?1 IN ('completed', 'failed', 'cancelled')
                               THEN ?8 ELSE completed_at END
            WHERE id = ?9 AND status IN ({from_list})
            "#
        );

        let encoder_metadata = patch
            .encoder_metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let affected = sqlx::query(&sql)
            .bind(to)
            .bind(patch.progress)
            .bind(&patch.output_key)
            .bind(patch.output_size)
            .bind(&patch.error_message)
            .bind(encoder_metadata)
            .bind(&patch.queue_task_id)
            .bind(Utc::now())
            .bind(job_id)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if affected == 0 {
            return match self.get_job(job_id).await? {
                Some(job) => Err(CatalogError::StateConflict {
                    job_id,
                    current: job.status,
                    to,
                }),
                None => Err(CatalogError::MissingJob(job_id)),
            };
        }

        debug!(job_id, to = %to, "job transitioned");
        self.get_job(job_id)
            .await?
            .ok_or(CatalogError::MissingJob(job_id))
    }

    /// Progress updates are monotone: a late out-of-order update can never
    /// move the bar backwards, and only a processing job accepts them.
    pub async fn update_progress(&self, job_id: i64, progress: f64) -> Result<(), CatalogError> {
        sqlx::query(
            "UPDATE transcoding_jobs SET progress = MAX(progress, MIN(?1, 100.0))
             WHERE id = ?2 AND status = 'processing'",
        )
        .bind(progress)
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Single transaction that finishes a job and publishes its variant:
    /// CAS `processing → completed` plus the variant-map update on the file.
    /// Either both commit or neither does.
    pub async fn complete_job(
        &self,
        job_id: i64,
        file_id: i64,
        quality: i64,
        output_key: &str,
        output_size: i64,
        encoder_metadata: &VideoMetadata,
    ) -> Result<TranscodingJob, CatalogError> {
        let mut tx = self.pool.begin().await?;

        let affected = sqlx::query(
            r#"
            UPDATE transcoding_jobs SET
                status = 'completed',
                progress = 100.0,
                output_key = ?1,
                output_size = ?2,
                encoder_metadata = ?3,
                completed_at = ?4
            WHERE id = ?5 AND status = 'processing'
            "#,
        )
        .bind(output_key)
        .bind(output_size)
        .bind(serde_json::to_string(encoder_metadata)?)
        .bind(Utc::now())
        .bind(job_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if affected == 0 {
            let current = sqlx::query("SELECT status FROM transcoding_jobs WHERE id = ?1")
                .bind(job_id)
                .fetch_optional(&mut *tx)
                .await?;
            tx.rollback().await?;
            return match current {
                Some(row) => Err(CatalogError::StateConflict {
                    job_id,
                    current: row.try_get("status")?,
                    to: JobStatus::Completed,
                }),
                None => Err(CatalogError::MissingJob(job_id)),
            };
        }

        let file_row = sqlx::query("SELECT transcoded_variants FROM files WHERE id = ?1")
            .bind(file_id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(file_row) = file_row else {
            tx.rollback().await?;
            return Err(CatalogError::MissingFile(file_id));
        };
        let stored: Option<String> = file_row.try_get("transcoded_variants")?;
        let mut variants: std::collections::BTreeMap<String, String> = stored
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?
            .unwrap_or_default();
        variants.insert(quality.to_string(), output_key.to_string());

        sqlx::query("UPDATE files SET transcoded_variants = ?1 WHERE id = ?2")
            .bind(serde_json::to_string(&variants)?)
            .bind(file_id)
            .execute(&mut *tx)
            .await?;

        let job_row = sqlx::query("SELECT * FROM transcoding_jobs WHERE id = ?1")
            .bind(job_id)
            .fetch_one(&mut *tx)
            .await?;
        let job = row_to_job(&job_row)?;
        tx.commit().await?;

        info!(job_id, file_id, quality, output_key, "variant published");
        Ok(job)
    }
}

fn row_to_file(row: &SqliteRow) -> Result<FileRecord, CatalogError> {
    let video_metadata: Option<String> = row.try_get("video_metadata")?;
    let variants: Option<String> = row.try_get("transcoded_variants")?;
    Ok(FileRecord {
        id: row.try_get("id")?,
        filename: row.try_get("filename")?,
        object_key: row.try_get("object_key")?,
        size: row.try_get("size")?,
        mime_type: row.try_get("mime_type")?,
        file_hash: row.try_get("file_hash")?,
        description: row.try_get("description")?,
        user_id: row.try_get("user_id")?,
        video_metadata: video_metadata
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?,
        transcoded_variants: variants
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?
            .unwrap_or_default(),
        upload_date: row.try_get("upload_date")?,
    })
}

fn row_to_job(row: &SqliteRow) -> Result<TranscodingJob, CatalogError> {
    let encoder_metadata: Option<String> = row.try_get("encoder_metadata")?;
    Ok(TranscodingJob {
        id: row.try_get("id")?,
        file_id: row.try_get("file_id")?,
        target_quality: row.try_get("target_quality")?,
        status: row.try_get("status")?,
        progress: row.try_get("progress")?,
        output_key: row.try_get("output_key")?,
        output_size: row.try_get("output_size")?,
        error_message: row.try_get("error_message")?,
        encoder_metadata: encoder_metadata
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?,
        queue_task_id: row.try_get("queue_task_id")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

//! Store interface for jobs, batches, and photos
//!
//! One `Store` trait is the single coordination surface for the whole
//! pipeline: the dispatcher inserts through it, workers claim and finalize
//! through it, and every invariant is re-derivable from it alone. `PgStore`
//! is the production implementation (SeaORM over Postgres); the claim and
//! reclaim paths drop to raw SQL because they need conditional updates with
//! `FOR UPDATE SKIP LOCKED` semantics.

use crate::db::models::*;
use crate::db::DbPool;
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DbBackend, EntityTrait, QueryFilter,
    QueryOrder, Set, Statement, TransactionTrait,
};
use std::time::Duration;
use uuid::Uuid;

/// Everything needed to create one batch and its jobs
#[derive(Debug, Clone)]
pub struct BatchSpec {
    pub user_id: Uuid,
    pub model_id: Uuid,
    /// One job is created per reference image URL
    pub reference_image_urls: Vec<String>,
    pub reference_image_prompt: Option<String>,
    pub training_image_urls: Vec<String>,
    pub base_prompt: String,
    pub aspect_ratio: String,
    pub num_images: i32,
    pub glasses: String,
    pub hair_color: Option<String>,
    pub hair_style: Option<String>,
    pub backgrounds: Vec<String>,
    pub styles: Vec<String>,
    pub max_attempts: i32,
    pub idempotency_key: Option<String>,
}

/// Everything needed to persist one generated photo
#[derive(Debug, Clone)]
pub struct PhotoSpec {
    pub user_id: Uuid,
    pub model_id: Uuid,
    pub generation_batch_id: Uuid,
    pub url: String,
    pub aspect_ratio: String,
    pub glasses: String,
    pub hair_color: Option<String>,
    pub hair_style: Option<String>,
    pub backgrounds: Vec<String>,
    pub styles: Vec<String>,
    pub prompt: String,
}

/// Persistent store for the generation pipeline
#[async_trait]
pub trait Store: Send + Sync {
    /// Create a batch and its jobs atomically, batch before jobs.
    /// No job row ever references a nonexistent batch.
    async fn create_batch_with_jobs(&self, spec: BatchSpec) -> Result<(Batch, Vec<Job>)>;

    /// Atomically claim the oldest eligible job for `worker_id`.
    /// Eligible: `pending`, or `rate_limited` with `retry_at` in the past.
    /// Returns `None` when nothing is eligible or another worker won the row.
    async fn claim_next(&self, worker_id: &str) -> Result<Option<Job>>;

    /// Reset `processing` rows whose lock is older than `lock_timeout`
    /// back to `pending` with cleared lock fields. Returns the count.
    async fn reclaim_stale_locks(&self, lock_timeout: Duration) -> Result<u64>;

    /// Bump the attempt counter; returns the new value.
    /// No-op (returns current) on terminal rows.
    async fn increment_attempt(&self, id: Uuid) -> Result<i32>;

    async fn mark_completed(&self, id: Uuid) -> Result<()>;

    async fn mark_failed(&self, id: Uuid, error_message: &str) -> Result<()>;

    async fn mark_rate_limited(
        &self,
        id: Uuid,
        retry_at: DateTime<Utc>,
        error_message: &str,
    ) -> Result<()>;

    async fn create_photo(&self, spec: PhotoSpec) -> Result<Photo>;

    async fn count_photos_for_batch(&self, batch_id: Uuid) -> Result<i64>;

    async fn photos_for_batch(&self, batch_id: Uuid) -> Result<Vec<Photo>>;

    /// Re-derive the batch status from its jobs and persist the result.
    /// Transactional relative to the triggering job update; finalizing an
    /// already-terminal batch is a no-op.
    async fn finalize_batch(&self, batch_id: Uuid) -> Result<Batch>;

    async fn find_job(&self, id: Uuid) -> Result<Option<Job>>;

    async fn find_batch(&self, id: Uuid) -> Result<Option<Batch>>;

    async fn find_batch_by_idempotency_key(
        &self,
        user_id: Uuid,
        key: &str,
    ) -> Result<Option<Batch>>;

    async fn ping(&self) -> Result<()>;
}

/// Postgres-backed store
#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn json_array(values: &[String]) -> serde_json::Value {
    serde_json::Value::Array(
        values
            .iter()
            .map(|v| serde_json::Value::String(v.clone()))
            .collect(),
    )
}

#[async_trait]
impl Store for PgStore {
    async fn create_batch_with_jobs(&self, spec: BatchSpec) -> Result<(Batch, Vec<Job>)> {
        let now = Utc::now();
        let batch_id = Uuid::new_v4();
        let job_count = spec.reference_image_urls.len() as i32;

        let txn = self.pool.write().begin().await?;

        let batch = BatchActiveModel {
            id: Set(batch_id),
            user_id: Set(spec.user_id),
            model_id: Set(spec.model_id),
            aspect_ratio: Set(spec.aspect_ratio.clone()),
            glasses: Set(spec.glasses.clone()),
            hair_color: Set(spec.hair_color.clone()),
            hair_style: Set(spec.hair_style.clone()),
            backgrounds: Set(json_array(&spec.backgrounds)),
            styles: Set(json_array(&spec.styles)),
            num_images: Set(spec.num_images),
            total_images_generated: Set(0),
            credits_used: Set(job_count * spec.num_images),
            status: Set(String::from(BatchStatus::Generating)),
            idempotency_key: Set(spec.idempotency_key.clone()),
            created_at: Set(now.into()),
            completed_at: Set(None),
        };

        let batch = batch.insert(&txn).await?;

        let mut jobs = Vec::with_capacity(spec.reference_image_urls.len());
        for reference_image_url in &spec.reference_image_urls {
            let job = JobActiveModel {
                id: Set(Uuid::new_v4()),
                batch_id: Set(batch_id),
                user_id: Set(spec.user_id),
                model_id: Set(spec.model_id),
                reference_image_url: Set(reference_image_url.clone()),
                reference_image_prompt: Set(spec.reference_image_prompt.clone()),
                training_image_urls: Set(json_array(&spec.training_image_urls)),
                base_prompt: Set(spec.base_prompt.clone()),
                aspect_ratio: Set(spec.aspect_ratio.clone()),
                num_images: Set(spec.num_images),
                glasses: Set(spec.glasses.clone()),
                hair_color: Set(spec.hair_color.clone()),
                hair_style: Set(spec.hair_style.clone()),
                backgrounds: Set(json_array(&spec.backgrounds)),
                styles: Set(json_array(&spec.styles)),
                status: Set(String::from(JobStatus::Pending)),
                attempts: Set(0),
                max_attempts: Set(spec.max_attempts),
                retry_at: Set(None),
                locked_by: Set(None),
                locked_at: Set(None),
                error_message: Set(None),
                created_at: Set(now.into()),
                processed_at: Set(None),
                completed_at: Set(None),
            };

            jobs.push(job.insert(&txn).await?);
        }

        txn.commit().await?;

        Ok((batch, jobs))
    }

    async fn claim_next(&self, worker_id: &str) -> Result<Option<Job>> {
        // SKIP LOCKED makes concurrent claims race-free: losers see no row
        // instead of blocking or erroring.
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            r#"
            UPDATE generation_jobs
            SET status = 'processing',
                locked_by = $1,
                locked_at = NOW(),
                processed_at = NOW()
            WHERE id = (
                SELECT id FROM generation_jobs
                WHERE status = 'pending'
                   OR (status = 'rate_limited' AND retry_at <= NOW())
                ORDER BY created_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
            vec![worker_id.into()],
        );

        JobEntity::find()
            .from_raw_sql(stmt)
            .one(self.pool.write())
            .await
            .map_err(Into::into)
    }

    async fn reclaim_stale_locks(&self, lock_timeout: Duration) -> Result<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(lock_timeout).map_err(|e| AppError::Internal {
                message: format!("Invalid lock timeout: {}", e),
            })?;

        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            r#"
            UPDATE generation_jobs
            SET status = 'pending', locked_by = NULL, locked_at = NULL
            WHERE status = 'processing' AND locked_at < $1
            "#,
            vec![cutoff.into()],
        );

        let result = self.pool.write().execute(stmt).await?;
        Ok(result.rows_affected())
    }

    async fn increment_attempt(&self, id: Uuid) -> Result<i32> {
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            r#"
            UPDATE generation_jobs
            SET attempts = attempts + 1
            WHERE id = $1 AND status NOT IN ('completed', 'failed')
            RETURNING attempts
            "#,
            vec![id.into()],
        );

        match self.pool.write().query_one(stmt).await? {
            Some(row) => row
                .try_get_by_index::<i32>(0)
                .map_err(|e| AppError::Database(e.into())),
            None => {
                let job = self
                    .find_job(id)
                    .await?
                    .ok_or_else(|| AppError::JobNotFound { id: id.to_string() })?;
                Ok(job.attempts)
            }
        }
    }

    async fn mark_completed(&self, id: Uuid) -> Result<()> {
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            r#"
            UPDATE generation_jobs
            SET status = 'completed',
                completed_at = NOW(),
                retry_at = NULL,
                locked_by = NULL,
                locked_at = NULL
            WHERE id = $1 AND status NOT IN ('completed', 'failed')
            "#,
            vec![id.into()],
        );

        self.pool.write().execute(stmt).await?;
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error_message: &str) -> Result<()> {
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            r#"
            UPDATE generation_jobs
            SET status = 'failed',
                completed_at = NOW(),
                error_message = $2,
                retry_at = NULL,
                locked_by = NULL,
                locked_at = NULL
            WHERE id = $1 AND status NOT IN ('completed', 'failed')
            "#,
            vec![id.into(), error_message.into()],
        );

        self.pool.write().execute(stmt).await?;
        Ok(())
    }

    async fn mark_rate_limited(
        &self,
        id: Uuid,
        retry_at: DateTime<Utc>,
        error_message: &str,
    ) -> Result<()> {
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            r#"
            UPDATE generation_jobs
            SET status = 'rate_limited',
                retry_at = $2,
                error_message = $3,
                locked_by = NULL,
                locked_at = NULL
            WHERE id = $1 AND status NOT IN ('completed', 'failed')
            "#,
            vec![id.into(), retry_at.into(), error_message.into()],
        );

        self.pool.write().execute(stmt).await?;
        Ok(())
    }

    async fn create_photo(&self, spec: PhotoSpec) -> Result<Photo> {
        let photo = PhotoActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(spec.user_id),
            model_id: Set(spec.model_id),
            generation_batch_id: Set(spec.generation_batch_id),
            url: Set(spec.url),
            status: Set("completed".to_string()),
            credits_used: Set(1),
            aspect_ratio: Set(spec.aspect_ratio),
            glasses: Set(spec.glasses),
            hair_color: Set(spec.hair_color),
            hair_style: Set(spec.hair_style),
            backgrounds: Set(json_array(&spec.backgrounds)),
            styles: Set(json_array(&spec.styles)),
            prompt: Set(spec.prompt),
            created_at: Set(Utc::now().into()),
        };

        photo.insert(self.pool.write()).await.map_err(Into::into)
    }

    async fn count_photos_for_batch(&self, batch_id: Uuid) -> Result<i64> {
        use sea_orm::PaginatorTrait;

        PhotoEntity::find()
            .filter(PhotoColumn::GenerationBatchId.eq(batch_id))
            .count(self.pool.read())
            .await
            .map(|n| n as i64)
            .map_err(Into::into)
    }

    async fn photos_for_batch(&self, batch_id: Uuid) -> Result<Vec<Photo>> {
        PhotoEntity::find()
            .filter(PhotoColumn::GenerationBatchId.eq(batch_id))
            .order_by_asc(PhotoColumn::CreatedAt)
            .all(self.pool.read())
            .await
            .map_err(Into::into)
    }

    async fn finalize_batch(&self, batch_id: Uuid) -> Result<Batch> {
        let txn = self.pool.write().begin().await?;

        // Row-lock the batch so two workers finalizing the same batch
        // serialize here instead of racing.
        let lock_stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            "SELECT * FROM generation_batches WHERE id = $1 FOR UPDATE",
            vec![batch_id.into()],
        );

        let batch = BatchEntity::find()
            .from_raw_sql(lock_stmt)
            .one(&txn)
            .await?
            .ok_or_else(|| AppError::BatchNotFound {
                id: batch_id.to_string(),
            })?;

        if batch.is_terminal() {
            txn.commit().await?;
            return Ok(batch);
        }

        let status_stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            "SELECT status FROM generation_jobs WHERE batch_id = $1",
            vec![batch_id.into()],
        );

        let job_statuses: Vec<JobStatus> = txn
            .query_all(status_stmt)
            .await?
            .into_iter()
            .filter_map(|row| row.try_get_by_index::<String>(0).ok())
            .map(JobStatus::from)
            .collect();

        let derived = derive_status(&job_statuses);
        if !derived.is_terminal() {
            txn.commit().await?;
            return Ok(batch);
        }

        let count_stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            "SELECT COUNT(*) FROM photos WHERE generation_batch_id = $1",
            vec![batch_id.into()],
        );

        let photo_count: i64 = txn
            .query_one(count_stmt)
            .await?
            .and_then(|row| row.try_get_by_index::<i64>(0).ok())
            .unwrap_or(0);

        let mut active: BatchActiveModel = batch.into();
        active.status = Set(String::from(derived));
        active.total_images_generated = Set(photo_count as i32);
        active.completed_at = Set(Some(Utc::now().into()));

        let batch = active.update(&txn).await?;
        txn.commit().await?;

        tracing::info!(
            batch_id = %batch_id,
            status = %batch.status,
            total_images = batch.total_images_generated,
            "Batch finalized"
        );

        Ok(batch)
    }

    async fn find_job(&self, id: Uuid) -> Result<Option<Job>> {
        JobEntity::find_by_id(id)
            .one(self.pool.read())
            .await
            .map_err(Into::into)
    }

    async fn find_batch(&self, id: Uuid) -> Result<Option<Batch>> {
        BatchEntity::find_by_id(id)
            .one(self.pool.read())
            .await
            .map_err(Into::into)
    }

    async fn find_batch_by_idempotency_key(
        &self,
        user_id: Uuid,
        key: &str,
    ) -> Result<Option<Batch>> {
        BatchEntity::find()
            .filter(BatchColumn::UserId.eq(user_id))
            .filter(BatchColumn::IdempotencyKey.eq(key))
            .one(self.pool.read())
            .await
            .map_err(Into::into)
    }

    async fn ping(&self) -> Result<()> {
        self.pool.ping().await
    }
}

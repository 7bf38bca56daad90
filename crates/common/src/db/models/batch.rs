//! Generation batch entity
//!
//! Aggregates all jobs spawned by one user generation request. The batch
//! status is a pure function of its jobs' statuses; `derive_status` is the
//! single place that function lives.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use super::job::JobStatus;

/// Batch status enum
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Generating,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchStatus::Completed | BatchStatus::Failed)
    }
}

impl From<String> for BatchStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "generating" => BatchStatus::Generating,
            "completed" => BatchStatus::Completed,
            "failed" => BatchStatus::Failed,
            _ => BatchStatus::Generating,
        }
    }
}

impl From<BatchStatus> for String {
    fn from(status: BatchStatus) -> Self {
        match status {
            BatchStatus::Generating => "generating".to_string(),
            BatchStatus::Completed => "completed".to_string(),
            BatchStatus::Failed => "failed".to_string(),
        }
    }
}

/// Derive a batch status from its jobs' statuses.
///
/// Stays `Generating` while any job is non-terminal. Once all jobs are
/// terminal: `Completed` if at least one job completed, `Failed` otherwise.
pub fn derive_status(job_statuses: &[JobStatus]) -> BatchStatus {
    if job_statuses.iter().any(|s| !s.is_terminal()) {
        return BatchStatus::Generating;
    }
    if job_statuses.iter().any(|s| *s == JobStatus::Completed) {
        BatchStatus::Completed
    } else {
        BatchStatus::Failed
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "generation_batches")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub user_id: Uuid,

    pub model_id: Uuid,

    #[sea_orm(column_type = "Text")]
    pub aspect_ratio: String,

    #[sea_orm(column_type = "Text")]
    pub glasses: String,

    #[sea_orm(column_type = "Text", nullable)]
    pub hair_color: Option<String>,

    #[sea_orm(column_type = "Text", nullable)]
    pub hair_style: Option<String>,

    pub backgrounds: Json,

    pub styles: Json,

    pub num_images: i32,

    pub total_images_generated: i32,

    pub credits_used: i32,

    #[sea_orm(column_type = "Text")]
    pub status: String,

    #[sea_orm(column_type = "Text", nullable)]
    pub idempotency_key: Option<String>,

    pub created_at: DateTimeWithTimeZone,

    pub completed_at: Option<DateTimeWithTimeZone>,
}

impl Model {
    /// Get the batch status as an enum
    pub fn batch_status(&self) -> BatchStatus {
        BatchStatus::from(self.status.clone())
    }

    /// Check if the batch is in a terminal state
    pub fn is_terminal(&self) -> bool {
        self.batch_status().is_terminal()
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::job::Entity")]
    Jobs,

    #[sea_orm(has_many = "super::photo::Entity")]
    Photos,
}

impl Related<super::job::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Jobs.def()
    }
}

impl Related<super::photo::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Photos.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

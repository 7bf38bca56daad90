//! Photo entity
//!
//! One successfully generated image, visible to the end user. Failed
//! generations produce no Photo row.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "photos")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub user_id: Uuid,

    pub model_id: Uuid,

    pub generation_batch_id: Uuid,

    #[sea_orm(column_type = "Text")]
    pub url: String,

    #[sea_orm(column_type = "Text")]
    pub status: String,

    pub credits_used: i32,

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

    #[sea_orm(column_type = "Text")]
    pub prompt: String,

    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::batch::Entity",
        from = "Column::GenerationBatchId",
        to = "super::batch::Column::Id"
    )]
    Batch,
}

impl Related<super::batch::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Batch.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

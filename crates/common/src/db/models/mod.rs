//! SeaORM entity models
//!
//! Database entities for the generation pipeline

pub mod batch;
pub mod job;
pub mod photo;

pub use batch::{
    derive_status,
    ActiveModel as BatchActiveModel,
    BatchStatus,
    Column as BatchColumn,
    Entity as BatchEntity,
    Model as Batch,
};

pub use job::{
    ActiveModel as JobActiveModel,
    Column as JobColumn,
    Entity as JobEntity,
    JobStatus,
    Model as Job,
};

pub use photo::{
    ActiveModel as PhotoActiveModel,
    Column as PhotoColumn,
    Entity as PhotoEntity,
    Model as Photo,
};

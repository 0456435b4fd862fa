use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Schema-identical to `job::Model` plus `archived_at`. Only terminal rows
/// ever land here (see `store::JobStore::archive_old`).
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "job_archive")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub user_id: String,
    pub status: String,
    pub priority: i32,
    pub priority_score: f64,
    pub model_id: Option<String>,
    pub backend_url: Option<String>,
    pub request: Option<String>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub created_at: i64,
    pub updated_at: i64,
    pub archived_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Point-in-time record of backend + host state, sampled by the snapshot
/// loop (`scheduler::snapshot_loop`). `"__local__"` is used as the
/// `backend_url` when no backends are configured, so host metrics are
/// still captured.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "backend_snapshot")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub captured_at: i64,
    pub backend_url: String,
    pub cpu_percent: Option<f64>,
    pub ram_percent: Option<f64>,
    pub active_jobs: Option<i32>,
    pub queued_jobs: Option<i32>,
    pub loaded_models: Option<i32>,
    pub vram_used_gb: Option<f64>,
    pub avg_tokens_per_second: Option<f64>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

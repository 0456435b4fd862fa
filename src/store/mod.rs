use std::collections::HashMap;
use std::sync::Arc;

use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbBackend, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set, Statement, TransactionTrait,
};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::db::entities::{job, job_archive};
use crate::error::{QueueError, Result};

fn now_epoch() -> i64 {
    chrono::Utc::now().timestamp()
}

const TERMINAL_STATUSES: [&str; 3] = [
    job::STATUS_COMPLETED,
    job::STATUS_FAILED,
    job::STATUS_CANCELLED,
];

/// Status/model filters shared by the user-scoped and admin job listings.
#[derive(Debug, Default, Clone)]
pub struct JobFilters {
    pub status: Option<String>,
    pub model_id: Option<String>,
}

/// Admin listing adds an optional `user_id` filter on top of `JobFilters`.
#[derive(Debug, Default, Clone)]
pub struct AdminJobFilters {
    pub status: Option<String>,
    pub model_id: Option<String>,
    pub user_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ModelCount {
    pub model_id: String,
    pub total: i64,
    pub completed: i64,
    pub failed: i64,
}

#[derive(Debug, Serialize)]
pub struct UserCount {
    pub user_id: String,
    pub total: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
}

#[derive(Debug, Serialize)]
pub struct DailyBucket {
    pub date: String,
    pub total: i64,
    pub completed: i64,
    pub failed: i64,
}

#[derive(Debug, Serialize)]
pub struct JobAnalytics {
    pub total: i64,
    pub by_status: HashMap<String, i64>,
    pub by_model: Vec<ModelCount>,
    pub by_user: Vec<UserCount>,
    pub daily_history: Vec<DailyBucket>,
    pub avg_wait_seconds: f64,
    pub includes_archive: bool,
}

/// Durable state for jobs and their archive. Every write is its own
/// transaction; the claim path additionally locks rows so no two callers
/// can claim the same queued job (spec.md §4.1, I3).
#[derive(Clone)]
pub struct JobStore {
    db: Arc<DatabaseConnection>,
}

impl JobStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Escape hatch for callers (the snapshot loop) that need the raw
    /// connection for entities `JobStore` doesn't own.
    pub fn raw_connection(&self) -> Arc<DatabaseConnection> {
        self.db.clone()
    }

    pub async fn insert(
        &self,
        user_id: &str,
        model_id: Option<&str>,
        request: &Value,
        priority: i32,
        max_attempts: i32,
    ) -> Result<job::Model> {
        let now = now_epoch();
        let active = job::ActiveModel {
            id: Set(Uuid::now_v7().to_string()),
            user_id: Set(user_id.to_string()),
            status: Set(job::STATUS_QUEUED.to_string()),
            priority: Set(priority),
            priority_score: Set(priority as f64),
            model_id: Set(model_id.map(str::to_string)),
            backend_url: Set(None),
            request: Set(Some(serde_json::to_string(request)?)),
            result: Set(None),
            error: Set(None),
            attempt_count: Set(0),
            max_attempts: Set(max_attempts),
            created_at: Set(now),
            updated_at: Set(now),
        };
        Ok(active.insert(self.db.as_ref()).await?)
    }

    pub async fn get(&self, id: &str) -> Result<Option<job::Model>> {
        Ok(job::Entity::find_by_id(id).one(self.db.as_ref()).await?)
    }

    pub async fn list_by_user(
        &self,
        user_id: &str,
        filters: &JobFilters,
        offset: u64,
        limit: u64,
    ) -> Result<(Vec<job::Model>, u64)> {
        let mut query = job::Entity::find().filter(job::Column::UserId.eq(user_id));
        if let Some(status) = &filters.status {
            query = query.filter(job::Column::Status.eq(status.clone()));
        }
        if let Some(model_id) = &filters.model_id {
            query = query.filter(job::Column::ModelId.eq(model_id.clone()));
        }
        let total = self.count_jobs_by_user_id(user_id).await?;
        let jobs = query
            .order_by_desc(job::Column::CreatedAt)
            .offset(offset)
            .limit(limit)
            .all(self.db.as_ref())
            .await?;
        Ok((jobs, total))
    }

    pub async fn list_admin(
        &self,
        filters: &AdminJobFilters,
        offset: u64,
        limit: u64,
    ) -> Result<(Vec<job::Model>, u64)> {
        let mut query = job::Entity::find();
        if let Some(status) = &filters.status {
            query = query.filter(job::Column::Status.eq(status.clone()));
        }
        if let Some(model_id) = &filters.model_id {
            query = query.filter(job::Column::ModelId.eq(model_id.clone()));
        }
        if let Some(user_id) = &filters.user_id {
            query = query.filter(job::Column::UserId.eq(user_id.clone()));
        }
        let total = query.clone().count(self.db.as_ref()).await?;
        let jobs = query
            .order_by_desc(job::Column::CreatedAt)
            .offset(offset)
            .limit(limit)
            .all(self.db.as_ref())
            .await?;
        Ok((jobs, total))
    }

    pub async fn count_jobs_by_user_id(&self, user_id: &str) -> Result<u64> {
        Ok(job::Entity::find()
            .filter(job::Column::UserId.eq(user_id))
            .count(self.db.as_ref())
            .await?)
    }

    /// Atomically claims the highest-priority queued job and flips it to
    /// `running`. Postgres uses `FOR UPDATE SKIP LOCKED`; other engines
    /// (SQLite) fall back to a single write transaction guarded by a
    /// status-checked `UPDATE`, which SQLite's single-writer semantics
    /// serialize for free (spec.md §9).
    pub async fn claim_next(&self) -> Result<Option<job::Model>> {
        let now = now_epoch();
        let txn = self.db.begin().await?;
        let backend = txn.get_database_backend();

        let select_sql = match backend {
            DbBackend::Postgres => {
                "SELECT id FROM job WHERE status = $1 \
                 ORDER BY priority_score DESC, created_at ASC LIMIT 1 FOR UPDATE SKIP LOCKED"
            }
            _ => {
                "SELECT id FROM job WHERE status = ? \
                 ORDER BY priority_score DESC, created_at ASC LIMIT 1"
            }
        };
        let row = txn
            .query_one(Statement::from_sql_and_values(
                backend,
                select_sql,
                vec![job::STATUS_QUEUED.into()],
            ))
            .await?;

        let Some(row) = row else {
            txn.commit().await?;
            return Ok(None);
        };
        let id: String = row.try_get("", "id")?;

        let update_sql = match backend {
            DbBackend::Postgres => {
                "UPDATE job SET status = $1, attempt_count = attempt_count + 1, updated_at = $2 \
                 WHERE id = $3 AND status = $4"
            }
            _ => {
                "UPDATE job SET status = ?, attempt_count = attempt_count + 1, updated_at = ? \
                 WHERE id = ? AND status = ?"
            }
        };
        let result = txn
            .execute(Statement::from_sql_and_values(
                backend,
                update_sql,
                vec![
                    job::STATUS_RUNNING.into(),
                    now.into(),
                    id.clone().into(),
                    job::STATUS_QUEUED.into(),
                ],
            ))
            .await?;

        if result.rows_affected() == 0 {
            // Lost a race with another claimant (no SKIP LOCKED support on this path).
            txn.commit().await?;
            return Ok(None);
        }

        let claimed = job::Entity::find_by_id(id).one(&txn).await?;
        txn.commit().await?;
        Ok(claimed)
    }

    pub async fn mark_completed(&self, id: &str, result: &Value) -> Result<Option<job::Model>> {
        let Some(job) = self.get(id).await? else {
            return Ok(None);
        };
        let mut active: job::ActiveModel = job.into();
        active.status = Set(job::STATUS_COMPLETED.to_string());
        active.result = Set(Some(serde_json::to_string(result)?));
        active.error = Set(None);
        active.updated_at = Set(now_epoch());
        Ok(Some(active.update(self.db.as_ref()).await?))
    }

    pub async fn mark_failed(
        &self,
        id: &str,
        error: &str,
        requeue: bool,
    ) -> Result<Option<job::Model>> {
        let Some(job) = self.get(id).await? else {
            return Ok(None);
        };
        let next_status = next_status_after_failure(job.attempt_count, job.max_attempts, requeue);
        let mut active: job::ActiveModel = job.into();
        active.error = Set(Some(error.to_string()));
        active.status = Set(next_status.to_string());
        active.updated_at = Set(now_epoch());
        Ok(Some(active.update(self.db.as_ref()).await?))
    }

    pub async fn mark_cancelled(&self, id: &str) -> Result<Option<job::Model>> {
        let Some(job) = self.get(id).await? else {
            return Ok(None);
        };
        if job::is_terminal(&job.status) {
            return Ok(Some(job));
        }
        let mut active: job::ActiveModel = job.into();
        active.status = Set(job::STATUS_CANCELLED.to_string());
        active.updated_at = Set(now_epoch());
        Ok(Some(active.update(self.db.as_ref()).await?))
    }

    /// Idempotent: only the first call (from the job's first `running`
    /// transition) actually writes the backend URL.
    pub async fn set_backend(&self, id: &str, backend_url: &str) -> Result<Option<job::Model>> {
        let Some(job) = self.get(id).await? else {
            return Ok(None);
        };
        if job.backend_url.is_some() {
            return Ok(Some(job));
        }
        let mut active: job::ActiveModel = job.into();
        active.backend_url = Set(Some(backend_url.to_string()));
        active.updated_at = Set(now_epoch());
        Ok(Some(active.update(self.db.as_ref()).await?))
    }

    pub async fn admin_retry(&self, id: &str) -> Result<job::Model> {
        let job = self
            .get(id)
            .await?
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        if !job::is_terminal(&job.status) {
            return Err(QueueError::Conflict(format!(
                "job {id} is in state '{}' — only terminal jobs can be retried",
                job.status
            )));
        }
        let priority = job.priority;
        let mut active: job::ActiveModel = job.into();
        active.status = Set(job::STATUS_QUEUED.to_string());
        active.error = Set(None);
        active.attempt_count = Set(0);
        active.priority_score = Set(priority as f64);
        active.updated_at = Set(now_epoch());
        Ok(active.update(self.db.as_ref()).await?)
    }

    /// Admin hard-delete of a single active job. Swallows errors and
    /// returns `false` rather than raising (spec.md §4.1 failure semantics).
    pub async fn delete_by_id(&self, id: &str) -> bool {
        match job::Entity::delete_by_id(id).exec(self.db.as_ref()).await {
            Ok(_) => true,
            Err(e) => {
                tracing::error!("delete_by_id({id}) failed: {e}");
                false
            }
        }
    }

    pub async fn bump_stale_scores(&self, delta: f64) -> Result<u64> {
        let backend = self.db.get_database_backend();
        let sql = match backend {
            DbBackend::Postgres => {
                "UPDATE job SET priority_score = priority_score + $1 WHERE status = $2"
            }
            _ => "UPDATE job SET priority_score = priority_score + ? WHERE status = ?",
        };
        let result = self
            .db
            .execute(Statement::from_sql_and_values(
                backend,
                sql,
                vec![delta.into(), job::STATUS_QUEUED.into()],
            ))
            .await?;
        Ok(result.rows_affected())
    }

    /// Best-effort: swallows errors and returns 0 rather than raising
    /// (spec.md §4.1). Retry-idempotent — a row already archived simply
    /// won't match the `updated_at` cutoff again.
    pub async fn archive_old(&self, older_than_days: i64) -> u64 {
        match self.archive_old_inner(older_than_days).await {
            Ok(n) => n,
            Err(e) => {
                tracing::error!("archive_old failed: {e}");
                0
            }
        }
    }

    async fn archive_old_inner(&self, older_than_days: i64) -> Result<u64> {
        let cutoff = now_epoch() - older_than_days * 86_400;
        let archived_at = now_epoch();
        let txn = self.db.begin().await?;

        let old_jobs = job::Entity::find()
            .filter(job::Column::Status.is_in(TERMINAL_STATUSES))
            .filter(job::Column::UpdatedAt.lt(cutoff))
            .all(&txn)
            .await?;
        let count = old_jobs.len() as u64;

        for row in old_jobs {
            let id = row.id.clone();
            let archive_row = job_archive::ActiveModel {
                id: Set(row.id),
                user_id: Set(row.user_id),
                status: Set(row.status),
                priority: Set(row.priority),
                priority_score: Set(row.priority_score),
                model_id: Set(row.model_id),
                backend_url: Set(row.backend_url),
                request: Set(row.request),
                result: Set(row.result),
                error: Set(row.error),
                attempt_count: Set(row.attempt_count),
                max_attempts: Set(row.max_attempts),
                created_at: Set(row.created_at),
                updated_at: Set(row.updated_at),
                archived_at: Set(archived_at),
            };
            archive_row.insert(&txn).await?;
            job::Entity::delete_by_id(id).exec(&txn).await?;
        }

        txn.commit().await?;
        Ok(count)
    }

    /// No-op (returns 0) when `older_than_days <= 0`, per spec.md §3 "value
    /// 0 disables purge".
    pub async fn purge_archive(&self, older_than_days: i64) -> u64 {
        if older_than_days <= 0 {
            return 0;
        }
        match self.purge_archive_inner(older_than_days).await {
            Ok(n) => n,
            Err(e) => {
                tracing::error!("purge_archive failed: {e}");
                0
            }
        }
    }

    async fn purge_archive_inner(&self, older_than_days: i64) -> Result<u64> {
        let cutoff = now_epoch() - older_than_days * 86_400;
        let result = job_archive::Entity::delete_many()
            .filter(job_archive::Column::ArchivedAt.lt(cutoff))
            .exec(self.db.as_ref())
            .await?;
        Ok(result.rows_affected)
    }

    pub async fn list_archived(
        &self,
        filters: &AdminJobFilters,
        offset: u64,
        limit: u64,
    ) -> Result<(Vec<job_archive::Model>, u64)> {
        let mut query = job_archive::Entity::find();
        if let Some(status) = &filters.status {
            query = query.filter(job_archive::Column::Status.eq(status.clone()));
        }
        if let Some(model_id) = &filters.model_id {
            query = query.filter(job_archive::Column::ModelId.eq(model_id.clone()));
        }
        if let Some(user_id) = &filters.user_id {
            query = query.filter(job_archive::Column::UserId.eq(user_id.clone()));
        }
        let total = query.clone().count(self.db.as_ref()).await?;
        let rows = query
            .order_by_desc(job_archive::Column::ArchivedAt)
            .offset(offset)
            .limit(limit)
            .all(self.db.as_ref())
            .await?;
        Ok((rows, total))
    }

    /// Active-table-only aggregations.
    pub async fn job_analytics(&self) -> Result<JobAnalytics> {
        self.analytics(false).await
    }

    /// Aggregations over the union of `job` and `job_archive`.
    pub async fn combined_analytics(&self) -> Result<JobAnalytics> {
        self.analytics(true).await
    }

    async fn analytics(&self, combined: bool) -> Result<JobAnalytics> {
        let backend = self.db.get_database_backend();
        let source = if combined {
            "(SELECT status, user_id, model_id, created_at, updated_at FROM job \
              UNION ALL \
              SELECT status, user_id, model_id, created_at, updated_at FROM job_archive) t"
        } else {
            "(SELECT status, user_id, model_id, created_at, updated_at FROM job) t"
        };

        let total: i64 = self
            .db
            .query_one(Statement::from_string(
                backend,
                format!("SELECT COUNT(*) as c FROM {source}"),
            ))
            .await?
            .map(|r| r.try_get::<i64>("", "c"))
            .transpose()?
            .unwrap_or(0);

        let mut by_status = HashMap::new();
        for row in self
            .db
            .query_all(Statement::from_string(
                backend,
                format!("SELECT status, COUNT(*) as c FROM {source} GROUP BY status"),
            ))
            .await?
        {
            by_status.insert(row.try_get::<String>("", "status")?, row.try_get::<i64>("", "c")?);
        }

        let by_model = self
            .db
            .query_all(Statement::from_string(
                backend,
                format!(
                    "SELECT model_id, COUNT(*) as total, \
                       SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END) as completed, \
                       SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END) as failed \
                     FROM {source} WHERE model_id IS NOT NULL \
                     GROUP BY model_id ORDER BY total DESC LIMIT 20"
                ),
            ))
            .await?
            .into_iter()
            .map(|row| {
                Ok(ModelCount {
                    model_id: row.try_get("", "model_id")?,
                    total: row.try_get("", "total")?,
                    completed: row.try_get("", "completed")?,
                    failed: row.try_get("", "failed")?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let by_user = self
            .db
            .query_all(Statement::from_string(
                backend,
                format!(
                    "SELECT user_id, COUNT(*) as total, \
                       SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END) as completed, \
                       SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END) as failed, \
                       SUM(CASE WHEN status = 'cancelled' THEN 1 ELSE 0 END) as cancelled \
                     FROM {source} GROUP BY user_id ORDER BY total DESC LIMIT 20"
                ),
            ))
            .await?
            .into_iter()
            .map(|row| {
                Ok(UserCount {
                    user_id: row.try_get("", "user_id")?,
                    total: row.try_get("", "total")?,
                    completed: row.try_get("", "completed")?,
                    failed: row.try_get("", "failed")?,
                    cancelled: row.try_get("", "cancelled")?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        // Daily bucketing must produce identical ISO-date output regardless
        // of the backing engine (spec.md §4.1).
        let day_expr = match backend {
            DbBackend::Sqlite => "strftime('%Y-%m-%d', datetime(created_at, 'unixepoch'))",
            _ => "to_char(to_timestamp(created_at), 'YYYY-MM-DD')",
        };
        let cutoff_90d = now_epoch() - 90 * 86_400;
        let daily_history = self
            .db
            .query_all(Statement::from_string(
                backend,
                format!(
                    "SELECT {day_expr} as day_bucket, COUNT(*) as total, \
                       SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END) as completed, \
                       SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END) as failed \
                     FROM {source} WHERE created_at >= {cutoff_90d} \
                     GROUP BY day_bucket ORDER BY day_bucket"
                ),
            ))
            .await?
            .into_iter()
            .map(|row| {
                Ok(DailyBucket {
                    date: row.try_get("", "day_bucket")?,
                    total: row.try_get("", "total")?,
                    completed: row.try_get("", "completed")?,
                    failed: row.try_get("", "failed")?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let avg_wait_seconds: f64 = self
            .db
            .query_one(Statement::from_string(
                backend,
                format!(
                    "SELECT AVG(updated_at - created_at) as w FROM {source} WHERE status = 'completed'"
                ),
            ))
            .await?
            .map(|r| r.try_get::<Option<f64>>("", "w"))
            .transpose()?
            .flatten()
            .unwrap_or(0.0);

        Ok(JobAnalytics {
            total,
            by_status,
            by_model,
            by_user,
            daily_history,
            avg_wait_seconds,
            includes_archive: combined,
        })
    }
}

/// Pure decision extracted from `mark_failed` so the requeue-vs-fail
/// boundary can be unit tested without a database.
fn next_status_after_failure(attempt_count: i32, max_attempts: i32, requeue: bool) -> &'static str {
    if requeue && attempt_count < max_attempts {
        job::STATUS_QUEUED
    } else {
        job::STATUS_FAILED
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_score_seeds_from_base_priority() {
        // priority=10 -> priority_score=10.0, matching `insert`'s `priority as f64`.
        assert_eq!(10_i32 as f64, 10.0);
    }

    #[test]
    fn requeue_below_max_attempts_goes_back_to_queued() {
        assert_eq!(next_status_after_failure(0, 3, true), job::STATUS_QUEUED);
        assert_eq!(next_status_after_failure(2, 3, true), job::STATUS_QUEUED);
    }

    #[test]
    fn requeue_at_max_attempts_becomes_failed() {
        assert_eq!(next_status_after_failure(3, 3, true), job::STATUS_FAILED);
        assert_eq!(next_status_after_failure(1, 1, true), job::STATUS_FAILED);
    }

    #[test]
    fn requeue_false_always_fails_regardless_of_attempts() {
        assert_eq!(next_status_after_failure(0, 3, false), job::STATUS_FAILED);
    }
}

use std::sync::Arc;
use std::time::Duration;

use sea_orm::{ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter};
use sysinfo::{CpuExt, System, SystemExt};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::db::entities::{backend_snapshot, job};
use crate::dispatch::Dispatcher;
use crate::metrics::MetricsRegistry;
use crate::selector::BackendSelector;
use crate::store::JobStore;

/// A single synthetic backend row used for host-only snapshots when no
/// backends are configured (spec.md §4.5).
const LOCAL_BACKEND_LABEL: &str = "__local__";

/// Owns the four perpetually-running maintenance tasks (spec.md §4.5):
/// dispatch, starvation, archive, snapshot. Each loop swallows its own
/// errors and never terminates the group.
pub struct Scheduler {
    store: Arc<JobStore>,
    metrics: Arc<MetricsRegistry>,
    selector: Arc<BackendSelector>,
    dispatcher: Arc<Dispatcher>,
    config: Arc<Config>,
}

impl Scheduler {
    pub fn new(
        store: Arc<JobStore>,
        metrics: Arc<MetricsRegistry>,
        selector: Arc<BackendSelector>,
        dispatcher: Arc<Dispatcher>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            metrics,
            selector,
            dispatcher,
            config,
        }
    }

    /// Spawns all maintenance loops as detached tasks and returns their
    /// handles so the caller can track liveness (none are awaited on the
    /// request path).
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(self.clone().dispatch_loop()),
            tokio::spawn(self.clone().starvation_loop()),
            tokio::spawn(self.clone().archive_loop()),
            tokio::spawn(self.clone().snapshot_loop()),
            tokio::spawn(self.clone().health_loop()),
        ]
    }

    /// Claims queued jobs by priority and spawns a detached Dispatcher
    /// worker for each, bounded by a semaphore of capacity
    /// `MAX_CONCURRENT_JOBS`. Never blocks on worker completion.
    async fn dispatch_loop(self: Arc<Self>) {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_jobs));
        let mut tick = tokio::time::interval(Duration::from_secs(self.config.scheduler_tick_seconds));
        loop {
            tick.tick().await;
            loop {
                // Acquire a slot before claiming — claiming flips the row to
                // `running` immediately, so claiming first and blocking on
                // capacity afterward would strand the row in `running` with
                // no worker ever spawned for it.
                let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                    break;
                };

                let claimed = match self.store.claim_next().await {
                    Ok(Some(job)) => job,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!("claim_next failed: {e}");
                        break;
                    }
                };

                let this = self.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    let backend_url = this.selector.select(claimed.model_id.as_deref()).await;
                    match backend_url {
                        Some(backend_url) => {
                            this.dispatcher.dispatch(claimed, &backend_url).await;
                        }
                        None => {
                            let _ = this
                                .store
                                .mark_failed(&claimed.id, "no backend available for model", true)
                                .await;
                        }
                    }
                });
            }
        }
    }

    /// Periodically bumps the priority score of every still-queued job so
    /// low-priority work cannot starve forever (spec.md §4.5).
    async fn starvation_loop(self: Arc<Self>) {
        let mut tick = tokio::time::interval(Duration::from_secs(self.config.starvation_tick_seconds));
        loop {
            tick.tick().await;
            match self.store.bump_stale_scores(self.config.starvation_increment).await {
                Ok(n) if n > 0 => tracing::debug!("bumped priority_score for {n} queued jobs"),
                Ok(_) => {}
                Err(e) => tracing::error!("bump_stale_scores failed: {e}"),
            }
        }
    }

    /// Moves aged terminal jobs into the archive table, then purges aged
    /// archive rows (spec.md §4.1, §4.5).
    async fn archive_loop(self: Arc<Self>) {
        let mut tick =
            tokio::time::interval(Duration::from_secs(self.config.archive_check_interval_seconds));
        loop {
            tick.tick().await;
            let archived = self.store.archive_old(self.config.job_retention_days).await;
            if archived > 0 {
                tracing::info!("archived {archived} terminal jobs");
            }
            if self.config.job_archive_retention_days > 0 {
                let purged = self
                    .store
                    .purge_archive(self.config.job_archive_retention_days)
                    .await;
                if purged > 0 {
                    tracing::info!("purged {purged} archive rows past retention");
                }
            }
        }
    }

    /// Samples host CPU/RAM and per-backend job/model/VRAM figures into
    /// `backend_snapshot`, purging old rows once per wall-clock day.
    async fn snapshot_loop(self: Arc<Self>) {
        let mut tick =
            tokio::time::interval(Duration::from_secs(self.config.backend_snapshot_interval_seconds));
        let mut last_purge_day: Option<i64> = None;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(3))
            .build()
            .expect("reqwest client builds with static config");

        loop {
            tick.tick().await;
            if let Err(e) = self.snapshot_once(&client).await {
                tracing::error!("snapshot loop iteration failed: {e}");
            }

            let today = chrono::Utc::now().date_naive().num_days_from_ce() as i64;
            if last_purge_day != Some(today) {
                last_purge_day = Some(today);
                match self.purge_old_snapshots().await {
                    Ok(n) if n > 0 => tracing::info!("purged {n} backend_snapshot rows past retention"),
                    Ok(_) => {}
                    Err(e) => tracing::error!("backend_snapshot purge failed: {e}"),
                }
            }
        }
    }

    async fn snapshot_once(&self, client: &reqwest::Client) -> crate::error::Result<()> {
        let mut sys = System::new_all();
        sys.refresh_cpu();
        sys.refresh_memory();
        let cpu_percent = sys.global_cpu_info().cpu_usage() as f64;
        let ram_percent = if sys.total_memory() > 0 {
            sys.used_memory() as f64 / sys.total_memory() as f64 * 100.0
        } else {
            0.0
        };

        let db = self.store.raw_connection();
        let running = job::Entity::find()
            .filter(job::Column::Status.eq(job::STATUS_RUNNING))
            .count(db.as_ref())
            .await?;
        let queued = job::Entity::find()
            .filter(job::Column::Status.eq(job::STATUS_QUEUED))
            .count(db.as_ref())
            .await?;

        let backends = self.config.backends.iter().filter(|b| b.enabled).collect::<Vec<_>>();
        if backends.is_empty() {
            self.insert_snapshot(
                LOCAL_BACKEND_LABEL,
                cpu_percent,
                ram_percent,
                running as i32,
                queued as i32,
                None,
                None,
            )
            .await?;
            return Ok(());
        }

        for backend in backends {
            let (loaded_models, vram_used_gb) = probe_loaded_models(client, &backend.url).await;
            let avg_tps = self
                .metrics
                .get(&backend.url)
                .await
                .and_then(|m| m.avg_tokens_per_second);
            self.insert_snapshot(
                &backend.url,
                cpu_percent,
                ram_percent,
                running as i32,
                queued as i32,
                loaded_models,
                vram_used_gb,
            )
            .await?;
            if let Some(avg_tps) = avg_tps {
                tracing::debug!(backend = %backend.url, avg_tps, "snapshot: tokens/sec");
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn insert_snapshot(
        &self,
        backend_url: &str,
        cpu_percent: f64,
        ram_percent: f64,
        active_jobs: i32,
        queued_jobs: i32,
        loaded_models: Option<i32>,
        vram_used_gb: Option<f64>,
    ) -> crate::error::Result<()> {
        use sea_orm::{ActiveModelTrait, Set};
        let avg_tps = self.metrics.get(backend_url).await.and_then(|m| m.avg_tokens_per_second);
        let row = backend_snapshot::ActiveModel {
            id: sea_orm::ActiveValue::NotSet,
            captured_at: Set(chrono::Utc::now().timestamp()),
            backend_url: Set(backend_url.to_string()),
            cpu_percent: Set(Some(cpu_percent)),
            ram_percent: Set(Some(ram_percent)),
            active_jobs: Set(Some(active_jobs)),
            queued_jobs: Set(Some(queued_jobs)),
            loaded_models: Set(loaded_models),
            vram_used_gb: Set(vram_used_gb),
            avg_tokens_per_second: Set(avg_tps),
        };
        row.insert(self.store.raw_connection().as_ref()).await?;
        Ok(())
    }

    async fn purge_old_snapshots(&self) -> crate::error::Result<u64> {
        use sea_orm::ColumnTrait as _;
        let cutoff =
            chrono::Utc::now().timestamp() - self.config.backend_snapshot_retention_days * 86_400;
        let result = backend_snapshot::Entity::delete_many()
            .filter(backend_snapshot::Column::CapturedAt.lt(cutoff))
            .exec(self.store.raw_connection().as_ref())
            .await?;
        Ok(result.rows_affected)
    }

    /// Probes each configured backend's `/api/version` endpoint and
    /// records health into the Metrics Registry. Supplements the four
    /// named loops in spec.md §4.5 with the distinct health-check cadence
    /// implied by `OLLAMA_HEALTH_CHECK_INTERVAL`/`_TIMEOUT` (present in the
    /// original but not spelled out as its own bullet in the distillation).
    async fn health_loop(self: Arc<Self>) {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.config.ollama_health_check_timeout_seconds))
            .build()
            .expect("reqwest client builds with static config");
        let mut tick = tokio::time::interval(Duration::from_secs(
            self.config.ollama_health_check_interval_seconds,
        ));
        loop {
            tick.tick().await;
            for backend in self.config.backends.iter().filter(|b| b.enabled) {
                let url = format!("{}/api/version", backend.url.trim_end_matches('/'));
                let healthy = client
                    .get(&url)
                    .send()
                    .await
                    .is_ok_and(|resp| resp.status().is_success());
                self.metrics.set_health(&backend.url, healthy).await;
            }
        }
    }
}

/// Probes `/api/ps`, counts loaded models, and sums their VRAM usage
/// (falling back to `size` when `size_vram` is 0, for unified-memory
/// platforms). Returns `(None, None)` on any probe failure — snapshot
/// sampling never blocks on backend health.
async fn probe_loaded_models(client: &reqwest::Client, backend_url: &str) -> (Option<i32>, Option<f64>) {
    let url = format!("{}/api/ps", backend_url.trim_end_matches('/'));
    let Ok(response) = client.get(&url).send().await else {
        return (None, None);
    };
    let Ok(payload) = response.json::<serde_json::Value>().await else {
        return (None, None);
    };
    let Some(models) = payload.get("models").and_then(|m| m.as_array()) else {
        return (None, None);
    };

    let count = models.len() as i32;
    let total_bytes: i64 = models
        .iter()
        .map(|m| {
            let size_vram = m.get("size_vram").and_then(|v| v.as_i64()).unwrap_or(0);
            if size_vram > 0 {
                size_vram
            } else {
                m.get("size").and_then(|v| v.as_i64()).unwrap_or(0)
            }
        })
        .sum();
    let gb = total_bytes as f64 / (1024.0 * 1024.0 * 1024.0);
    (Some(count), Some(gb))
}

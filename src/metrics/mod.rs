use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::RwLock;

/// Smoothing factor shared by response-time and tokens-per-second EMAs.
const EMA_ALPHA: f64 = 0.3;
/// Samples outside this range are treated as instrumentation noise and
/// dropped rather than folded into the tokens/sec average.
const TOKENS_PER_SECOND_BOUNDS: (f64, f64) = (0.1, 1000.0);
/// A health reading older than this is reported as unknown rather than
/// trusted (spec.md §5, freshness window).
const HEALTH_TTL_SECONDS: i64 = 120;

#[derive(Clone, Debug, Serialize)]
pub struct BackendMetrics {
    pub backend_url: String,
    pub active_jobs: i64,
    pub avg_response_time_ms: Option<f64>,
    pub avg_tokens_per_second: Option<f64>,
    pub sample_count: u64,
    pub healthy: Option<bool>,
    pub last_health_check_at: Option<i64>,
    pub alert_active_jobs: bool,
    pub alert_response_time: bool,
}

impl BackendMetrics {
    fn new(backend_url: &str) -> Self {
        Self {
            backend_url: backend_url.to_string(),
            active_jobs: 0,
            avg_response_time_ms: None,
            avg_tokens_per_second: None,
            sample_count: 0,
            healthy: None,
            last_health_check_at: None,
            alert_active_jobs: false,
            alert_response_time: false,
        }
    }

    /// Returns the health reading, or `None` if it's missing or stale.
    pub fn health(&self, now: i64) -> Option<bool> {
        let checked_at = self.last_health_check_at?;
        if now - checked_at > HEALTH_TTL_SECONDS {
            return None;
        }
        self.healthy
    }
}

fn ema(previous: Option<f64>, sample: f64) -> f64 {
    match previous {
        Some(prev) => EMA_ALPHA * sample + (1.0 - EMA_ALPHA) * prev,
        None => sample,
    }
}

/// Process-local registry of per-backend load and health figures, read by
/// the selector (C3) and surfaced via `GET /system/metrics`. There is no
/// shared-cache backing (no Redis crate in the pack) — this is the pure
/// in-process fallback the spec allows when no external cache is wired up.
pub struct MetricsRegistry {
    inner: Arc<RwLock<HashMap<String, BackendMetrics>>>,
    active_jobs_alert_threshold: i64,
    response_time_alert_threshold_ms: f64,
}

impl MetricsRegistry {
    pub fn new(active_jobs_alert_threshold: i64, response_time_alert_threshold_ms: f64) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            active_jobs_alert_threshold,
            response_time_alert_threshold_ms,
        }
    }

    async fn entry(&self, backend_url: &str) -> BackendMetrics {
        let mut guard = self.inner.write().await;
        guard
            .entry(backend_url.to_string())
            .or_insert_with(|| BackendMetrics::new(backend_url))
            .clone()
    }

    /// Increments (or decrements, with `delta < 0`) the active-job count
    /// for a backend. Floored at zero so a duplicate decrement from a
    /// reentrant guard can never go negative (spec.md §5.2).
    pub async fn adjust_active_jobs(&self, backend_url: &str, delta: i64) -> i64 {
        let mut guard = self.inner.write().await;
        let entry = guard
            .entry(backend_url.to_string())
            .or_insert_with(|| BackendMetrics::new(backend_url));
        entry.active_jobs = (entry.active_jobs + delta).max(0);
        entry.alert_active_jobs = entry.active_jobs >= self.active_jobs_alert_threshold;
        entry.active_jobs
    }

    pub async fn record_latency(&self, backend_url: &str, sample_ms: f64) {
        let mut guard = self.inner.write().await;
        let entry = guard
            .entry(backend_url.to_string())
            .or_insert_with(|| BackendMetrics::new(backend_url));
        entry.avg_response_time_ms = Some(ema(entry.avg_response_time_ms, sample_ms));
        entry.sample_count += 1;
        entry.alert_response_time = entry
            .avg_response_time_ms
            .is_some_and(|v| v >= self.response_time_alert_threshold_ms);
    }

    /// Samples outside `TOKENS_PER_SECOND_BOUNDS` are dropped as noise
    /// (near-zero-duration or runaway values from malformed backend
    /// responses) rather than polluting the EMA.
    pub async fn record_tokens_per_second(&self, backend_url: &str, sample: f64) {
        if sample < TOKENS_PER_SECOND_BOUNDS.0 || sample > TOKENS_PER_SECOND_BOUNDS.1 {
            return;
        }
        let mut guard = self.inner.write().await;
        let entry = guard
            .entry(backend_url.to_string())
            .or_insert_with(|| BackendMetrics::new(backend_url));
        entry.avg_tokens_per_second = Some(ema(entry.avg_tokens_per_second, sample));
    }

    pub async fn set_health(&self, backend_url: &str, healthy: bool) {
        let mut guard = self.inner.write().await;
        let entry = guard
            .entry(backend_url.to_string())
            .or_insert_with(|| BackendMetrics::new(backend_url));
        entry.healthy = Some(healthy);
        entry.last_health_check_at = Some(Utc::now().timestamp());
    }

    pub async fn get(&self, backend_url: &str) -> Option<BackendMetrics> {
        self.inner.read().await.get(backend_url).cloned()
    }

    pub async fn snapshot(&self) -> Vec<BackendMetrics> {
        self.inner.read().await.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ema_seeds_from_first_sample() {
        assert_eq!(ema(None, 42.0), 42.0);
    }

    #[test]
    fn ema_blends_toward_new_sample() {
        let first = ema(None, 100.0);
        let second = ema(Some(first), 200.0);
        assert!((second - 130.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn active_jobs_never_goes_negative() {
        let registry = MetricsRegistry::new(10, 5000.0);
        registry.adjust_active_jobs("http://b1", -1).await;
        let m = registry.get("http://b1").await.unwrap();
        assert_eq!(m.active_jobs, 0);
    }

    #[tokio::test]
    async fn active_jobs_alert_fires_at_threshold() {
        let registry = MetricsRegistry::new(2, 5000.0);
        registry.adjust_active_jobs("http://b1", 1).await;
        registry.adjust_active_jobs("http://b1", 1).await;
        let m = registry.get("http://b1").await.unwrap();
        assert!(m.alert_active_jobs);
    }

    #[tokio::test]
    async fn health_reading_expires_after_ttl() {
        let registry = MetricsRegistry::new(10, 5000.0);
        registry.set_health("http://b1", true).await;
        let mut m = registry.get("http://b1").await.unwrap();
        assert_eq!(m.health(Utc::now().timestamp()), Some(true));
        m.last_health_check_at = Some(0);
        assert_eq!(m.health(Utc::now().timestamp()), None);
    }

    #[tokio::test]
    async fn tokens_per_second_outliers_are_dropped() {
        let registry = MetricsRegistry::new(10, 5000.0);
        registry.record_tokens_per_second("http://b1", 2000.0).await;
        assert!(registry.get("http://b1").await.unwrap().avg_tokens_per_second.is_none());
        registry.record_tokens_per_second("http://b1", 25.0).await;
        assert_eq!(
            registry.get("http://b1").await.unwrap().avg_tokens_per_second,
            Some(25.0)
        );
    }
}

use std::sync::Arc;

use chrono::Utc;
use rand::seq::SliceRandom;
use tokio::sync::RwLock;

use crate::config::Config;
use crate::metrics::{BackendMetrics, MetricsRegistry};

/// Selectable load-balancing strategies (spec.md §5.3). Mirrors the
/// Python original's `LB_STRATEGIES` validation set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    LeastConnections,
    RoundRobin,
    Fastest,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::LeastConnections => "least_connections",
            Strategy::RoundRobin => "round_robin",
            Strategy::Fastest => "fastest",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "least_connections" => Some(Strategy::LeastConnections),
            "round_robin" => Some(Strategy::RoundRobin),
            "fastest" => Some(Strategy::Fastest),
            _ => None,
        }
    }
}

/// Picks which configured backend a dispatch should target, and holds the
/// runtime-swappable strategy (`GET`/`POST /system/lb-strategy`).
pub struct BackendSelector {
    backends: Vec<String>,
    /// model_id -> indices into `backends`, from `MODEL_BACKEND_MAP`.
    model_backend_map: std::collections::HashMap<String, Vec<usize>>,
    metrics: Arc<MetricsRegistry>,
    strategy: RwLock<Strategy>,
    active_jobs_weight: f64,
    response_time_weight: f64,
    /// Round-robin cursor keyed by model id (unmapped requests share the
    /// `""` key) — a single shared cursor would rotate incorrectly once
    /// different models have different candidate sets (spec.md §4.3).
    round_robin_cursors: RwLock<std::collections::HashMap<String, usize>>,
}

impl BackendSelector {
    pub fn new(config: &Config, metrics: Arc<MetricsRegistry>) -> Self {
        let initial = Strategy::parse(&config.ollama_lb_strategy).unwrap_or(Strategy::LeastConnections);
        Self {
            backends: config
                .backends
                .iter()
                .filter(|b| b.enabled)
                .map(|b| b.url.clone())
                .collect(),
            model_backend_map: config.model_backend_map.clone(),
            metrics,
            strategy: RwLock::new(initial),
            active_jobs_weight: config.ollama_lb_active_jobs_weight,
            response_time_weight: config.ollama_lb_response_time_weight,
            round_robin_cursors: RwLock::new(std::collections::HashMap::new()),
        }
    }

    pub async fn strategy(&self) -> Strategy {
        *self.strategy.read().await
    }

    pub async fn set_strategy(&self, strategy: Strategy) {
        *self.strategy.write().await = strategy;
    }

    /// Candidate URLs for a model: entries from `MODEL_BACKEND_MAP` when the
    /// model is known, otherwise every configured backend.
    fn candidates_for(&self, model_id: Option<&str>) -> Vec<String> {
        if let Some(model_id) = model_id {
            if let Some(indices) = self.model_backend_map.get(model_id) {
                let restricted: Vec<String> = indices
                    .iter()
                    .filter_map(|&i| self.backends.get(i).cloned())
                    .collect();
                if !restricted.is_empty() {
                    return restricted;
                }
            }
        }
        self.backends.clone()
    }

    /// Picks a backend URL for the next dispatch, or `None` if no backends
    /// are configured (or none are mapped to `model_id`). Honors the
    /// currently active strategy.
    pub async fn select(&self, model_id: Option<&str>) -> Option<String> {
        let candidates = self.candidates_for(model_id);
        if candidates.is_empty() {
            return None;
        }
        if candidates.len() == 1 {
            return Some(candidates[0].clone());
        }
        match self.strategy().await {
            Strategy::LeastConnections => self.select_least_connections(&candidates).await,
            Strategy::RoundRobin => self.select_round_robin(model_id, &candidates).await,
            Strategy::Fastest => self.select_fastest(&candidates).await,
        }
    }

    /// Candidates whose last health check reported unhealthy, dropped
    /// unless doing so would leave nothing to choose from, in which case
    /// the filter is dropped entirely (spec.md §5.3, degraded-cluster
    /// fallback). Shared by `round_robin` and `least_connections`.
    async fn healthy_or_all(&self, candidates: &[String]) -> Vec<String> {
        let now = Utc::now().timestamp();
        let mut healthy = Vec::with_capacity(candidates.len());
        for url in candidates {
            let unhealthy = matches!(self.metrics.get(url).await.and_then(|m| m.health(now)), Some(false));
            if !unhealthy {
                healthy.push(url.clone());
            }
        }
        if healthy.is_empty() {
            candidates.to_vec()
        } else {
            healthy
        }
    }

    /// Cycles through healthy candidates using a counter keyed by
    /// `model_id` (spec.md §4.3) — unmapped requests share the `""` key.
    async fn select_round_robin(&self, model_id: Option<&str>, candidates: &[String]) -> Option<String> {
        let healthy = self.healthy_or_all(candidates).await;
        if healthy.is_empty() {
            return None;
        }
        let key = model_id.unwrap_or("").to_string();
        let mut cursors = self.round_robin_cursors.write().await;
        let cursor = cursors.entry(key).or_insert(0);
        let idx = *cursor % healthy.len();
        *cursor = cursor.wrapping_add(1);
        Some(healthy[idx].clone())
    }

    /// Weighted least-connections score: lower is better. Candidates whose
    /// last health check reported unhealthy are filtered out unless doing
    /// so would leave nothing to choose from, in which case the filter is
    /// dropped entirely (spec.md §5.3, degraded-cluster fallback).
    async fn select_least_connections(&self, candidates: &[String]) -> Option<String> {
        let now = Utc::now().timestamp();
        let mut metrics_by_url = Vec::with_capacity(candidates.len());
        for url in candidates {
            metrics_by_url.push((url.clone(), self.metrics.get(url).await));
        }

        let healthy: Vec<(String, Option<BackendMetrics>)> = metrics_by_url
            .iter()
            .filter(|(_, m)| !matches!(m.as_ref().and_then(|m| m.health(now)), Some(false)))
            .cloned()
            .collect();

        if healthy.is_empty() {
            self.score_and_pick(&metrics_by_url)
        } else {
            self.score_and_pick(&healthy)
        }
    }

    fn score_and_pick(&self, candidates: &[(String, Option<BackendMetrics>)]) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }
        // If nobody has metrics yet, there is nothing to rank on — pick at random.
        if candidates.iter().all(|(_, m)| m.is_none()) {
            return candidates.choose(&mut rand::thread_rng()).map(|(url, _)| url.clone());
        }
        let mut best: Option<(usize, f64)> = None;
        for (idx, (_, m)) in candidates.iter().enumerate() {
            let score = match m {
                Some(m) => {
                    let active = m.active_jobs as f64;
                    let latency_s = m.avg_response_time_ms.unwrap_or(0.0) / 1000.0;
                    self.active_jobs_weight * active + self.response_time_weight * latency_s
                }
                None => 0.0,
            };
            match best {
                Some((_, best_score)) if score >= best_score => {}
                _ => best = Some((idx, score)),
            }
        }
        best.map(|(idx, _)| candidates[idx].0.clone())
    }

    async fn select_fastest(&self, candidates: &[String]) -> Option<String> {
        let now = Utc::now().timestamp();
        let mut best: Option<(String, f64)> = None;
        for url in candidates {
            let Some(m) = self.metrics.get(url).await else {
                continue;
            };
            if matches!(m.health(now), Some(false)) {
                continue;
            }
            let Some(latency) = m.avg_response_time_ms else {
                continue;
            };
            match &best {
                Some((_, best_latency)) if latency >= *best_latency => {}
                _ => best = Some((url.clone(), latency)),
            }
        }
        best.map(|(url, _)| url)
            .or_else(|| candidates.choose(&mut rand::thread_rng()).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics_with(active_jobs: i64, avg_response_time_ms: Option<f64>) -> BackendMetrics {
        BackendMetrics {
            backend_url: "http://test".to_string(),
            active_jobs,
            avg_response_time_ms,
            avg_tokens_per_second: None,
            sample_count: 1,
            healthy: Some(true),
            last_health_check_at: Some(Utc::now().timestamp()),
            alert_active_jobs: false,
            alert_response_time: false,
        }
    }

    fn bare_selector() -> BackendSelector {
        BackendSelector {
            backends: vec!["http://a".into(), "http://b".into()],
            model_backend_map: std::collections::HashMap::new(),
            metrics: Arc::new(MetricsRegistry::new(10, 5000.0)),
            strategy: RwLock::new(Strategy::LeastConnections),
            active_jobs_weight: 1.0,
            response_time_weight: 1.0,
            round_robin_cursors: RwLock::new(std::collections::HashMap::new()),
        }
    }

    #[test]
    fn strategy_parses_known_values_only() {
        assert_eq!(Strategy::parse("least_connections"), Some(Strategy::LeastConnections));
        assert_eq!(Strategy::parse("bogus"), None);
    }

    #[test]
    fn lower_score_wins() {
        let selector = bare_selector();
        let candidates = vec![
            ("http://a".to_string(), Some(metrics_with(5, Some(1000.0)))),
            ("http://b".to_string(), Some(metrics_with(1, Some(1000.0)))),
        ];
        assert_eq!(selector.score_and_pick(&candidates), Some("http://b".to_string()));
    }

    #[tokio::test]
    async fn round_robin_cycles_through_all_backends() {
        let selector = bare_selector();
        let candidates = vec!["http://a".to_string(), "http://b".to_string()];
        let first = selector.select_round_robin(None, &candidates).await.unwrap();
        let second = selector.select_round_robin(None, &candidates).await.unwrap();
        assert_ne!(first, second);
        let third = selector.select_round_robin(None, &candidates).await.unwrap();
        assert_eq!(first, third);
    }

    #[tokio::test]
    async fn round_robin_cursor_is_independent_per_model() {
        let selector = bare_selector();
        let candidates = vec!["http://a".to_string(), "http://b".to_string()];
        let first = selector.select_round_robin(Some("llama3"), &candidates).await.unwrap();
        // A different model's cursor starts fresh rather than sharing state.
        let other_model_first = selector.select_round_robin(Some("mistral"), &candidates).await.unwrap();
        assert_eq!(first, other_model_first);
    }

    #[test]
    fn model_backend_map_restricts_candidates() {
        let mut selector = bare_selector();
        selector.model_backend_map.insert("llama3".to_string(), vec![1]);
        assert_eq!(selector.candidates_for(Some("llama3")), vec!["http://b".to_string()]);
        assert_eq!(
            selector.candidates_for(Some("unmapped-model")),
            vec!["http://a".to_string(), "http://b".to_string()]
        );
    }
}

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::Value;

use crate::db::entities::job;
use crate::error::{QueueError, Result};
use crate::metrics::MetricsRegistry;
use crate::sse::SseRegistry;
use crate::store::JobStore;

const DEFAULT_BACKEND_TIMEOUT: Duration = Duration::from_secs(120);

fn tokens_per_second(eval_count: i64, eval_duration_ns: i64) -> Option<f64> {
    if eval_duration_ns <= 0 {
        return None;
    }
    Some(eval_count as f64 / (eval_duration_ns as f64 / 1e9))
}

/// Does `chunk`, with whitespace stripped, contain the byte sequence
/// `"done":true`? Avoids parsing every NDJSON chunk as JSON just to check
/// for the terminal frame (spec.md §9).
fn contains_done_true(chunk: &[u8]) -> bool {
    const NEEDLE: &[u8] = b"\"done\":true";
    let stripped: Vec<u8> = chunk.iter().copied().filter(|b| !b.is_ascii_whitespace()).collect();
    stripped.windows(NEEDLE.len()).any(|w| w == NEEDLE)
}

fn parse_eval_stats(chunk: &[u8]) -> Option<(i64, i64)> {
    for line in chunk.split(|&b| b == b'\n') {
        if line.is_empty() || !contains_done_true(line) {
            continue;
        }
        if let Ok(value) = serde_json::from_slice::<Value>(line) {
            let eval_count = value.get("eval_count")?.as_i64()?;
            let eval_duration = value.get("eval_duration")?.as_i64()?;
            return Some((eval_count, eval_duration));
        }
    }
    None
}

/// Thin `reqwest`-based stand-in for "the generic chat-completion helper
/// that marshals and forwards model requests" (spec.md §1) — the one
/// external collaborator the Dispatcher cannot function without, so it is
/// implemented concretely against the documented wire contract (spec.md §6)
/// rather than stubbed.
pub struct ChatClient {
    http: reqwest::Client,
}

pub struct ChatResponse {
    pub body: Value,
}

impl ChatResponse {
    pub fn eval_stats(&self) -> Option<(i64, i64)> {
        let eval_count = self.body.get("eval_count")?.as_i64()?;
        let eval_duration = self.body.get("eval_duration")?.as_i64()?;
        Some((eval_count, eval_duration))
    }
}

impl ChatClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(DEFAULT_BACKEND_TIMEOUT)
                .build()
                .expect("reqwest client builds with static config"),
        }
    }

    fn force_stream(request: &Value, stream: bool) -> Value {
        let mut body = request.clone();
        if let Value::Object(map) = &mut body {
            map.insert("stream".to_string(), Value::Bool(stream));
        }
        body
    }

    /// POSTs to the backend's chat endpoint with `stream` forced to
    /// `false` — the caller never sees partial output through the queue
    /// path (spec.md §4.4).
    pub async fn chat_completion(&self, backend_url: &str, request: &Value) -> Result<ChatResponse> {
        let url = format!("{}/api/chat", backend_url.trim_end_matches('/'));
        let body = Self::force_stream(request, false);
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| QueueError::TransientBackend(e.to_string()))?;
        let status = response.status();
        let payload: Value = response
            .json()
            .await
            .map_err(|e| QueueError::TransientBackend(format!("invalid backend response body: {e}")))?;
        if !status.is_success() {
            return Err(QueueError::TransientBackend(format!(
                "backend {backend_url} returned {status}"
            )));
        }
        Ok(ChatResponse { body: payload })
    }

    /// Streaming variant for a synchronous-to-the-user caller (not routed
    /// through the job queue). Returns the raw NDJSON byte stream;
    /// `Dispatcher::stream_chat_completion` wraps it with metrics tracking.
    async fn chat_completion_stream(
        &self,
        backend_url: &str,
        request: &Value,
    ) -> Result<impl Stream<Item = reqwest::Result<Bytes>>> {
        let url = format!("{}/api/chat", backend_url.trim_end_matches('/'));
        let body = Self::force_stream(request, true);
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| QueueError::TransientBackend(e.to_string()))?;
        Ok(response.bytes_stream())
    }
}

impl Default for ChatClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks the wall-clock timer and `active_jobs` counter for one in-flight
/// dispatch, guaranteeing the decrement happens exactly once — on normal
/// completion, on error, or if the caller simply drops the stream
/// (disconnect-safety, spec.md §4.4).
struct ActiveJobTracker {
    metrics: Arc<MetricsRegistry>,
    backend_url: String,
    start: Instant,
    finished: bool,
}

impl ActiveJobTracker {
    fn new(metrics: Arc<MetricsRegistry>, backend_url: String) -> Self {
        Self {
            metrics,
            backend_url,
            start: Instant::now(),
            finished: false,
        }
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        let metrics = self.metrics.clone();
        let backend_url = self.backend_url.clone();
        let elapsed_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        tokio::spawn(async move {
            metrics.record_latency(&backend_url, elapsed_ms).await;
            metrics.adjust_active_jobs(&backend_url, -1).await;
        });
    }
}

impl Drop for ActiveJobTracker {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Executes one claimed job against a selected backend (spec.md §4.4).
pub struct Dispatcher {
    store: Arc<JobStore>,
    metrics: Arc<MetricsRegistry>,
    sse: Arc<SseRegistry>,
    client: Arc<ChatClient>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<JobStore>,
        metrics: Arc<MetricsRegistry>,
        sse: Arc<SseRegistry>,
        client: Arc<ChatClient>,
    ) -> Self {
        Self {
            store,
            metrics,
            sse,
            client,
        }
    }

    /// Runs the full dispatch cycle for a claimed job. Never panics and
    /// never propagates an error to the caller — every exit path lands the
    /// job in a valid terminal-or-queued state (spec.md §7 propagation
    /// policy).
    pub async fn dispatch(&self, job: job::Model, backend_url: &str) {
        self.store.set_backend(&job.id, backend_url).await.ok();
        self.metrics.adjust_active_jobs(backend_url, 1).await;
        let mut decremented = false;
        let start = Instant::now();

        let request: Value = match job.request.as_deref().map(serde_json::from_str::<Value>) {
            Some(Ok(v)) => v,
            _ => {
                self.decrement_once(backend_url, &mut decremented).await;
                self.finish(&job, None, Some("job has no valid stored request payload".to_string()))
                    .await;
                return;
            }
        };

        let outcome = self.client.chat_completion(backend_url, &request).await;

        let (result, error) = match outcome {
            Ok(response) => {
                // Latency is only meaningful for an actual response (spec.md
                // §4.4 step 5a); a timeout/network error would otherwise
                // pollute the EMA the selector ranks backends on.
                let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
                self.metrics.record_latency(backend_url, elapsed_ms).await;
                if let Some((eval_count, eval_duration_ns)) = response.eval_stats() {
                    if let Some(tps) = tokens_per_second(eval_count, eval_duration_ns) {
                        self.metrics.record_tokens_per_second(backend_url, tps).await;
                    }
                }
                (Some(response.body), None)
            }
            Err(e) => (None, Some(e.to_string())),
        };

        self.decrement_once(backend_url, &mut decremented).await;
        self.finish(&job, result, error).await;
    }

    async fn decrement_once(&self, backend_url: &str, decremented: &mut bool) {
        if !*decremented {
            self.metrics.adjust_active_jobs(backend_url, -1).await;
            *decremented = true;
        }
    }

    /// Writes the terminal state, unless the job was cancelled while the
    /// dispatch was in flight — cancellation always wins (spec.md §5,
    /// "Cancellation").
    async fn finish(&self, job: &job::Model, result: Option<Value>, error: Option<String>) {
        let current = self.store.get(&job.id).await.ok().flatten();
        let already_cancelled = current
            .as_ref()
            .is_some_and(|j| j.status == job::STATUS_CANCELLED);

        let updated = if already_cancelled {
            current
        } else if let Some(result) = result {
            self.store.mark_completed(&job.id, &result).await.ok().flatten()
        } else {
            self.store
                .mark_failed(&job.id, &error.unwrap_or_default(), true)
                .await
                .ok()
                .flatten()
        };

        if let Some(updated) = updated {
            self.notify(&updated).await;
        }
    }

    async fn notify(&self, job: &job::Model) {
        self.sse
            .publish(
                &job.user_id,
                serde_json::json!({
                    "job_id": job.id,
                    "status": job.status,
                    "updated_at": job.updated_at,
                    "error": job.error,
                }),
            )
            .await;
    }

    /// Streaming variant for a user-synchronous caller bypassing the
    /// queue. The returned stream decrements `active_jobs` and records
    /// latency/tokens-per-second exactly once, regardless of whether the
    /// caller reads it to completion or drops it early.
    pub async fn stream_chat_completion(
        &self,
        backend_url: &str,
        request: &Value,
    ) -> Result<impl Stream<Item = Result<Bytes>>> {
        self.metrics.adjust_active_jobs(backend_url, 1).await;
        let byte_stream = self.client.chat_completion_stream(backend_url, request).await?;
        let tracker = ActiveJobTracker::new(self.metrics.clone(), backend_url.to_string());
        let metrics = self.metrics.clone();
        let backend_url = backend_url.to_string();

        Ok(futures::stream::unfold(
            (byte_stream.boxed(), tracker, metrics, backend_url),
            |(mut inner, mut tracker, metrics, backend_url)| async move {
                match inner.next().await {
                    Some(Ok(chunk)) => {
                        if contains_done_true(&chunk) {
                            if let Some((eval_count, eval_duration_ns)) = parse_eval_stats(&chunk) {
                                if let Some(tps) = tokens_per_second(eval_count, eval_duration_ns) {
                                    metrics.record_tokens_per_second(&backend_url, tps).await;
                                }
                            }
                        }
                        Some((Ok(chunk), (inner, tracker, metrics, backend_url)))
                    }
                    Some(Err(e)) => {
                        tracker.finish();
                        Some((
                            Err(QueueError::TransientBackend(e.to_string())),
                            (inner, tracker, metrics, backend_url),
                        ))
                    }
                    None => {
                        tracker.finish();
                        None
                    }
                }
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_per_second_requires_positive_duration() {
        assert_eq!(tokens_per_second(10, 0), None);
        assert_eq!(tokens_per_second(10, 1_000_000_000), Some(10.0));
    }

    #[test]
    fn done_true_detection_ignores_whitespace() {
        assert!(contains_done_true(br#"{"done": true, "eval_count": 5}"#));
        assert!(contains_done_true(br#"{"done":true}"#));
        assert!(!contains_done_true(br#"{"done": false}"#));
    }

    #[test]
    fn parse_eval_stats_reads_terminal_ndjson_line() {
        let chunk = b"{\"message\":{\"content\":\"hi\"},\"done\":false}\n{\"done\":true,\"eval_count\":42,\"eval_duration\":2000000000}\n";
        assert_eq!(parse_eval_stats(chunk), Some((42, 2_000_000_000)));
    }
}

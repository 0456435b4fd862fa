use std::convert::Infallible;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{sse::Event, IntoResponse, Json, Response, Sse},
    routing::{get, post},
    Router,
};
use futures::Stream;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::{error_response, forbidden, not_found};
use crate::auth::{AdminUser, VerifiedUser};
use crate::db::entities::{job, job_archive};
use crate::store::{AdminJobFilters, JobFilters};
use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/chat/completions", post(submit))
        .route("/", get(list_jobs))
        .route("/events", get(events))
        .route("/analytics", get(analytics))
        .route("/analytics/export", get(analytics_export))
        .route("/archive", get(archive_list))
        .route("/archive/config", get(archive_config))
        .route("/archive/run", post(archive_run))
        .route("/admin/list", get(admin_list))
        .route("/:id", get(get_job))
        .route("/:id", axum::routing::delete(cancel_job))
        .route("/:id/retry", post(retry_job))
}

fn job_to_json(job: &job::Model, include_result: bool) -> Value {
    let mut value = json!({
        "id": job.id,
        "user_id": job.user_id,
        "status": job.status,
        "priority": job.priority,
        "priority_score": job.priority_score,
        "model_id": job.model_id,
        "backend_url": job.backend_url,
        "error": job.error,
        "attempt_count": job.attempt_count,
        "max_attempts": job.max_attempts,
        "created_at": job.created_at,
        "updated_at": job.updated_at,
    });
    if include_result {
        value["result"] = job
            .result
            .as_deref()
            .and_then(|r| serde_json::from_str::<Value>(r).ok())
            .unwrap_or(Value::Null);
    }
    value
}

fn archive_to_json(row: &job_archive::Model) -> Value {
    json!({
        "id": row.id,
        "user_id": row.user_id,
        "status": row.status,
        "priority": row.priority,
        "model_id": row.model_id,
        "backend_url": row.backend_url,
        "error": row.error,
        "created_at": row.created_at,
        "updated_at": row.updated_at,
        "archived_at": row.archived_at,
    })
}

#[derive(Deserialize)]
pub struct ChatCompletionSubmission {
    pub model: String,
    pub messages: Vec<Value>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<i64>,
    #[serde(default)]
    pub priority: Option<i32>,
}

async fn submit(
    State(state): State<AppState>,
    user: VerifiedUser,
    Json(payload): Json<ChatCompletionSubmission>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    // `MODEL_BACKEND_MAP` is the only model catalog this crate owns; an
    // empty map means the real catalog collaborator isn't wired in, so
    // nothing is rejected on that basis (spec.md §1, out-of-scope model
    // access control).
    if !state.config.model_backend_map.is_empty() && !state.models.is_known(&payload.model) {
        return Err(not_found("model"));
    }

    let request_body = json!({
        "model": payload.model,
        "messages": payload.messages,
        "temperature": payload.temperature,
        "top_p": payload.top_p,
        "max_tokens": payload.max_tokens,
        "stream": false,
    });
    let priority = payload.priority.unwrap_or(5);

    let job = state
        .store
        .insert(&user.user_id, Some(&payload.model), &request_body, priority, 3)
        .await
        .map_err(error_response)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "job_id": job.id,
            "status": job.status,
            "model_id": job.model_id,
            "created_at": job.created_at,
        })),
    ))
}

#[derive(Deserialize)]
pub struct GetJobQuery {
    pub include_result: Option<bool>,
}

async fn get_job(
    State(state): State<AppState>,
    user: VerifiedUser,
    Path(id): Path<String>,
    Query(q): Query<GetJobQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let job = state.store.get(&id).await.map_err(error_response)?.ok_or_else(|| not_found("job"))?;
    if job.user_id != user.user_id {
        return Err(forbidden("job"));
    }
    Ok(Json(job_to_json(&job, q.include_result.unwrap_or(true))))
}

async fn cancel_job(
    State(state): State<AppState>,
    user: VerifiedUser,
    Path(id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let job = state.store.get(&id).await.map_err(error_response)?.ok_or_else(|| not_found("job"))?;
    if job.user_id != user.user_id {
        return Err(forbidden("job"));
    }
    let updated = state
        .store
        .mark_cancelled(&id)
        .await
        .map_err(error_response)?
        .unwrap_or(job);
    Ok(Json(job_to_json(&updated, true)))
}

#[derive(Deserialize)]
pub struct ListQuery {
    pub skip: Option<u64>,
    pub limit: Option<u64>,
    pub status: Option<String>,
    pub model_id: Option<String>,
}

async fn list_jobs(
    State(state): State<AppState>,
    user: VerifiedUser,
    Query(q): Query<ListQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let skip = q.skip.unwrap_or(0);
    let limit = q.limit.unwrap_or(50).clamp(1, 200);
    let filters = JobFilters {
        status: q.status,
        model_id: q.model_id,
    };
    let (jobs, total) = state
        .store
        .list_by_user(&user.user_id, &filters, skip, limit)
        .await
        .map_err(error_response)?;
    Ok(Json(json!({
        "jobs": jobs.iter().map(|j| job_to_json(j, false)).collect::<Vec<_>>(),
        "total": total,
        "skip": skip,
        "limit": limit,
    })))
}

async fn events(
    State(state): State<AppState>,
    user: VerifiedUser,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.sse.subscribe(&user.user_id).await;
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|value| {
            let event = Event::default()
                .json_data(value)
                .expect("job event always serializes");
            (Ok(event), rx)
        })
    });
    Sse::new(stream).keep_alive(
        axum::response::sse::KeepAlive::new()
            .interval(std::time::Duration::from_secs(30))
            .text("keepalive"),
    )
}

#[derive(Deserialize)]
pub struct AnalyticsQuery {
    pub combined: Option<bool>,
}

async fn analytics(
    State(state): State<AppState>,
    _admin: AdminUser,
    Query(q): Query<AnalyticsQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let data = if q.combined.unwrap_or(false) {
        state.store.combined_analytics().await
    } else {
        state.store.job_analytics().await
    }
    .map_err(error_response)?;
    Ok(Json(serde_json::to_value(data).unwrap_or(Value::Null)))
}

async fn analytics_export(
    State(state): State<AppState>,
    _admin: AdminUser,
) -> Result<Response, (StatusCode, Json<Value>)> {
    let data = state.store.combined_analytics().await.map_err(error_response)?;

    let mut csv = String::from("date,total,completed,failed\n");
    for row in &data.daily_history {
        csv.push_str(&format!("{},{},{},{}\n", row.date, row.total, row.completed, row.failed));
    }
    csv.push_str("\nmodel_id,total,completed,failed\n");
    for row in &data.by_model {
        csv.push_str(&format!(
            "{},{},{},{}\n",
            row.model_id, row.total, row.completed, row.failed
        ));
    }

    Ok(([(header::CONTENT_TYPE, "text/csv")], csv).into_response())
}

#[derive(Deserialize)]
pub struct AdminListQuery {
    pub skip: Option<u64>,
    pub limit: Option<u64>,
    pub status: Option<String>,
    pub model_id: Option<String>,
    pub user_id: Option<String>,
}

async fn archive_list(
    State(state): State<AppState>,
    _admin: AdminUser,
    Query(q): Query<AdminListQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let skip = q.skip.unwrap_or(0);
    let limit = q.limit.unwrap_or(50).clamp(1, 200);
    let filters = AdminJobFilters {
        status: q.status,
        model_id: q.model_id,
        user_id: q.user_id,
    };
    let (rows, total) = state
        .store
        .list_archived(&filters, skip, limit)
        .await
        .map_err(error_response)?;
    Ok(Json(json!({
        "jobs": rows.iter().map(archive_to_json).collect::<Vec<_>>(),
        "total": total,
        "skip": skip,
        "limit": limit,
    })))
}

async fn archive_config(State(state): State<AppState>, _admin: AdminUser) -> Json<Value> {
    Json(json!({
        "job_retention_days": state.config.job_retention_days,
        "job_archive_retention_days": state.config.job_archive_retention_days,
    }))
}

async fn archive_run(State(state): State<AppState>, _admin: AdminUser) -> Json<Value> {
    let archived = state.store.archive_old(state.config.job_retention_days).await;
    let purged = if state.config.job_archive_retention_days > 0 {
        state
            .store
            .purge_archive(state.config.job_archive_retention_days)
            .await
    } else {
        0
    };
    Json(json!({ "archived": archived, "purged": purged }))
}

async fn admin_list(
    State(state): State<AppState>,
    _admin: AdminUser,
    Query(q): Query<AdminListQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let skip = q.skip.unwrap_or(0);
    let limit = q.limit.unwrap_or(50).clamp(1, 200);
    let filters = AdminJobFilters {
        status: q.status,
        model_id: q.model_id,
        user_id: q.user_id,
    };
    let (jobs, total) = state.store.list_admin(&filters, skip, limit).await.map_err(error_response)?;
    Ok(Json(json!({
        "jobs": jobs.iter().map(|j| job_to_json(j, false)).collect::<Vec<_>>(),
        "total": total,
        "skip": skip,
        "limit": limit,
    })))
}

async fn retry_job(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let job = state.store.admin_retry(&id).await.map_err(error_response)?;
    Ok(Json(job_to_json(&job, true)))
}

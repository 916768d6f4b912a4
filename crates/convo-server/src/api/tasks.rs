//! `/tasks`: the e-mail queue worker and the daily digest. Only the task
//! queue and the scheduler may call these.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use convo_shared::constants::EMAIL_QUEUE_NAME;
use serde_json::{json, Value};

use super::extract::{require_header, Ctx};
use crate::clients::EmailJob;
use crate::error::ServerError;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/tasks/emails", post(emails))
        .route("/tasks/digest", get(digest))
}

async fn emails(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    headers: HeaderMap,
    Json(job): Json<EmailJob>,
) -> Result<Json<Value>, ServerError> {
    require_header(&headers, "X-Appengine-QueueName", EMAIL_QUEUE_NAME)?;
    state.handle_email_job(&ctx, &job).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn digest(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    headers: HeaderMap,
) -> Result<Json<Value>, ServerError> {
    require_header(&headers, "X-Appengine-Cron", "true")?;
    let report = state.run_digest(&ctx, Utc::now()).await?;
    Ok(Json(json!({ "users": report.users, "sent": report.sent })))
}

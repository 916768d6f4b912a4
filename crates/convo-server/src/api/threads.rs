//! `/threads`, and the message, participant and read routes shared with
//! events.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use convo_shared::{Key, Kind};
use convo_store::{Entity, Thread};
use serde_json::{json, Value};

use super::extract::{AuthUser, Ctx, Payload};
use super::views::{many, MessageView, ThreadView};
use crate::error::ServerError;
use crate::services::membership::Aggregate;
use crate::services::messages::NewMessage;
use crate::services::threads::{NewThread, ThreadUpdate};
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/threads", post(create).get(list))
        .route("/threads/{id}", get(show).patch(update).delete(remove))
        .route(
            "/threads/{id}/messages",
            get(list_messages::<Thread>).post(post_message::<Thread>),
        )
        .route(
            "/threads/{id}/messages/{mid}",
            delete(delete_message::<Thread>),
        )
        .route("/threads/{id}/users/{uid}", post(add_user).delete(remove_user))
        .route("/threads/{id}/reads", post(mark_read))
}

pub(super) fn key_of<A: Entity>(id: &str) -> Result<Key, ServerError> {
    Ok(Key::decode_kind(id, A::KIND)?)
}

async fn create(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    AuthUser(actor): AuthUser,
    Payload { data, file }: Payload<NewThread>,
) -> Result<(StatusCode, Json<ThreadView>), ServerError> {
    let thread = state.create_thread(&ctx, &actor, &data, file.as_deref()).await?;
    Ok((StatusCode::CREATED, Json(ThreadView::from(&thread))))
}

async fn list(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    AuthUser(actor): AuthUser,
) -> Result<Json<Vec<ThreadView>>, ServerError> {
    let threads = state.list_threads(&ctx, &actor).await?;
    Ok(Json(many(&threads)))
}

async fn show(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    AuthUser(actor): AuthUser,
    Path(id): Path<String>,
) -> Result<Json<ThreadView>, ServerError> {
    let thread = state.get_thread(&ctx, &actor, key_of::<Thread>(&id)?).await?;
    Ok(Json(ThreadView::from(&thread)))
}

async fn update(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    AuthUser(actor): AuthUser,
    Path(id): Path<String>,
    Payload { data, .. }: Payload<ThreadUpdate>,
) -> Result<Json<ThreadView>, ServerError> {
    let thread = state
        .update_thread(&ctx, &actor, key_of::<Thread>(&id)?, &data)
        .await?;
    Ok(Json(ThreadView::from(&thread)))
}

async fn remove(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    AuthUser(actor): AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Value>, ServerError> {
    state.delete_thread(&ctx, &actor, key_of::<Thread>(&id)?).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn add_user(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    AuthUser(actor): AuthUser,
    Path((id, uid)): Path<(String, String)>,
) -> Result<Json<ThreadView>, ServerError> {
    let thread = state
        .add_thread_user(&ctx, &actor, key_of::<Thread>(&id)?, &uid)
        .await?;
    Ok(Json(ThreadView::from(&thread)))
}

async fn remove_user(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    AuthUser(actor): AuthUser,
    Path((id, uid)): Path<(String, String)>,
) -> Result<Json<ThreadView>, ServerError> {
    let target = Key::decode_kind(&uid, Kind::User)?;
    let thread = state
        .remove_thread_user(&ctx, &actor, key_of::<Thread>(&id)?, target)
        .await?;
    Ok(Json(ThreadView::from(&thread)))
}

async fn mark_read(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    AuthUser(actor): AuthUser,
    Path(id): Path<String>,
) -> Result<Json<ThreadView>, ServerError> {
    let thread: Thread = state.mark_read(&ctx, &actor, key_of::<Thread>(&id)?).await?;
    Ok(Json(ThreadView::from(&thread)))
}

pub(super) async fn list_messages<A: Aggregate>(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    AuthUser(actor): AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Vec<MessageView>>, ServerError> {
    let messages = state.list_messages::<A>(&ctx, &actor, key_of::<A>(&id)?).await?;
    Ok(Json(many(&messages)))
}

pub(super) async fn post_message<A: Aggregate>(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    AuthUser(actor): AuthUser,
    Path(id): Path<String>,
    Payload { data, file }: Payload<NewMessage>,
) -> Result<(StatusCode, Json<MessageView>), ServerError> {
    let (message, _) = state
        .post_message::<A>(&ctx, &actor, key_of::<A>(&id)?, &data.body, file.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(MessageView::from(&message))))
}

pub(super) async fn delete_message<A: Aggregate>(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    AuthUser(actor): AuthUser,
    Path((id, mid)): Path<(String, String)>,
) -> Result<Json<Value>, ServerError> {
    let message = Key::decode_kind(&mid, Kind::Message)?;
    state
        .delete_message::<A>(&ctx, &actor, key_of::<A>(&id)?, message)
        .await?;
    Ok(Json(json!({ "ok": true })))
}

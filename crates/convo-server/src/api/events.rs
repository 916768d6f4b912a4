//! `/events`.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use convo_shared::{Key, Kind};
use convo_store::Event;
use serde::Serialize;
use serde_json::{json, Value};

use super::extract::{AuthUser, Ctx, Payload};
use super::threads::{delete_message, key_of, list_messages, post_message};
use super::views::{many, EventView, LinkView, SelfView};
use crate::error::ServerError;
use crate::services::events::{Cancellation, EventUpdate, LinkParts, MagicRsvp, NewEvent};
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/events", post(create).get(list))
        .route("/events/rsvps", post(magic_rsvp))
        .route("/events/{id}", get(show).patch(update).delete(remove))
        .route(
            "/events/{id}/messages",
            get(list_messages::<Event>).post(post_message::<Event>),
        )
        .route(
            "/events/{id}/messages/{mid}",
            delete(delete_message::<Event>),
        )
        .route("/events/{id}/users/{uid}", post(add_user).delete(remove_user))
        .route("/events/{id}/rsvps", post(rsvp).delete(remove_rsvp))
        .route(
            "/events/{id}/magic",
            get(invite_link).post(join).delete(roll_invite),
        )
        .route("/events/{id}/reads", post(mark_read))
}

#[derive(Serialize)]
struct RsvpResponse {
    user: SelfView,
    event: EventView,
}

async fn create(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    AuthUser(actor): AuthUser,
    Payload { data, .. }: Payload<NewEvent>,
) -> Result<(StatusCode, Json<EventView>), ServerError> {
    let event = state.create_event(&ctx, &actor, &data).await?;
    Ok((StatusCode::CREATED, Json(EventView::from(&event))))
}

async fn list(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    AuthUser(actor): AuthUser,
) -> Result<Json<Vec<EventView>>, ServerError> {
    let events = state.list_events(&ctx, &actor).await?;
    Ok(Json(many(&events)))
}

async fn show(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    AuthUser(actor): AuthUser,
    Path(id): Path<String>,
) -> Result<Json<EventView>, ServerError> {
    let event = state.get_event(&ctx, &actor, key_of::<Event>(&id)?).await?;
    Ok(Json(EventView::from(&event)))
}

async fn update(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    AuthUser(actor): AuthUser,
    Path(id): Path<String>,
    Payload { data, .. }: Payload<EventUpdate>,
) -> Result<Json<EventView>, ServerError> {
    let event = state
        .update_event(&ctx, &actor, key_of::<Event>(&id)?, &data)
        .await?;
    Ok(Json(EventView::from(&event)))
}

async fn remove(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    AuthUser(actor): AuthUser,
    Path(id): Path<String>,
    Payload { data, .. }: Payload<Cancellation>,
) -> Result<Json<Value>, ServerError> {
    state
        .delete_event(&ctx, &actor, key_of::<Event>(&id)?, &data)
        .await?;
    Ok(Json(json!({ "ok": true })))
}

async fn add_user(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    AuthUser(actor): AuthUser,
    Path((id, uid)): Path<(String, String)>,
) -> Result<Json<EventView>, ServerError> {
    let event = state
        .add_event_user(&ctx, &actor, key_of::<Event>(&id)?, &uid)
        .await?;
    Ok(Json(EventView::from(&event)))
}

async fn remove_user(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    AuthUser(actor): AuthUser,
    Path((id, uid)): Path<(String, String)>,
) -> Result<Json<EventView>, ServerError> {
    let target = Key::decode_kind(&uid, Kind::User)?;
    let event = state
        .remove_event_user(&ctx, &actor, key_of::<Event>(&id)?, target)
        .await?;
    Ok(Json(EventView::from(&event)))
}

async fn rsvp(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    AuthUser(actor): AuthUser,
    Path(id): Path<String>,
) -> Result<Json<EventView>, ServerError> {
    let event = state.rsvp(&ctx, &actor, key_of::<Event>(&id)?).await?;
    Ok(Json(EventView::from(&event)))
}

async fn remove_rsvp(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    AuthUser(actor): AuthUser,
    Path(id): Path<String>,
) -> Result<Json<EventView>, ServerError> {
    let event = state.remove_rsvp(&ctx, &actor, key_of::<Event>(&id)?).await?;
    Ok(Json(EventView::from(&event)))
}

async fn magic_rsvp(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Payload { data, .. }: Payload<MagicRsvp>,
) -> Result<Json<RsvpResponse>, ServerError> {
    let (user, event) = state.magic_rsvp(&ctx, &data).await?;
    Ok(Json(RsvpResponse {
        user: SelfView::from(&user),
        event: EventView::from(&event),
    }))
}

async fn invite_link(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    AuthUser(actor): AuthUser,
    Path(id): Path<String>,
) -> Result<Json<LinkView>, ServerError> {
    let link = state.invite_link(&ctx, &actor, key_of::<Event>(&id)?).await?;
    Ok(Json(LinkView::new(&link, &state.config.app_host)))
}

async fn roll_invite(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    AuthUser(actor): AuthUser,
    Path(id): Path<String>,
) -> Result<Json<LinkView>, ServerError> {
    let link = state.roll_invite(&ctx, &actor, key_of::<Event>(&id)?).await?;
    Ok(Json(LinkView::new(&link, &state.config.app_host)))
}

async fn join(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    AuthUser(actor): AuthUser,
    Path(id): Path<String>,
    Payload { data, .. }: Payload<LinkParts>,
) -> Result<Json<EventView>, ServerError> {
    let event = state
        .join_by_invite(&ctx, &actor, key_of::<Event>(&id)?, &data)
        .await?;
    Ok(Json(EventView::from(&event)))
}

async fn mark_read(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    AuthUser(actor): AuthUser,
    Path(id): Path<String>,
) -> Result<Json<EventView>, ServerError> {
    let event: Event = state.mark_read(&ctx, &actor, key_of::<Event>(&id)?).await?;
    Ok(Json(EventView::from(&event)))
}

//! `/users` and `/contacts`.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use super::extract::{AuthUser, Ctx, MaybeUser, Payload};
use super::views::{many, SelfView, SubscriptionView, UserView};
use crate::error::ServerError;
use crate::services::account::{
    Credentials, EmailVerification, OAuthLogin, PasswordReset, ProfileUpdate, Registration,
    SignedUserLink, Unsubscribe,
};
use crate::services::identity::UserRef;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/users", post(register).get(me).patch(update_profile))
        .route("/users/auth", post(login))
        .route("/users/oauth", post(oauth))
        .route("/users/password", post(password))
        .route("/users/verify", post(verify))
        .route("/users/forgot", post(forgot))
        .route("/users/magic", post(magic))
        .route("/users/unsubscribe", post(unsubscribe))
        .route("/users/resend", post(resend))
        .route("/users/search", get(search))
        .route("/users/avatar", post(avatar))
        .route(
            "/users/emails",
            post(add_email).delete(remove_email).patch(set_primary),
        )
        .route("/users/{id}", get(show))
        .route("/contacts", get(contacts).post(add_contacts))
        .route("/contacts/{id}", post(add_contact).delete(remove_contact))
}

#[derive(Deserialize)]
struct EmailInput {
    email: String,
}

/// Either a reset (signed link fields) or a change (current password).
#[derive(Deserialize)]
struct PasswordInput {
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    signature: Option<String>,
    #[serde(default)]
    old_password: Option<String>,
    password: String,
}

/// Either a request for a link (`email`) or a followed link.
#[derive(Deserialize)]
struct MagicInput {
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    signature: Option<String>,
}

#[derive(Deserialize)]
struct SearchParams {
    #[serde(default)]
    query: String,
}

#[derive(Deserialize)]
struct ContactsInput {
    #[serde(default)]
    users: Vec<UserRef>,
}

fn done() -> Json<Value> {
    Json(json!({ "ok": true }))
}

async fn register(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Payload { data, .. }: Payload<Registration>,
) -> Result<(StatusCode, Json<SelfView>), ServerError> {
    let user = state.register(&ctx, &data).await?;
    Ok((StatusCode::CREATED, Json(SelfView::from(&user))))
}

async fn login(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Payload { data, .. }: Payload<Credentials>,
) -> Result<Json<SelfView>, ServerError> {
    let user = state.login(&ctx, &data).await?;
    Ok(Json(SelfView::from(&user)))
}

async fn oauth(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    MaybeUser(caller): MaybeUser,
    Payload { data, .. }: Payload<OAuthLogin>,
) -> Result<Json<SelfView>, ServerError> {
    let user = state.oauth_login(&ctx, &data, caller.as_ref()).await?;
    Ok(Json(SelfView::from(&user)))
}

async fn password(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    MaybeUser(caller): MaybeUser,
    Payload { data, .. }: Payload<PasswordInput>,
) -> Result<Json<SelfView>, ServerError> {
    let user = match (data.user, data.timestamp, data.signature) {
        (Some(user), Some(timestamp), Some(signature)) => {
            let reset = PasswordReset {
                user,
                timestamp,
                signature,
                password: data.password,
            };
            state.reset_password(&ctx, &reset).await?
        }
        _ => {
            let actor = caller.ok_or_else(ServerError::unauthorized)?;
            state
                .change_password(&ctx, &actor, data.old_password.as_deref(), &data.password)
                .await?
        }
    };
    Ok(Json(SelfView::from(&user)))
}

async fn verify(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Payload { data, .. }: Payload<EmailVerification>,
) -> Result<Json<SelfView>, ServerError> {
    let user = state.verify_email(&ctx, &data).await?;
    Ok(Json(SelfView::from(&user)))
}

async fn forgot(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Payload { data, .. }: Payload<EmailInput>,
) -> Result<Json<Value>, ServerError> {
    state.forgot_password(&ctx, &data.email).await?;
    Ok(done())
}

async fn magic(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Payload { data, .. }: Payload<MagicInput>,
) -> Result<Json<Value>, ServerError> {
    match (data.email, data.user, data.timestamp, data.signature) {
        (_, Some(user), Some(timestamp), Some(signature)) => {
            let link = SignedUserLink {
                user,
                timestamp,
                signature,
            };
            let user = state.consume_magic_login(&ctx, &link).await?;
            Ok(Json(json!(SelfView::from(&user))))
        }
        (Some(email), ..) => {
            state.send_magic_login(&ctx, &email).await?;
            Ok(done())
        }
        _ => Err(ServerError::invalid("email", "Enter your e-mail address")),
    }
}

async fn unsubscribe(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    Payload { data, .. }: Payload<Unsubscribe>,
) -> Result<Json<SubscriptionView>, ServerError> {
    let user = state.unsubscribe(&ctx, &data).await?;
    Ok(Json(SubscriptionView::from(&user)))
}

async fn me(AuthUser(user): AuthUser) -> Json<SelfView> {
    Json(SelfView::from(&user))
}

async fn update_profile(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    AuthUser(actor): AuthUser,
    Payload { data, .. }: Payload<ProfileUpdate>,
) -> Result<Json<SelfView>, ServerError> {
    let user = state.update_profile(&ctx, &actor, &data).await?;
    Ok(Json(SelfView::from(&user)))
}

async fn resend(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    AuthUser(actor): AuthUser,
) -> Result<Json<Value>, ServerError> {
    state.resend_verification(&ctx, &actor).await?;
    Ok(done())
}

async fn search(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    AuthUser(_): AuthUser,
    Query(params): Query<SearchParams>,
) -> Result<Json<Vec<UserView>>, ServerError> {
    let users = state.search_users(&ctx, &params.query).await?;
    Ok(Json(many(&users)))
}

async fn avatar(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    AuthUser(actor): AuthUser,
    Payload { file, .. }: Payload<Value>,
) -> Result<Json<SelfView>, ServerError> {
    let data = file
        .filter(|f| !f.is_empty())
        .ok_or_else(|| ServerError::invalid("file", "Choose a picture to upload"))?;
    let user = state.upload_avatar(&ctx, &actor, &data).await?;
    Ok(Json(SelfView::from(&user)))
}

async fn add_email(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    AuthUser(actor): AuthUser,
    Payload { data, .. }: Payload<EmailInput>,
) -> Result<Json<Value>, ServerError> {
    state.add_email(&ctx, &actor, &data.email).await?;
    Ok(done())
}

async fn remove_email(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    AuthUser(actor): AuthUser,
    Payload { data, .. }: Payload<EmailInput>,
) -> Result<Json<SelfView>, ServerError> {
    let user = state.remove_email(&ctx, &actor, &data.email).await?;
    Ok(Json(SelfView::from(&user)))
}

async fn set_primary(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    AuthUser(actor): AuthUser,
    Payload { data, .. }: Payload<EmailInput>,
) -> Result<Json<SelfView>, ServerError> {
    let user = state.set_primary_email(&ctx, &actor, &data.email).await?;
    Ok(Json(SelfView::from(&user)))
}

async fn show(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    AuthUser(_): AuthUser,
    Path(id): Path<String>,
) -> Result<Json<UserView>, ServerError> {
    let user = state.user_by_id(&ctx, &id).await?;
    Ok(Json(UserView::from(&user)))
}

async fn contacts(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    AuthUser(actor): AuthUser,
) -> Result<Json<Vec<UserView>>, ServerError> {
    let users = state.list_contacts(&ctx, &actor).await?;
    Ok(Json(many(&users)))
}

async fn add_contacts(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    AuthUser(actor): AuthUser,
    Payload { data, .. }: Payload<ContactsInput>,
) -> Result<Json<Vec<UserView>>, ServerError> {
    let users = state.add_contacts(&ctx, &actor, &data.users).await?;
    Ok(Json(many(&users)))
}

async fn add_contact(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    AuthUser(actor): AuthUser,
    Path(id): Path<String>,
) -> Result<Json<SelfView>, ServerError> {
    let user = state.add_contact(&ctx, &actor, &id).await?;
    Ok(Json(SelfView::from(&user)))
}

async fn remove_contact(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    AuthUser(actor): AuthUser,
    Path(id): Path<String>,
) -> Result<Json<SelfView>, ServerError> {
    let user = state.remove_contact(&ctx, &actor, &id).await?;
    Ok(Json(SelfView::from(&user)))
}

//! Request plumbing: the per-request context, bearer authentication, the
//! JSON-or-multipart payload, and the task-queue header checks.

use axum::body::Bytes;
use axum::extract::{FromRequest, FromRequestParts, Multipart, Request, State};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::request::Parts;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use convo_store::{Context, User};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use subtle::ConstantTimeEq;

use crate::error::ServerError;
use crate::state::AppState;

/// Cancels the request context and discards an uncommitted transaction when
/// the request ends, including when the client goes away mid-request.
struct RequestGuard(Context);

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.0.rollback_pending();
        self.0.cancel();
    }
}

/// Give every request a [`Context`] with the configured deadline.
pub async fn request_context(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let ctx = Context::with_timeout(state.config.request_timeout);
    req.extensions_mut().insert(ctx.clone());
    let _guard = RequestGuard(ctx);
    next.run(req).await
}

/// The request's [`Context`].
pub struct Ctx(pub Context);

impl<S: Send + Sync> FromRequestParts<S> for Ctx {
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Ctx(parts.extensions.get::<Context>().cloned().unwrap_or_default()))
    }
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))?
        .trim();
    (!token.is_empty()).then_some(token)
}

/// The signed-in user. Missing or unknown tokens are 401.
pub struct AuthUser(pub User);

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let Ctx(ctx) = Ctx::from_request_parts(parts, state).await?;
        let token = bearer(&parts.headers).ok_or_else(ServerError::unauthorized)?;
        Ok(AuthUser(state.authenticate(&ctx, token).await?))
    }
}

/// The signed-in user when a token is sent. A token that is sent but not
/// recognized is still a 401.
pub struct MaybeUser(pub Option<User>);

impl FromRequestParts<AppState> for MaybeUser {
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        if bearer(&parts.headers).is_none() {
            return Ok(MaybeUser(None));
        }
        let AuthUser(user) = AuthUser::from_request_parts(parts, state).await?;
        Ok(MaybeUser(Some(user)))
    }
}

/// A request body given as JSON, as a multipart form, or as a raw image.
/// Form fields become the fields of `T`; the `photo` or `file` part, or the
/// raw image body, becomes `file`.
pub struct Payload<T> {
    pub data: T,
    pub file: Option<Vec<u8>>,
}

const FILE_FIELDS: &[&str] = &["photo", "file"];

/// Form values are strings; lists, objects and booleans are sent as JSON
/// text and decoded here.
fn form_value(text: String) -> Value {
    let trimmed = text.trim();
    let looks_structured =
        trimmed.starts_with('[') || trimmed.starts_with('{') || trimmed == "true" || trimmed == "false";
    if looks_structured {
        if let Ok(value) = serde_json::from_str(trimmed) {
            return value;
        }
    }
    Value::String(text)
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, ServerError> {
    serde_json::from_value(value).map_err(|e| ServerError::bad_request(format!("Invalid request: {e}")))
}

impl<S, T> FromRequest<S> for Payload<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = ServerError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let content_type = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();

        if content_type.starts_with("multipart/form-data") {
            let mut multipart = Multipart::from_request(req, state)
                .await
                .map_err(|e| ServerError::bad_request(format!("Invalid form: {e}")))?;
            let mut fields = Map::new();
            let mut file = None;
            while let Some(field) = multipart
                .next_field()
                .await
                .map_err(|e| ServerError::bad_request(format!("Invalid form: {e}")))?
            {
                let name = field.name().unwrap_or_default().to_string();
                if FILE_FIELDS.contains(&name.as_str()) {
                    let data = field
                        .bytes()
                        .await
                        .map_err(|e| ServerError::bad_request(format!("Failed to read {name}: {e}")))?;
                    file = Some(data.to_vec());
                } else if !name.is_empty() {
                    let text = field
                        .text()
                        .await
                        .map_err(|e| ServerError::bad_request(format!("Failed to read {name}: {e}")))?;
                    fields.insert(name, form_value(text));
                }
            }
            return Ok(Payload {
                data: decode(Value::Object(fields))?,
                file,
            });
        }

        let is_json = content_type.starts_with("application/json");
        let is_raw = content_type.starts_with("image/") || content_type.starts_with("application/octet-stream");
        if !(is_json || is_raw || content_type.is_empty()) {
            return Err(ServerError::UnsupportedMediaType(
                "Send JSON or a multipart form".into(),
            ));
        }

        let body = Bytes::from_request(req, state)
            .await
            .map_err(|e| ServerError::bad_request(format!("Failed to read body: {e}")))?;
        if is_raw {
            return Ok(Payload {
                data: decode(Value::Object(Map::new()))?,
                file: Some(body.to_vec()),
            });
        }
        if body.is_empty() {
            return Ok(Payload {
                data: decode(Value::Object(Map::new()))?,
                file: None,
            });
        }
        if !is_json {
            return Err(ServerError::UnsupportedMediaType(
                "Send JSON or a multipart form".into(),
            ));
        }
        let value: Value = serde_json::from_slice(&body)
            .map_err(|e| ServerError::bad_request(format!("Invalid JSON: {e}")))?;
        Ok(Payload {
            data: decode(value)?,
            file: None,
        })
    }
}

/// Require `name: expected` among the headers. Only the task queue and the
/// scheduler set these; the front end strips them from outside traffic.
pub fn require_header(headers: &HeaderMap, name: &str, expected: &str) -> Result<(), ServerError> {
    let value = headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let value = value.as_bytes();
    let expected = expected.as_bytes();
    if value.len() != expected.len() || value.ct_eq(expected).unwrap_u8() != 1 {
        tracing::info!(header = name, "task request without the expected header");
        return Err(ServerError::unauthorized());
    }
    Ok(())
}

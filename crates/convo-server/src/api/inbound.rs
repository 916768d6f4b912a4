//! `/inbound`: the mail provider's webhook for replies.

use axum::extract::{Multipart, State};
use axum::routing::post;
use axum::Router;

use super::extract::Ctx;
use crate::error::ServerError;
use crate::services::inbound::{Envelope, InboundEmail};
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/inbound", post(inbound))
}

/// The provider posts a multipart form; `envelope` is a JSON string.
/// Errors here are the sender's fault and are answered with a drop.
async fn read_form(mut form: Multipart) -> Result<InboundEmail, ServerError> {
    let mut email = InboundEmail::default();
    while let Some(field) = form
        .next_field()
        .await
        .map_err(|e| ServerError::bad_request(format!("Invalid form: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let value = field
            .text()
            .await
            .map_err(|e| ServerError::bad_request(format!("Failed to read {name}: {e}")))?;
        match name.as_str() {
            "envelope" => {
                email.envelope = serde_json::from_str::<Envelope>(&value)
                    .map_err(|e| ServerError::bad_request(format!("Invalid envelope: {e}")))?;
            }
            "from" => email.from = value,
            "subject" => email.subject = value,
            "text" => email.text = value,
            "html" => email.html = value,
            _ => {}
        }
    }
    Ok(email)
}

async fn inbound(
    State(state): State<AppState>,
    Ctx(ctx): Ctx,
    form: Multipart,
) -> Result<String, ServerError> {
    let email = match read_form(form).await {
        Ok(email) => email,
        Err(e) => {
            tracing::warn!(error = %e, "inbound mail with unreadable form");
            return Ok("DROP: invalid envelope".to_string());
        }
    };
    let outcome = state.ingest_email(&ctx, &email).await?;
    tracing::info!(outcome = %outcome.describe(), to = ?email.envelope.to, "inbound mail");
    Ok(outcome.describe())
}

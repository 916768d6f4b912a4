//! Server errors and their HTTP mapping.
//!
//! Errors climb through [`OpExt::op`], which wraps them in a labelled
//! [`ServerError::Op`] so the log line carries the whole operation trail
//! (`threads.create: identity.get_or_create(email=..): ...`). The response
//! uses only the innermost error's status and user message.

use std::collections::BTreeMap;
use std::fmt::Display;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use convo_shared::{KeyError, MagicError};
use convo_store::{MembershipError, StoreError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("{message}")]
    Validation {
        message: String,
        fields: BTreeMap<String, String>,
    },

    #[error("{0}")]
    Unauthorized(String),

    /// Missing resources and permission failures alike.
    #[error("{0}")]
    NotFound(String),

    /// Duplicate or over-limit.
    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    UnsupportedMediaType(String),

    #[error("External service error: {0}")]
    External(String),

    #[error("Integrity violation: {0}")]
    Integrity(String),

    #[error(transparent)]
    Store(StoreError),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{op}: {source}")]
    Op {
        op: String,
        #[source]
        source: Box<ServerError>,
    },
}

impl ServerError {
    /// Validation failure on one field.
    pub fn invalid(field: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        let mut fields = BTreeMap::new();
        fields.insert(field.to_string(), message.clone());
        ServerError::Validation { message, fields }
    }

    /// Validation failure not tied to a field.
    pub fn bad_request(message: impl Into<String>) -> Self {
        ServerError::Validation {
            message: message.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn not_found() -> Self {
        ServerError::NotFound("Not found".to_string())
    }

    pub fn unauthorized() -> Self {
        ServerError::Unauthorized("You need to sign in".to_string())
    }

    pub fn external(service: &str, error: impl Display) -> Self {
        ServerError::External(format!("{service}: {error}"))
    }

    /// The error at the bottom of the operation trail.
    pub fn innermost(&self) -> &ServerError {
        let mut current = self;
        while let ServerError::Op { source, .. } = current {
            current = source;
        }
        current
    }

    /// Operation labels, outermost first.
    pub fn trail(&self) -> Vec<&str> {
        let mut ops = Vec::new();
        let mut current = self;
        while let ServerError::Op { op, source } = current {
            ops.push(op.as_str());
            current = source;
        }
        ops
    }

    pub fn status(&self) -> StatusCode {
        match self.innermost() {
            ServerError::Validation { .. } | ServerError::Conflict(_) => StatusCode::BAD_REQUEST,
            ServerError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ServerError::NotFound(_) => StatusCode::NOT_FOUND,
            ServerError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ServerError::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            ServerError::External(_)
            | ServerError::Integrity(_)
            | ServerError::Store(_)
            | ServerError::Internal(_)
            | ServerError::Op { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == StatusCode::NOT_FOUND
    }

    fn user_message(&self) -> String {
        match self.innermost() {
            ServerError::Validation { message, .. }
            | ServerError::Unauthorized(message)
            | ServerError::NotFound(message)
            | ServerError::Conflict(message)
            | ServerError::UnsupportedMediaType(message) => message.clone(),
            ServerError::Store(StoreError::NotFound(_)) => "Not found".to_string(),
            _ => "Something went wrong. Please try again.".to_string(),
        }
    }
}

impl From<StoreError> for ServerError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Integrity(msg) => ServerError::Integrity(msg),
            other => ServerError::Store(other),
        }
    }
}

impl From<MembershipError> for ServerError {
    fn from(e: MembershipError) -> Self {
        match e {
            MembershipError::Conflict(msg) => ServerError::Conflict(msg),
            MembershipError::Limit(_) => ServerError::Conflict(e.to_string()),
            MembershipError::NotFound(_) | MembershipError::Forbidden(_) => ServerError::not_found(),
            MembershipError::Invalid(msg) => ServerError::bad_request(msg),
        }
    }
}

impl From<MagicError> for ServerError {
    fn from(e: MagicError) -> Self {
        match e {
            MagicError::Expired => {
                ServerError::Unauthorized("This link has expired. Please request a new one.".into())
            }
            _ => ServerError::Unauthorized("This link is not valid.".into()),
        }
    }
}

impl From<KeyError> for ServerError {
    fn from(_: KeyError) -> Self {
        ServerError::not_found()
    }
}

/// Attach an operation label to an error on its way up.
pub trait OpExt<T> {
    fn op(self, op: impl Into<String>) -> Result<T, ServerError>;
}

impl<T, E: Into<ServerError>> OpExt<T> for Result<T, E> {
    fn op(self, op: impl Into<String>) -> Result<T, ServerError> {
        self.map_err(|e| ServerError::Op {
            op: op.into(),
            source: Box::new(e.into()),
        })
    }
}

/// Report a best-effort side effect that failed. Never surfaces to the user.
pub fn alarm(op: &str, error: &dyn Display) {
    tracing::error!(alarm = true, op, error = %error, "best-effort operation failed");
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        let trail = self.trail().join(" > ");
        if status.is_server_error() {
            let alarm = matches!(self.innermost(), ServerError::Integrity(_));
            tracing::error!(alarm, %status, trail = %trail, error = %self, "request failed");
        } else {
            tracing::debug!(%status, trail = %trail, error = %self, "request rejected");
        }

        let body = match self.innermost() {
            ServerError::Validation { fields, .. } if !fields.is_empty() => serde_json::json!({
                "message": self.user_message(),
                "fields": fields,
            }),
            _ => serde_json::json!({ "message": self.user_message() }),
        };

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convo_shared::{Key, Kind};

    #[test]
    fn test_innermost_status_wins() {
        let err: Result<(), ServerError> = Err(ServerError::invalid("email", "Bad address"));
        let err = err.op("identity.create").op("users.create").unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.trail(), vec!["users.create", "identity.create"]);
        assert_eq!(err.user_message(), "Bad address");
    }

    #[test]
    fn test_permission_collapses_to_not_found() {
        let err: ServerError = MembershipError::Forbidden("owner only".into()).into();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        let err: ServerError = StoreError::NotFound(Key::new(Kind::User, 1)).into();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_limit_is_bad_request() {
        let err: ServerError = MembershipError::Limit(11).into();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_magic_errors_are_unauthorized() {
        let err: ServerError = MagicError::InvalidSignature.into();
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_internal_details_hidden() {
        let err = ServerError::Internal("disk on fire".into());
        assert!(!err.user_message().contains("disk"));
    }
}

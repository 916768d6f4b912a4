use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::{check, transport};
use crate::error::ServerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verb {
    NewEvent,
    UpdateEvent,
    DeleteEvent,
    #[serde(rename = "AddRSVP")]
    AddRsvp,
    #[serde(rename = "RemoveRSVP")]
    RemoveRsvp,
    NewMessage,
}

/// One push, addressed to one recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushNotification {
    pub actor_name: String,
    pub verb: Verb,
    /// `thread` or `event`.
    pub target: String,
    pub target_id: String,
    pub target_name: String,
}

#[async_trait]
pub trait PushGateway: Send + Sync {
    /// Deliver `notification` to the user with external ID `recipient`.
    async fn send(&self, recipient: &str, notification: &PushNotification) -> Result<(), ServerError>;

    /// Token the client uses to subscribe to its own channel.
    async fn realtime_token(&self, user_id: &str) -> Result<String, ServerError>;
}

pub struct HttpPushGateway {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpPushGateway {
    pub fn new(http: reqwest::Client, base_url: &str, api_key: String) -> Self {
        Self {
            http,
            base_url: base_url.to_string(),
            api_key,
        }
    }
}

#[derive(Serialize)]
struct PushRequest<'a> {
    channel: &'a str,
    data: &'a PushNotification,
}

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
}

#[async_trait]
impl PushGateway for HttpPushGateway {
    async fn send(&self, recipient: &str, notification: &PushNotification) -> Result<(), ServerError> {
        let response = self
            .http
            .post(format!("{}/publish", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&PushRequest {
                channel: recipient,
                data: notification,
            })
            .send()
            .await
            .map_err(transport("push"))?;
        check("push", response).await?;
        Ok(())
    }

    async fn realtime_token(&self, user_id: &str) -> Result<String, ServerError> {
        let response = self
            .http
            .post(format!("{}/tokens", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({ "channel": user_id }))
            .send()
            .await
            .map_err(transport("push"))?;
        let body: TokenResponse = check("push", response)
            .await?
            .json()
            .await
            .map_err(transport("push"))?;
        Ok(body.token)
    }
}

/// Records every push instead of delivering it.
#[derive(Default)]
pub struct MemoryPushGateway {
    sent: Mutex<Vec<(String, PushNotification)>>,
}

impl MemoryPushGateway {
    pub async fn sent(&self) -> Vec<(String, PushNotification)> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl PushGateway for MemoryPushGateway {
    async fn send(&self, recipient: &str, notification: &PushNotification) -> Result<(), ServerError> {
        tracing::debug!(recipient, verb = ?notification.verb, "push");
        self.sent
            .lock()
            .await
            .push((recipient.to_string(), notification.clone()));
        Ok(())
    }

    async fn realtime_token(&self, _user_id: &str) -> Result<String, ServerError> {
        Ok(convo_shared::crypto::random_token())
    }
}

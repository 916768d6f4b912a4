use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;

use super::{check, transport};
use crate::error::ServerError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Recipient {
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboundEmail {
    pub from_name: String,
    pub from: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    pub to: Vec<Recipient>,
    pub subject: String,
    pub html: String,
    pub text: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

#[async_trait]
pub trait MailGateway: Send + Sync {
    async fn send(&self, email: &OutboundEmail) -> Result<(), ServerError>;
}

/// Transactional e-mail API taking the message as JSON.
pub struct HttpMailGateway {
    http: reqwest::Client,
    url: String,
    api_key: String,
}

impl HttpMailGateway {
    pub fn new(http: reqwest::Client, url: &str, api_key: String) -> Self {
        Self {
            http,
            url: url.to_string(),
            api_key,
        }
    }
}

#[async_trait]
impl MailGateway for HttpMailGateway {
    async fn send(&self, email: &OutboundEmail) -> Result<(), ServerError> {
        let response = self
            .http
            .post(format!("{}/send", self.url))
            .bearer_auth(&self.api_key)
            .json(email)
            .send()
            .await
            .map_err(transport("mail"))?;
        check("mail", response).await?;
        Ok(())
    }
}

/// Keeps every message in memory.
#[derive(Default)]
pub struct MemoryMailbox {
    sent: Mutex<Vec<OutboundEmail>>,
}

impl MemoryMailbox {
    pub async fn sent(&self) -> Vec<OutboundEmail> {
        self.sent.lock().await.clone()
    }

    /// Messages addressed to `email`.
    pub async fn sent_to(&self, email: &str) -> Vec<OutboundEmail> {
        self.sent
            .lock()
            .await
            .iter()
            .filter(|m| m.to.iter().any(|r| r.email == email))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl MailGateway for MemoryMailbox {
    async fn send(&self, email: &OutboundEmail) -> Result<(), ServerError> {
        tracing::info!(
            to = ?email.to.iter().map(|r| r.email.as_str()).collect::<Vec<_>>(),
            subject = %email.subject,
            "mail"
        );
        self.sent.lock().await.push(email.clone());
        Ok(())
    }
}

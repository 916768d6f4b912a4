use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{check, transport};
use crate::error::ServerError;

#[async_trait]
pub trait SignatureStripper: Send + Sync {
    /// Reply text without quoted history and the sender's signature.
    async fn strip(&self, body: &str, sender: &str) -> Result<String, ServerError>;
}

pub struct HttpSignatureStripper {
    http: reqwest::Client,
    url: String,
    api_key: String,
}

impl HttpSignatureStripper {
    pub fn new(http: reqwest::Client, url: &str, api_key: String) -> Self {
        Self {
            http,
            url: url.to_string(),
            api_key,
        }
    }
}

#[derive(Serialize)]
struct StripRequest<'a> {
    body: &'a str,
    sender: &'a str,
}

#[derive(Deserialize)]
struct StripResponse {
    body: String,
}

#[async_trait]
impl SignatureStripper for HttpSignatureStripper {
    async fn strip(&self, body: &str, sender: &str) -> Result<String, ServerError> {
        let response = self
            .http
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&StripRequest { body, sender })
            .send()
            .await
            .map_err(transport("stripper"))?;
        let stripped: StripResponse = check("stripper", response)
            .await?
            .json()
            .await
            .map_err(transport("stripper"))?;
        Ok(stripped.body)
    }
}

/// Cuts at the conventional `-- ` signature marker and at the first quoted
/// line.
pub struct PassthroughStripper;

#[async_trait]
impl SignatureStripper for PassthroughStripper {
    async fn strip(&self, body: &str, _sender: &str) -> Result<String, ServerError> {
        let mut kept = Vec::new();
        for line in body.lines() {
            if line == "-- " || line.starts_with('>') {
                break;
            }
            kept.push(line);
        }
        Ok(kept.join("\n"))
    }
}

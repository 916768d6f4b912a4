//! E-mail job queue.
//!
//! Jobs are `{ids, type, action}` payloads. Only four (type, action) pairs
//! exist; anything else is refused when the job is built, so a malformed job
//! never reaches the queue.

use async_trait::async_trait;
use convo_shared::constants::EMAIL_QUEUE_NAME;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::{check, transport};
use crate::error::ServerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobType {
    User,
    Event,
    Thread,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobAction {
    SendWelcome,
    SendInvites,
    SendUpdatedInvites,
    SendThread,
}

/// Queue payload. For event and thread jobs `ids[0]` is the aggregate and any
/// further IDs narrow the recipients to those users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailJob {
    pub ids: Vec<String>,
    #[serde(rename = "type")]
    pub kind: JobType,
    pub action: JobAction,
}

impl EmailJob {
    pub fn new(kind: JobType, action: JobAction, ids: Vec<String>) -> Result<Self, ServerError> {
        let job = Self { ids, kind, action };
        job.validate()?;
        Ok(job)
    }

    pub fn validate(&self) -> Result<(), ServerError> {
        let valid = matches!(
            (self.kind, self.action),
            (JobType::User, JobAction::SendWelcome)
                | (JobType::Event, JobAction::SendInvites)
                | (JobType::Event, JobAction::SendUpdatedInvites)
                | (JobType::Thread, JobAction::SendThread)
        );
        if !valid {
            return Err(ServerError::bad_request(format!(
                "{:?} is not a valid action for {:?}",
                self.action, self.kind
            )));
        }
        if self.ids.is_empty() {
            return Err(ServerError::bad_request("job has no ids"));
        }
        Ok(())
    }
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, job: &EmailJob) -> Result<(), ServerError>;
}

pub type JobReceiver = mpsc::UnboundedReceiver<EmailJob>;

/// In-process queue drained by a consumer task.
#[derive(Clone)]
pub struct LocalQueue {
    tx: mpsc::UnboundedSender<EmailJob>,
}

impl LocalQueue {
    pub fn new() -> (Self, JobReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl TaskQueue for LocalQueue {
    async fn enqueue(&self, job: &EmailJob) -> Result<(), ServerError> {
        job.validate()?;
        self.tx
            .send(job.clone())
            .map_err(|_| ServerError::Internal("email queue closed".into()))
    }
}

/// Posts jobs to the worker endpoint of a (possibly remote) server.
pub struct HttpTaskQueue {
    http: reqwest::Client,
    base_url: String,
}

impl HttpTaskQueue {
    pub fn new(http: reqwest::Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.to_string(),
        }
    }
}

#[async_trait]
impl TaskQueue for HttpTaskQueue {
    async fn enqueue(&self, job: &EmailJob) -> Result<(), ServerError> {
        job.validate()?;
        let response = self
            .http
            .post(format!("{}/tasks/emails", self.base_url))
            .header("X-Appengine-QueueName", EMAIL_QUEUE_NAME)
            .json(job)
            .send()
            .await
            .map_err(transport("queue"))?;
        check("queue", response).await?;
        Ok(())
    }
}

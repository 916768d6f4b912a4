//! External collaborators.
//!
//! Each service the backend talks to sits behind a trait with an HTTP
//! implementation and an in-process one. The in-process implementations back
//! local development and the tests; [`Clients::from_config`] picks one per
//! service depending on whether its URL is configured.

pub mod blob_store;
pub mod link_preview;
pub mod mail;
pub mod oauth;
pub mod places;
pub mod push;
pub mod queue;
pub mod search;
pub mod stripper;

use std::sync::Arc;

use reqwest::Response;

use crate::config::{Secrets, ServerConfig};
use crate::error::ServerError;

pub use blob_store::{BlobStore, DiskBlobStore};
pub use link_preview::{HttpLinkPreviewer, LinkPreviewer, StaticLinkPreviewer};
pub use mail::{Attachment, HttpMailGateway, MailGateway, MemoryMailbox, OutboundEmail, Recipient};
pub use oauth::{HttpOAuth, OAuthProfile, OAuthProviders, Provider, StaticOAuth};
pub use places::{HttpPlaces, Place, Places, StaticPlaces};
pub use push::{HttpPushGateway, MemoryPushGateway, PushGateway, PushNotification, Verb};
pub use queue::{EmailJob, HttpTaskQueue, JobAction, JobType, LocalQueue, TaskQueue};
pub use search::{HttpSearchIndex, MemorySearchIndex, SearchEntry, SearchIndex};
pub use stripper::{HttpSignatureStripper, PassthroughStripper, SignatureStripper};

/// Every collaborator, shared by all requests and workers.
#[derive(Clone)]
pub struct Clients {
    pub search: Arc<dyn SearchIndex>,
    pub push: Arc<dyn PushGateway>,
    pub mail: Arc<dyn MailGateway>,
    pub blobs: Arc<dyn BlobStore>,
    pub places: Arc<dyn Places>,
    pub previews: Arc<dyn LinkPreviewer>,
    pub oauth: Arc<dyn OAuthProviders>,
    pub stripper: Arc<dyn SignatureStripper>,
    pub queue: Arc<dyn TaskQueue>,
}

impl Clients {
    /// Build the collaborators for `config`. Returns the receiving end of the
    /// local queue when e-mail jobs are processed in process.
    pub async fn from_config(
        config: &ServerConfig,
        secrets: &Secrets,
    ) -> Result<(Self, Option<queue::JobReceiver>), ServerError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .user_agent(concat!("convo/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ServerError::Internal(format!("HTTP client: {e}")))?;
        let key = |name: &str| secrets.get(name).unwrap_or_default().to_string();

        let search: Arc<dyn SearchIndex> = match &config.search_url {
            Some(url) => Arc::new(HttpSearchIndex::new(http.clone(), url, key("SEARCH_API_KEY"))),
            None => Arc::new(MemorySearchIndex::default()),
        };
        let push: Arc<dyn PushGateway> = match &config.push_url {
            Some(url) => Arc::new(HttpPushGateway::new(http.clone(), url, key("PUSH_API_KEY"))),
            None => Arc::new(MemoryPushGateway::default()),
        };
        let mail: Arc<dyn MailGateway> = match &config.mail_url {
            Some(url) => Arc::new(HttpMailGateway::new(http.clone(), url, key("MAIL_API_KEY"))),
            None => Arc::new(MemoryMailbox::default()),
        };
        let places: Arc<dyn Places> = match &config.places_url {
            Some(url) => Arc::new(HttpPlaces::new(http.clone(), url, key("PLACES_API_KEY"))),
            None => Arc::new(StaticPlaces::default()),
        };
        let previews: Arc<dyn LinkPreviewer> = if config.link_previews {
            Arc::new(HttpLinkPreviewer::new(http.clone()))
        } else {
            Arc::new(StaticLinkPreviewer::default())
        };
        let oauth: Arc<dyn OAuthProviders> = if config.oauth_enabled {
            Arc::new(HttpOAuth::new(http.clone()))
        } else {
            Arc::new(StaticOAuth::default())
        };
        let stripper: Arc<dyn SignatureStripper> = match &config.stripper_url {
            Some(url) => Arc::new(HttpSignatureStripper::new(
                http.clone(),
                url,
                key("STRIPPER_API_KEY"),
            )),
            None => Arc::new(PassthroughStripper),
        };
        let (queue, receiver): (Arc<dyn TaskQueue>, _) = match &config.tasks_base_url {
            Some(url) => (Arc::new(HttpTaskQueue::new(http.clone(), url)), None),
            None => {
                let (queue, receiver) = LocalQueue::new();
                (Arc::new(queue), Some(receiver))
            }
        };
        let blobs: Arc<dyn BlobStore> = Arc::new(
            DiskBlobStore::new(
                config.blob_storage_path.clone(),
                config.blob_base_url.clone(),
                config.max_blob_size,
            )
            .await?,
        );

        Ok((
            Self {
                search,
                push,
                mail,
                blobs,
                places,
                previews,
                oauth,
                stripper,
                queue,
            },
            receiver,
        ))
    }
}

/// Turn a non-2xx response into [`ServerError::External`].
pub(crate) async fn check(service: &str, response: Response) -> Result<Response, ServerError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let body: String = body.chars().take(200).collect();
    Err(ServerError::external(service, format!("{status}: {body}")))
}

pub(crate) fn transport(service: &'static str) -> impl Fn(reqwest::Error) -> ServerError {
    move |e| ServerError::external(service, e)
}

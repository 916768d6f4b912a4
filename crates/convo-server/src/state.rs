use std::sync::Arc;

use convo_shared::magic::MagicSigner;
use convo_store::Datastore;

use crate::clients::Clients;
use crate::config::ServerConfig;

/// The service object graph shared by handlers and background workers.
/// Everything in it is immutable after boot or internally synchronized.
#[derive(Clone)]
pub struct AppState {
    pub ds: Datastore,
    pub config: Arc<ServerConfig>,
    pub signer: Arc<MagicSigner>,
    pub clients: Clients,
}

impl AppState {
    pub fn new(ds: Datastore, config: ServerConfig, signer: MagicSigner, clients: Clients) -> Self {
        Self {
            ds,
            config: Arc::new(config),
            signer: Arc::new(signer),
            clients,
        }
    }
}

#[cfg(test)]
pub mod testing {
    //! In-process application for service and HTTP tests.

    use std::sync::Arc;

    use convo_shared::magic::MagicSigner;
    use convo_store::{Context, Datastore, Link, User};
    use tempfile::TempDir;

    use super::AppState;
    use crate::clients::queue::JobReceiver;
    use crate::clients::{
        Clients, DiskBlobStore, LocalQueue, MemoryMailbox, MemoryPushGateway, MemorySearchIndex,
        OAuthProfile, PassthroughStripper, Place, Provider, StaticLinkPreviewer, StaticOAuth,
        StaticPlaces,
    };
    use crate::config::ServerConfig;

    pub struct TestApp {
        pub state: AppState,
        pub mailbox: Arc<MemoryMailbox>,
        pub push: Arc<MemoryPushGateway>,
        pub search: Arc<MemorySearchIndex>,
        pub jobs: JobReceiver,
        _blobs: TempDir,
    }

    impl TestApp {
        pub async fn new() -> Self {
            let blobs = TempDir::new().unwrap();
            let config = ServerConfig {
                blob_storage_path: blobs.path().to_path_buf(),
                app_host: "convo.test".into(),
                mail_domain: "mail.host".into(),
                support_email: "support@convo.test".into(),
                ..ServerConfig::default()
            };

            let mailbox = Arc::new(MemoryMailbox::default());
            let push = Arc::new(MemoryPushGateway::default());
            let search = Arc::new(MemorySearchIndex::default());
            let (queue, jobs) = LocalQueue::new();
            let previews = StaticLinkPreviewer::default().with(Link {
                url: "https://example.com".into(),
                title: "Example Domain".into(),
                description: String::new(),
                image: String::new(),
            });
            let places = StaticPlaces::default().with(
                "place-1",
                Place {
                    address: "1 Main St".into(),
                    lat: 40.0,
                    lng: -74.0,
                    utc_offset: -300,
                },
            );
            let oauth = StaticOAuth::default().with(
                Provider::Google,
                "google-token",
                OAuthProfile {
                    id: "g-1".into(),
                    email: "oauth@x.com".into(),
                    first_name: "olive".into(),
                    last_name: "auth".into(),
                    avatar_url: String::new(),
                },
            );
            let blob_store = DiskBlobStore::new(
                blobs.path().to_path_buf(),
                "http://blobs.test".into(),
                config.max_blob_size,
            )
            .await
            .unwrap();

            let clients = Clients {
                search: search.clone(),
                push: push.clone(),
                mail: mailbox.clone(),
                blobs: Arc::new(blob_store),
                places: Arc::new(places),
                previews: Arc::new(previews),
                oauth: Arc::new(oauth),
                stripper: Arc::new(PassthroughStripper),
                queue: Arc::new(queue),
            };
            let state = AppState::new(
                Datastore::in_memory().unwrap(),
                config,
                MagicSigner::new(b"test-signing-secret".to_vec()),
                clients,
            );

            Self {
                state,
                mailbox,
                push,
                search,
                jobs,
                _blobs: blobs,
            }
        }

        /// Run every queued e-mail job, including the ones queued while
        /// running them.
        pub async fn drain_jobs(&mut self) {
            while let Ok(job) = self.jobs.try_recv() {
                self.state.handle_email_job(&Context::background(), &job).await.unwrap();
            }
        }

        /// Drop queued jobs without running them.
        pub fn discard_jobs(&mut self) {
            while self.jobs.try_recv().is_ok() {}
        }

        /// A verified user with a password.
        pub async fn registered_user(&self, email: &str, first_name: &str) -> User {
            let mut user = User::new(email);
            user.first_name = first_name.into();
            user.password = Some(crate::services::identity::hash_password("password1").await.unwrap());
            user.add_email(email);
            self.state
                .commit_user(&Context::background(), &mut user)
                .await
                .unwrap();
            user
        }

        /// Let spawned fan-out tasks run.
        pub async fn settle(&self) {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
    }
}

//! Messages under threads and events.
//!
//! Link previews and photo uploads are resolved before the transaction opens
//! so a retried transaction never fetches or uploads twice.

use std::sync::OnceLock;

use chrono::Utc;
use convo_shared::{Key, Kind};
use convo_store::{Context, Link, Message, Named, User};
use regex::Regex;
use serde::Deserialize;

use super::membership::Aggregate;
use crate::clients::blob_store::blob_path;
use crate::clients::Verb;
use crate::error::{alarm, OpExt, ServerError};
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct NewMessage {
    #[serde(default)]
    pub body: String,
}

/// Message content after preview resolution and upload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Draft {
    pub body: String,
    pub photos: Vec<String>,
    pub link: Option<Link>,
}

fn url_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"https?://[^\s<>"'()\[\]]+"#).expect("valid regex"))
}

fn spaces_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[ \t]{2,}").expect("valid regex"))
}

/// First http(s) URL in `body`, without trailing punctuation.
pub fn first_url(body: &str) -> Option<&str> {
    let found = url_regex().find(body)?;
    let url = found
        .as_str()
        .trim_end_matches(['.', ',', ';', ':', '!', '?']);
    (url.len() > "https://".len()).then_some(url)
}

/// Whether `url` appears as the target of a markdown link `[..](url)`.
pub fn in_markdown_link(body: &str, url: &str) -> bool {
    body.contains(&format!("]({url})")) || body.contains(&format!("]( {url} )"))
}

/// `body` with the first occurrence of `url` removed and the gap closed.
pub fn strip_url(body: &str, url: &str) -> String {
    let stripped = body.replacen(url, "", 1);
    let stripped = spaces_regex().replace_all(&stripped, " ");
    stripped
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

impl AppState {
    /// Resolve the first URL's preview (best effort) and upload `photo`.
    /// A raw URL is dropped from the body once its preview resolved, unless
    /// it is the target of a markdown link.
    pub async fn prepare_message(
        &self,
        parent: Key,
        body: &str,
        photo: Option<&[u8]>,
    ) -> Result<Draft, ServerError> {
        let mut draft = Draft {
            body: body.trim().to_string(),
            ..Draft::default()
        };

        if let Some(url) = first_url(&draft.body).map(str::to_string) {
            match self.clients.previews.preview(&url).await {
                Ok(Some(mut link)) => {
                    if link.url.is_empty() {
                        link.url = url.clone();
                    }
                    if !in_markdown_link(&draft.body, &url) {
                        draft.body = strip_url(&draft.body, &url);
                    }
                    draft.link = Some(link);
                }
                Ok(None) => {}
                Err(e) => alarm("messages.link_preview", &e),
            }
        }

        if let Some(data) = photo.filter(|d| !d.is_empty()) {
            let path = blob_path(&format!("messages/{}", parent.encode()));
            let url = self
                .clients
                .blobs
                .put(&path, data)
                .await
                .op("messages.upload_photo")?;
            draft.photos.push(url);
        }

        if draft.body.is_empty() && draft.link.is_none() && draft.photos.is_empty() {
            return Err(ServerError::invalid("body", "Write something first"));
        }
        Ok(draft)
    }

    /// Store `draft` under `aggregate` and update the aggregate. Joins the
    /// caller's transaction.
    pub(crate) async fn append_message<A: Aggregate>(
        &self,
        ctx: &Context,
        aggregate: &mut A,
        author: Key,
        draft: &Draft,
    ) -> Result<Message, ServerError> {
        let parent = aggregate.key().ok_or_else(ServerError::not_found)?;
        let mut message = Message::new(author, parent, draft.body.clone());
        message.photos = draft.photos.clone();
        message.link = draft.link.clone();
        self.ds.put(ctx, &mut message).await?;

        aggregate.on_message(&message, message.created_at);
        self.ds.put(ctx, aggregate).await?;
        Ok(message)
    }

    /// Post as `actor`, who must take part in `parent`. Returns the stored
    /// message and the updated aggregate.
    pub async fn post_message<A: Aggregate>(
        &self,
        ctx: &Context,
        actor: &User,
        parent: Key,
        body: &str,
        photo: Option<&[u8]>,
    ) -> Result<(Message, A), ServerError> {
        let author = actor.key.ok_or_else(ServerError::unauthorized)?;
        let _: A = self.load_member(ctx, parent, author).await?;
        let draft = self.prepare_message(parent, body, photo).await?;

        let draft = &draft;
        let (message, aggregate) = self
            .ds
            .run_in_transaction(ctx, |ctx| async move {
                let mut aggregate: A = self.load_member(&ctx, parent, author).await?;
                let message = self.append_message(&ctx, &mut aggregate, author, draft).await?;
                Ok::<_, ServerError>((message, aggregate))
            })
            .await
            .op(format!("messages.post(parent={parent})"))?;

        tracing::info!(parent = %parent, message = ?message.key, "message posted");
        self.push(
            ctx,
            actor,
            aggregate.participants(),
            Verb::NewMessage,
            parent,
            &aggregate.name(),
        );
        if parent.kind == Kind::Thread {
            self.enqueue_thread_mail(ctx, parent, &[]).await;
        }
        Ok((message, aggregate))
    }

    pub async fn list_messages<A: Aggregate>(
        &self,
        ctx: &Context,
        actor: &User,
        parent: Key,
    ) -> Result<Vec<Message>, ServerError> {
        let user = actor.key.ok_or_else(ServerError::unauthorized)?;
        let _: A = self.load_member(ctx, parent, user).await?;
        Ok(self.ds.messages_for_parent(ctx, parent).await?)
    }

    /// Authors delete their own messages. A thread's first message anchors it
    /// and stays.
    pub async fn delete_message<A: Aggregate>(
        &self,
        ctx: &Context,
        actor: &User,
        parent: Key,
        message: Key,
    ) -> Result<(), ServerError> {
        let user = actor.key.ok_or_else(ServerError::unauthorized)?;
        self.ds
            .run_in_transaction(ctx, |ctx| async move {
                let mut aggregate: A = self.load_member(&ctx, parent, user).await?;
                let stored = self
                    .ds
                    .get_in_tx::<Message>(&ctx, message)
                    .await?
                    .filter(|m| m.parent == parent && m.author == user)
                    .ok_or_else(ServerError::not_found)?;

                if parent.kind == Kind::Thread {
                    let messages = self.ds.messages_for_parent(&ctx, parent).await?;
                    if messages.first().and_then(|m| m.key) == stored.key {
                        return Err(ServerError::bad_request(
                            "The first message of a conversation can't be deleted",
                        ));
                    }
                }

                self.ds.delete(&ctx, message).await?;
                aggregate.on_message_deleted();
                self.ds.put(&ctx, &mut aggregate).await?;
                Ok::<_, ServerError>(())
            })
            .await
            .op(format!("messages.delete(message={message})"))?;
        tracing::info!(parent = %parent, message = %message, "message deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::testing::TestApp;
    use axum::http::StatusCode;
    use convo_store::{Readable, Thread};

    #[test]
    fn test_url_helpers() {
        assert_eq!(first_url("see https://example.com."), Some("https://example.com"));
        assert_eq!(first_url("no links here"), None);
        assert!(in_markdown_link("[site](https://example.com)", "https://example.com"));
        assert!(!in_markdown_link("https://example.com", "https://example.com"));
        assert_eq!(strip_url("hello https://example.com", "https://example.com"), "hello");
        assert_eq!(strip_url("a https://x.io b", "https://x.io"), "a b");
    }

    async fn thread_between(app: &TestApp, owner: &User, other: &User) -> Key {
        let mut thread = Thread::new(owner, "Hi").unwrap();
        thread.add_user(other).unwrap();
        app.state.ds.put(&Context::background(), &mut thread).await.unwrap()
    }

    #[tokio::test]
    async fn test_post_strips_raw_url_and_keeps_markdown_links() {
        let app = TestApp::new().await;
        let ctx = Context::background();
        let ann = app.registered_user("ann@x.com", "Ann").await;
        let bob = app.registered_user("bob@x.com", "Bob").await;
        let key = thread_between(&app, &ann, &bob).await;

        let (first, thread): (Message, Thread) = app
            .state
            .post_message(&ctx, &ann, key, "hello https://example.com", None)
            .await
            .unwrap();
        assert_eq!(first.body, "hello");
        assert_eq!(first.link.as_ref().unwrap().url, "https://example.com");
        assert!(first.is_read(ann.key.unwrap()));
        assert_eq!(thread.response_count, 1);
        assert_eq!(thread.subject, "Hi");

        let body = "look [here](https://example.com)";
        let (reply, thread): (Message, Thread) = app
            .state
            .post_message(&ctx, &bob, key, body, None)
            .await
            .unwrap();
        assert_eq!(reply.body, body);
        assert_eq!(thread.subject, "Example Domain");
        assert!(thread.is_read(bob.key.unwrap()));
        assert!(!thread.is_read(ann.key.unwrap()));
    }

    #[tokio::test]
    async fn test_outsiders_and_empty_bodies_rejected() {
        let app = TestApp::new().await;
        let ctx = Context::background();
        let ann = app.registered_user("ann@x.com", "Ann").await;
        let bob = app.registered_user("bob@x.com", "Bob").await;
        let eve = app.registered_user("eve@x.com", "Eve").await;
        let key = thread_between(&app, &ann, &bob).await;

        let err = app
            .state
            .post_message::<Thread>(&ctx, &eve, key, "hi", None)
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);

        let err = app
            .state
            .post_message::<Thread>(&ctx, &ann, key, "   ", None)
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_photo_upload() {
        let app = TestApp::new().await;
        let ctx = Context::background();
        let ann = app.registered_user("ann@x.com", "Ann").await;
        let bob = app.registered_user("bob@x.com", "Bob").await;
        let key = thread_between(&app, &ann, &bob).await;

        let (message, _): (Message, Thread) = app
            .state
            .post_message(&ctx, &ann, key, "", Some(b"jpeg bytes".as_slice()))
            .await
            .unwrap();
        assert_eq!(message.photos.len(), 1);
        let prefix = format!("http://blobs.test/messages/{}/", key.encode());
        assert!(message.photos[0].starts_with(&prefix));
    }

    #[tokio::test]
    async fn test_delete_rules() {
        let app = TestApp::new().await;
        let ctx = Context::background();
        let ann = app.registered_user("ann@x.com", "Ann").await;
        let bob = app.registered_user("bob@x.com", "Bob").await;
        let key = thread_between(&app, &ann, &bob).await;

        let (first, _): (Message, Thread) =
            app.state.post_message(&ctx, &ann, key, "first", None).await.unwrap();
        let (reply, _): (Message, Thread) =
            app.state.post_message(&ctx, &bob, key, "reply", None).await.unwrap();

        let err = app
            .state
            .delete_message::<Thread>(&ctx, &ann, key, first.key.unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let err = app
            .state
            .delete_message::<Thread>(&ctx, &ann, key, reply.key.unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);

        app.state
            .delete_message::<Thread>(&ctx, &bob, key, reply.key.unwrap())
            .await
            .unwrap();
        let thread: Thread = app.state.ds.get(&ctx, key).await.unwrap();
        assert_eq!(thread.response_count, 1);
        let left = app.state.list_messages::<Thread>(&ctx, &ann, key).await.unwrap();
        assert_eq!(left.len(), 1);
    }
}

//! Threads: persistent group conversations.

use chrono::Utc;
use convo_shared::{Key, Kind};
use convo_store::{Context, Message, Named, Readable, Thread, User};
use serde::Deserialize;

use super::identity::UserRef;
use super::membership::Aggregate;
use crate::clients::Verb;
use crate::error::{OpExt, ServerError};
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct NewThread {
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub users: Vec<UserRef>,
    /// Becomes the anchor message when present.
    #[serde(default)]
    pub body: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ThreadUpdate {
    #[serde(default)]
    pub subject: Option<String>,
}

impl AppState {
    /// Start a thread owned by `actor` with `input.users`, creating shells for
    /// unknown addresses. A body (or photo) becomes the anchor message.
    pub async fn create_thread(
        &self,
        ctx: &Context,
        actor: &User,
        input: &NewThread,
        photo: Option<&[u8]>,
    ) -> Result<Thread, ServerError> {
        let owner = actor.key.ok_or_else(ServerError::unauthorized)?;
        if !actor.registered {
            return Err(ServerError::bad_request(
                "Finish signing up before starting a conversation",
            ));
        }

        let key = self
            .ds
            .allocate(ctx, Kind::Thread, 1)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ServerError::Internal("no key allocated".into()))?;
        let draft = if input.body.trim().is_empty() && photo.is_none() {
            None
        } else {
            Some(self.prepare_message(key, &input.body, photo).await?)
        };

        let draft = draft.as_ref();
        let now = Utc::now();
        let (thread, created) = self
            .ds
            .run_in_transaction(ctx, |ctx| async move {
                let mut thread = Thread::new(actor, &input.subject)?;
                thread.key = Some(key);
                let resolved = self.get_or_create_users(&ctx, &input.users).await?;
                let mut joined = Vec::with_capacity(resolved.users.len());
                for user in &resolved.users {
                    if user.key != Some(owner) {
                        joined.push(thread.add_user(user)?);
                    }
                }
                thread.mark_read(owner, now);
                self.ds.put(&ctx, &mut thread).await?;
                if let Some(draft) = draft {
                    self.append_message(&ctx, &mut thread, owner, draft).await?;
                }
                self.introduce(&ctx, owner, &joined, Thread::TAG).await?;
                Ok::<_, ServerError>((thread, resolved.created))
            })
            .await
            .op("threads.create")?;

        tracing::info!(thread = %key, users = thread.users.len(), "thread created");
        self.enqueue_welcome(ctx, &created).await;
        if thread.response_count > 0 {
            self.push(ctx, actor, &thread.users, Verb::NewMessage, key, &thread.name());
            self.enqueue_thread_mail(ctx, key, &[]).await;
        }
        Ok(thread)
    }

    pub async fn get_thread(&self, ctx: &Context, actor: &User, key: Key) -> Result<Thread, ServerError> {
        let user = actor.key.ok_or_else(ServerError::unauthorized)?;
        self.load_member(ctx, key, user).await
    }

    /// `actor`'s threads, most recently active first.
    pub async fn list_threads(&self, ctx: &Context, actor: &User) -> Result<Vec<Thread>, ServerError> {
        let user = actor.key.ok_or_else(ServerError::unauthorized)?;
        Ok(self.ds.threads_for_user(ctx, user).await?)
    }

    pub async fn update_thread(
        &self,
        ctx: &Context,
        actor: &User,
        key: Key,
        update: &ThreadUpdate,
    ) -> Result<Thread, ServerError> {
        let user = actor.key.ok_or_else(ServerError::unauthorized)?;
        self.ds
            .run_in_transaction(ctx, |ctx| async move {
                let mut thread: Thread = self.load_member(&ctx, key, user).await?;
                if !thread.owner_is(user) {
                    return Err(ServerError::not_found());
                }
                if let Some(subject) = &update.subject {
                    thread.set_subject(subject)?;
                }
                thread.updated_at = Utc::now();
                self.ds.put(&ctx, &mut thread).await?;
                Ok::<_, ServerError>(thread)
            })
            .await
            .op(format!("threads.update(thread={key})"))
    }

    /// Owner only. Messages go with the thread.
    pub async fn delete_thread(&self, ctx: &Context, actor: &User, key: Key) -> Result<(), ServerError> {
        let user = actor.key.ok_or_else(ServerError::unauthorized)?;
        self.ds
            .run_in_transaction(ctx, |ctx| async move {
                let thread: Thread = self.load_member(&ctx, key, user).await?;
                if !thread.owner_is(user) {
                    return Err(ServerError::not_found());
                }
                let messages: Vec<Message> = self.ds.messages_for_parent(&ctx, key).await?;
                let mut keys: Vec<Key> = messages.iter().filter_map(|m| m.key).collect();
                keys.push(key);
                self.ds.delete_multi(&ctx, &keys).await?;
                Ok::<_, ServerError>(())
            })
            .await
            .op(format!("threads.delete(thread={key})"))?;
        tracing::info!(thread = %key, "thread deleted");
        Ok(())
    }

    /// Owner only. The newcomer is mailed the thread if they read by e-mail.
    pub async fn add_thread_user(
        &self,
        ctx: &Context,
        actor: &User,
        key: Key,
        user_id: &str,
    ) -> Result<Thread, ServerError> {
        let owner = actor.key.ok_or_else(ServerError::unauthorized)?;
        let (thread, added) = self
            .ds
            .run_in_transaction(ctx, |ctx| async move {
                let mut thread: Thread = self.load_member(&ctx, key, owner).await?;
                if !thread.owner_is(owner) {
                    return Err(ServerError::not_found());
                }
                let user = self.user_by_id(&ctx, user_id).await?;
                let added = thread.add_user(&user)?;
                thread.updated_at = Utc::now();
                self.ds.put(&ctx, &mut thread).await?;
                self.introduce(&ctx, owner, &[added], Thread::TAG).await?;
                Ok::<_, ServerError>((thread, added))
            })
            .await
            .op(format!("threads.add_user(thread={key})"))?;

        tracing::info!(thread = %key, user = %added, "user added to thread");
        if thread.response_count > 0 {
            self.enqueue_thread_mail(ctx, key, &[added]).await;
        }
        Ok(thread)
    }

    /// The owner removes anyone else; a participant removes themselves.
    pub async fn remove_thread_user(
        &self,
        ctx: &Context,
        actor: &User,
        key: Key,
        target: Key,
    ) -> Result<Thread, ServerError> {
        let user = actor.key.ok_or_else(ServerError::unauthorized)?;
        let thread = self
            .ds
            .run_in_transaction(ctx, |ctx| async move {
                let mut thread: Thread = self.load_member(&ctx, key, user).await?;
                if !thread.owner_is(user) && target != user {
                    return Err(ServerError::not_found());
                }
                thread.remove_user(target)?;
                self.ds.put(&ctx, &mut thread).await?;
                Ok::<_, ServerError>(thread)
            })
            .await
            .op(format!("threads.remove_user(thread={key})"))?;
        tracing::info!(thread = %key, user = %target, "user removed from thread");
        Ok(thread)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::JobAction;
    use crate::state::testing::TestApp;
    use axum::http::StatusCode;

    fn input(subject: &str, users: Vec<UserRef>, body: &str) -> NewThread {
        NewThread {
            subject: subject.into(),
            users,
            body: body.into(),
        }
    }

    #[tokio::test]
    async fn test_create_with_shell_and_anchor() {
        let mut app = TestApp::new().await;
        let ctx = Context::background();
        let ann = app.registered_user("ann@x.com", "Ann").await;
        let bob = app.registered_user("bob@x.com", "Bob").await;

        let thread = app
            .state
            .create_thread(
                &ctx,
                &ann,
                &input(
                    "Hi",
                    vec![UserRef::id(bob.key.unwrap().encode()), UserRef::email("new@x.com")],
                    "hello",
                ),
                None,
            )
            .await
            .unwrap();

        assert_eq!(thread.users.len(), 3);
        assert_eq!(thread.owner, ann.key.unwrap());
        assert_eq!(thread.response_count, 1);
        assert_eq!(thread.preview.as_ref().unwrap().body, "hello");

        let ann: User = app.state.ds.get(&ctx, ann.key.unwrap()).await.unwrap();
        assert_eq!(ann.contacts.len(), 2);

        let mut actions = Vec::new();
        while let Ok(job) = app.jobs.try_recv() {
            actions.push(job.action);
        }
        assert!(actions.contains(&JobAction::SendWelcome));
        assert!(actions.contains(&JobAction::SendThread));
    }

    #[tokio::test]
    async fn test_thread_size_limit() {
        let app = TestApp::new().await;
        let ctx = Context::background();
        let ann = app.registered_user("ann@x.com", "Ann").await;

        let ten: Vec<UserRef> = (0..10).map(|i| UserRef::email(format!("u{i}@x.com"))).collect();
        let thread = app
            .state
            .create_thread(&ctx, &ann, &input("Full", ten, ""), None)
            .await
            .unwrap();
        assert_eq!(thread.users.len(), 11);

        let extra = app.registered_user("extra@x.com", "Extra").await;
        let err = app
            .state
            .add_thread_user(&ctx, &ann, thread.key.unwrap(), &extra.key.unwrap().encode())
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let eleven: Vec<UserRef> = (0..11).map(|i| UserRef::email(format!("v{i}@x.com"))).collect();
        let err = app
            .state
            .create_thread(&ctx, &ann, &input("Over", eleven, ""), None)
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_owner_only_operations() {
        let app = TestApp::new().await;
        let ctx = Context::background();
        let ann = app.registered_user("ann@x.com", "Ann").await;
        let bob = app.registered_user("bob@x.com", "Bob").await;
        let thread = app
            .state
            .create_thread(&ctx, &ann, &input("Hi", vec![UserRef::id(bob.key.unwrap().encode())], ""), None)
            .await
            .unwrap();
        let key = thread.key.unwrap();

        let update = ThreadUpdate {
            subject: Some("Renamed".into()),
        };
        let err = app.state.update_thread(&ctx, &bob, key, &update).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        let renamed = app.state.update_thread(&ctx, &ann, key, &update).await.unwrap();
        assert_eq!(renamed.subject, "Renamed");

        let err = app.state.delete_thread(&ctx, &bob, key).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        app.state.delete_thread(&ctx, &ann, key).await.unwrap();
        let err = app.state.get_thread(&ctx, &ann, key).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_add_then_remove_restores_participants() {
        let app = TestApp::new().await;
        let ctx = Context::background();
        let ann = app.registered_user("ann@x.com", "Ann").await;
        let bob = app.registered_user("bob@x.com", "Bob").await;
        let cat = app.registered_user("cat@x.com", "Cat").await;
        let thread = app
            .state
            .create_thread(&ctx, &ann, &input("Hi", vec![UserRef::id(bob.key.unwrap().encode())], ""), None)
            .await
            .unwrap();
        let key = thread.key.unwrap();
        let before = thread.users.clone();

        app.state
            .add_thread_user(&ctx, &ann, key, &cat.key.unwrap().encode())
            .await
            .unwrap();
        let err = app
            .state
            .add_thread_user(&ctx, &ann, key, &cat.key.unwrap().encode())
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        // bob may not remove cat, but cat may leave
        let err = app
            .state
            .remove_thread_user(&ctx, &bob, key, cat.key.unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        let after = app
            .state
            .remove_thread_user(&ctx, &cat, key, cat.key.unwrap())
            .await
            .unwrap();
        assert_eq!(after.users, before);

        let err = app
            .state
            .remove_thread_user(&ctx, &ann, key, ann.key.unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_mark_read_walks_messages() {
        let app = TestApp::new().await;
        let ctx = Context::background();
        let ann = app.registered_user("ann@x.com", "Ann").await;
        let bob = app.registered_user("bob@x.com", "Bob").await;
        let thread = app
            .state
            .create_thread(&ctx, &ann, &input("Hi", vec![UserRef::id(bob.key.unwrap().encode())], "one"), None)
            .await
            .unwrap();
        let key = thread.key.unwrap();
        app.state
            .post_message::<Thread>(&ctx, &ann, key, "two", None)
            .await
            .unwrap();

        let thread: Thread = app.state.mark_read(&ctx, &bob, key).await.unwrap();
        assert!(thread.is_read(bob.key.unwrap()));
        let messages = app.state.ds.messages_for_parent(&ctx, key).await.unwrap();
        assert!(messages.iter().all(|m| m.is_read(bob.key.unwrap())));

        let again: Thread = app.state.mark_read(&ctx, &bob, key).await.unwrap();
        assert_eq!(again.reads.len(), thread.reads.len());
    }
}

//! Account merging.
//!
//! Two accounts end up describing one person when an invitation shell and a
//! registered account meet (e-mail verification, OAuth linking). The survivor
//! `u` takes over every reference to the absorbed account `v`, then `v` is
//! deleted. All of it happens in one transaction.

use std::collections::HashMap;

use convo_shared::Key;
use convo_store::{Context, Event, Message, Note, Readable, Thread, User, UserPartial};

use crate::error::{OpExt, ServerError};
use crate::state::AppState;

/// Fold `v`'s profile into `u`: verified addresses, contacts, linked
/// identities, a password `u` lacks, and the tag histogram.
fn absorb_profile(u: &mut User, v: &User, u_key: Key, v_key: Key) {
    for email in &v.emails {
        u.add_email(email);
    }
    for contact in &v.contacts {
        if *contact != u_key {
            u.add_contact(*contact);
        }
    }
    u.remove_contact(v_key);
    if u.google_id.is_none() {
        u.google_id = v.google_id.clone();
    }
    if u.facebook_id.is_none() {
        u.facebook_id = v.facebook_id.clone();
    }
    if u.password.is_none() {
        u.password = v.password.clone();
    }
    if u.avatar_url.is_empty() {
        u.avatar_url = v.avatar_url.clone();
    }
    if u.first_name.is_empty() {
        u.first_name = v.first_name.clone();
    }
    if u.last_name.is_empty() {
        u.last_name = v.last_name.clone();
    }
    for (tag, count) in &v.tags {
        *u.tags.entry(tag.clone()).or_insert(0) += count;
    }
    u.derive();
}

impl AppState {
    /// Move everything that references `v` onto `u` and delete `v`, inside the
    /// caller's transaction. `u` is updated in memory; the caller commits it.
    pub(crate) async fn absorb(&self, ctx: &Context, u: &mut User, v: &User) -> Result<(), ServerError> {
        let u_key = u.key.ok_or_else(ServerError::not_found)?;
        let v_key = v.key.ok_or_else(ServerError::not_found)?;
        if u_key == v_key {
            return Err(ServerError::bad_request("an account cannot absorb itself"));
        }
        absorb_profile(u, v, u_key, v_key);
        let partial = UserPartial::of(u)?;

        // Messages are touched from several directions; each is written once.
        let mut messages: HashMap<Key, Message> = HashMap::new();

        for found in self.ds.threads_referencing(ctx, v_key).await? {
            let Some(key) = found.key else { continue };
            let Some(mut thread) = self.ds.get_in_tx::<Thread>(ctx, key).await? else {
                continue;
            };
            thread.replace_user(v_key, &partial);
            self.ds.put(ctx, &mut thread).await?;
            for message in self.ds.messages_for_parent(ctx, key).await? {
                collect(&mut messages, message);
            }
        }

        for found in self.ds.events_referencing(ctx, v_key).await? {
            let Some(key) = found.key else { continue };
            let Some(mut event) = self.ds.get_in_tx::<Event>(ctx, key).await? else {
                continue;
            };
            event.replace_user(v_key, &partial);
            self.ds.put(ctx, &mut event).await?;
            for message in self.ds.messages_for_parent(ctx, key).await? {
                collect(&mut messages, message);
            }
        }

        for message in self.ds.messages_by_author(ctx, v_key).await? {
            collect(&mut messages, message);
        }
        let mut rewritten: Vec<Message> = Vec::new();
        for (key, mut message) in messages {
            if message.author != v_key && !message.is_read(v_key) {
                continue;
            }
            if let Some(current) = self.ds.get_in_tx::<Message>(ctx, key).await? {
                message = current;
            }
            if message.author == v_key {
                message.author = u_key;
            }
            message.replace_reader(v_key, u_key);
            rewritten.push(message);
        }
        if !rewritten.is_empty() {
            self.ds.put_multi(ctx, &mut rewritten).await?;
        }

        let mut holders: Vec<User> = Vec::new();
        for found in self.ds.users_with_contact(ctx, v_key).await? {
            let Some(key) = found.key else { continue };
            if key == u_key || key == v_key {
                continue;
            }
            if let Some(mut holder) = self.ds.get_in_tx::<User>(ctx, key).await? {
                holder.replace_contact(v_key, u_key);
                holders.push(holder);
            }
        }
        if !holders.is_empty() {
            self.ds.put_multi(ctx, &mut holders).await?;
        }

        let mut notes: Vec<Note> = self.ds.notes_by_owner(ctx, v_key).await?;
        for note in &mut notes {
            note.owner = u_key;
        }
        if !notes.is_empty() {
            self.ds.put_multi(ctx, &mut notes).await?;
        }

        self.delete_user_with_tx(ctx, v_key).await?;
        tracing::info!(
            survivor = %u_key,
            absorbed = %v_key,
            messages = rewritten.len(),
            contacts = holders.len(),
            notes = notes.len(),
            "accounts merged"
        );
        Ok(())
    }

    /// Merge `v` into `u` and commit. Returns the survivor.
    pub async fn merge_users(&self, ctx: &Context, u: Key, v: Key) -> Result<User, ServerError> {
        self.ds
            .run_in_transaction(ctx, |ctx| async move {
                let mut survivor = self
                    .ds
                    .get_in_tx::<User>(&ctx, u)
                    .await?
                    .ok_or_else(ServerError::not_found)?;
                let absorbed = self
                    .ds
                    .get_in_tx::<User>(&ctx, v)
                    .await?
                    .ok_or_else(ServerError::not_found)?;
                self.absorb(&ctx, &mut survivor, &absorbed).await?;
                self.commit_user(&ctx, &mut survivor).await?;
                Ok::<_, ServerError>(survivor)
            })
            .await
            .op(format!("merge(survivor={u}, absorbed={v})"))
    }
}

fn collect(messages: &mut HashMap<Key, Message>, message: Message) {
    if let Some(key) = message.key {
        messages.entry(key).or_insert(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::events::NewEvent;
    use crate::services::identity::UserRef;
    use crate::services::threads::NewThread;
    use crate::state::testing::TestApp;
    use chrono::Utc;
    use convo_shared::Kind;

    #[tokio::test]
    async fn test_merge_moves_every_reference() {
        let app = TestApp::new().await;
        let ctx = Context::background();
        let ann = app.registered_user("ann@x.com", "Ann").await;
        let carl = app.registered_user("carl@x.com", "Carl").await;
        let ann_key = ann.key.unwrap();
        let carl_key = carl.key.unwrap();

        // A shell invited to a thread and an event, who then posts and writes a note.
        let thread = app
            .state
            .create_thread(
                &ctx,
                &carl,
                &NewThread {
                    subject: "Plans".into(),
                    users: vec![UserRef::email("dup@x.com")],
                    body: "first".into(),
                },
                None,
            )
            .await
            .unwrap();
        let event = app
            .state
            .create_event(
                &ctx,
                &carl,
                &NewEvent {
                    name: "Party".into(),
                    description: String::new(),
                    timestamp: Utc::now() + chrono::Duration::days(1),
                    place_id: String::new(),
                    users: vec![UserRef::email("dup@x.com")],
                    guests_can_invite: false,
                },
            )
            .await
            .unwrap();
        let shell = app.state.user_by_email(&ctx, "dup@x.com").await.unwrap().unwrap();
        let shell_key = shell.key.unwrap();
        let (message, _): (Message, Thread) = app
            .state
            .post_message(&ctx, &shell, thread.key.unwrap(), "from the shell", None)
            .await
            .unwrap();
        let mut note = Note::new(shell_key, "remember");
        app.state.ds.put(&ctx, &mut note).await.unwrap();
        app.state.rsvp(&ctx, &shell, event.key.unwrap()).await.unwrap();

        let mut shell_verified = shell.clone();
        shell_verified.add_email("dup@x.com");
        app.state.commit_user(&ctx, &mut shell_verified).await.unwrap();

        let survivor = app.state.merge_users(&ctx, ann_key, shell_key).await.unwrap();
        assert!(survivor.has_verified_email("dup@x.com"));
        assert!(survivor.has_contact(carl_key));
        assert_eq!(survivor.tags.get("thread"), Some(&1));

        let thread: Thread = app.state.ds.get(&ctx, thread.key.unwrap()).await.unwrap();
        assert!(thread.has_user(ann_key));
        assert!(!thread.references(shell_key));
        let event: Event = app.state.ds.get(&ctx, event.key.unwrap()).await.unwrap();
        assert!(event.has_rsvp(ann_key));
        assert!(!event.references(shell_key));
        let message: Message = app.state.ds.get(&ctx, message.key.unwrap()).await.unwrap();
        assert_eq!(message.author, ann_key);
        assert!(message.is_read(ann_key));
        let notes = app.state.ds.notes_by_owner(&ctx, ann_key).await.unwrap();
        assert_eq!(notes.len(), 1);
        let carl: User = app.state.ds.get(&ctx, carl_key).await.unwrap();
        assert!(carl.has_contact(ann_key));
        assert!(!carl.has_contact(shell_key));

        assert!(app.state.ds.get_opt::<User>(&ctx, shell_key).await.unwrap().is_none());
    }

    #[test]
    fn test_profile_names_fall_back_per_field() {
        let u_key = Key::new(Kind::User, 1);
        let v_key = Key::new(Kind::User, 2);
        let mut u = User::new("ann@x.com");
        u.key = Some(u_key);
        u.first_name = "Ann".into();
        let mut v = User::new("ann@y.com");
        v.key = Some(v_key);
        v.first_name = "Annie".into();
        v.last_name = "Lee".into();
        v.avatar_url = "https://blobs/ann.png".into();

        absorb_profile(&mut u, &v, u_key, v_key);
        assert_eq!(u.first_name, "Ann");
        assert_eq!(u.last_name, "Lee");
        assert_eq!(u.full_name, "Ann Lee");
        assert_eq!(u.avatar_url, "https://blobs/ann.png");
    }

    #[tokio::test]
    async fn test_cannot_absorb_self() {
        let app = TestApp::new().await;
        let ann = app.registered_user("ann@x.com", "Ann").await;
        let key = ann.key.unwrap();
        let err = app
            .state
            .merge_users(&Context::background(), key, key)
            .await
            .unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::BAD_REQUEST);
    }
}

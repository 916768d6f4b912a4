//! The periodic digest: upcoming events and unread messages, one e-mail per
//! user, after which the included messages count as read.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use convo_shared::constants::{DIGEST_UPCOMING_FROM_HOURS, DIGEST_UPCOMING_TO_HOURS};
use convo_shared::Key;
use convo_store::{Context, Event, Message, Named, Readable, User, UserPartial};

use super::worker::{display_name, mail_message, recipient, Channel};
use crate::error::{alarm, OpExt, ServerError};
use crate::render::{self, DigestSection};
use crate::state::AppState;

/// Unread tail of one thread or event.
#[derive(Debug, Clone)]
pub struct DigestItem {
    pub parent: Key,
    pub name: String,
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DigestReport {
    pub users: usize,
    pub sent: usize,
}

fn names(partials: &[UserPartial]) -> HashMap<Key, String> {
    partials.iter().map(|p| (p.id, display_name(p))).collect()
}

impl AppState {
    /// Run the digest for every subscribed user. One user's failure is
    /// logged and the sweep goes on.
    pub async fn run_digest(&self, ctx: &Context, now: DateTime<Utc>) -> Result<DigestReport, ServerError> {
        let users = self.ds.all_users(ctx).await.op("digest.users")?;
        let mut report = DigestReport::default();
        for user in users.iter().filter(|u| u.send_digest && !u.locked) {
            ctx.check()?;
            report.users += 1;
            match self.send_digest(ctx, user, now).await {
                Ok(true) => report.sent += 1,
                Ok(false) => {}
                Err(e) => alarm("digest.user", &format!("{}: {e}", user.email)),
            }
        }
        tracing::info!(users = report.users, sent = report.sent, "digest sweep done");
        Ok(report)
    }

    /// Returns whether a digest went out.
    async fn send_digest(&self, ctx: &Context, user: &User, now: DateTime<Utc>) -> Result<bool, ServerError> {
        let key = user.key.ok_or_else(ServerError::not_found)?;
        let threads = self.ds.threads_for_user(ctx, key).await?;
        let events = self.ds.events_for_user(ctx, key).await?;

        let from = now + Duration::hours(DIGEST_UPCOMING_FROM_HOURS);
        let to = now + Duration::hours(DIGEST_UPCOMING_TO_HOURS);
        let mut upcoming: Vec<&Event> = events
            .iter()
            .filter(|e| e.timestamp >= from && e.timestamp <= to)
            .collect();
        upcoming.sort_by_key(|e| e.timestamp);

        let mut items: Vec<(DigestItem, HashMap<Key, String>)> = Vec::new();
        let unread = threads
            .iter()
            .filter(|t| !t.is_read(key))
            .map(|t| (t.key, t.name(), &t.user_partials))
            .chain(
                events
                    .iter()
                    .filter(|e| !e.is_read(key))
                    .map(|e| (e.key, e.name(), &e.user_partials)),
            );
        for (parent, name, partials) in unread {
            let Some(parent) = parent else { continue };
            let messages: Vec<Message> = self
                .ds
                .messages_for_parent(ctx, parent)
                .await?
                .into_iter()
                .filter(|m| !m.is_read(key))
                .collect();
            if messages.is_empty() {
                continue;
            }
            items.push((DigestItem { parent, name, messages }, names(partials)));
        }

        if upcoming.is_empty() && items.is_empty() {
            return Ok(false);
        }

        let sections: Vec<DigestSection> = items
            .iter()
            .map(|(item, names)| DigestSection {
                name: item.name.clone(),
                messages: item.messages.iter().map(|m| mail_message(m, names)).collect(),
            })
            .collect();
        let rendered = render::digest(
            &user.first_name,
            &upcoming,
            &sections,
            &self.unsubscribe_url(user, Channel::Digest),
        );
        self.send_system_mail(recipient(user), rendered)
            .await
            .op("digest.send")?;

        let included: Vec<Key> = items
            .iter()
            .flat_map(|(item, _)| item.messages.iter().filter_map(|m| m.key))
            .collect();
        if !included.is_empty() {
            let included = &included;
            self.ds
                .run_in_transaction(ctx, |ctx| async move {
                    let mut marked = Vec::with_capacity(included.len());
                    for message in included {
                        if let Some(mut message) = self.ds.get_in_tx::<Message>(&ctx, *message).await? {
                            message.mark_read(key, now);
                            marked.push(message);
                        }
                    }
                    self.ds.put_multi(&ctx, &mut marked).await?;
                    Ok::<_, ServerError>(())
                })
                .await
                .op(format!("digest.mark_read(user={key})"))?;
        }
        tracing::debug!(user = %key, items = items.len(), upcoming = upcoming.len(), "digest sent");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::events::NewEvent;
    use crate::state::testing::TestApp;
    use convo_store::Thread;

    #[tokio::test]
    async fn test_digest_collects_unread_once() {
        let app = TestApp::new().await;
        let ctx = Context::background();
        let ann = app.registered_user("ann@x.com", "Ann").await;
        let bob = app.registered_user("bob@x.com", "Bob").await;
        let mut thread = Thread::new(&ann, "Plans").unwrap();
        thread.add_user(&bob).unwrap();
        let key = app.state.ds.put(&ctx, &mut thread).await.unwrap();
        app.state
            .post_message::<Thread>(&ctx, &bob, key, "Lunch tomorrow?", None)
            .await
            .unwrap();

        let report = app.state.run_digest(&ctx, Utc::now()).await.unwrap();
        assert_eq!(report, DigestReport { users: 2, sent: 1 });
        let sent = app.mailbox.sent_to("ann@x.com").await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, "Your Convo digest");
        assert!(sent[0].text.contains("Lunch tomorrow?"));
        assert!(sent[0].text.contains("Plans"));
        assert!(app.mailbox.sent_to("bob@x.com").await.is_empty());

        let messages = app.state.ds.messages_for_parent(&ctx, key).await.unwrap();
        assert!(messages[0].is_read(ann.key.unwrap()));

        let report = app.state.run_digest(&ctx, Utc::now()).await.unwrap();
        assert_eq!(report.sent, 0);
    }

    #[tokio::test]
    async fn test_digest_lists_upcoming_events() {
        let app = TestApp::new().await;
        let ctx = Context::background();
        let ann = app.registered_user("ann@x.com", "Ann").await;
        let now = Utc::now();
        for (name, hours) in [("Soon", 12), ("Later", 72)] {
            app.state
                .create_event(
                    &ctx,
                    &ann,
                    &NewEvent {
                        name: name.into(),
                        description: String::new(),
                        timestamp: now + Duration::hours(hours),
                        place_id: String::new(),
                        users: Vec::new(),
                        guests_can_invite: false,
                    },
                )
                .await
                .unwrap();
        }

        app.state.run_digest(&ctx, now).await.unwrap();
        let sent = app.mailbox.sent_to("ann@x.com").await;
        assert_eq!(sent.len(), 1);
        assert!(sent[0].text.contains("Soon"));
        assert!(!sent[0].text.contains("Later"));
    }

    #[tokio::test]
    async fn test_unsubscribed_users_are_skipped() {
        let app = TestApp::new().await;
        let ctx = Context::background();
        let mut ann = app.registered_user("ann@x.com", "Ann").await;
        ann.send_digest = false;
        app.state.commit_user(&ctx, &mut ann).await.unwrap();

        let report = app.state.run_digest(&ctx, Utc::now()).await.unwrap();
        assert_eq!(report, DigestReport::default());
    }
}

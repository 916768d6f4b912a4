//! What threads and events have in common: participant-gated loads, the read
//! walk, and the contact bookkeeping when people are brought together.

use chrono::{DateTime, Utc};
use convo_shared::constants::READ_WALK_LIMIT;
use convo_shared::Key;
use convo_store::{Context, Entity, Event, Message, Named, Readable, Thread, User};

use crate::error::ServerError;
use crate::state::AppState;

/// A thread or an event: the unit of membership and permission checks.
pub trait Aggregate: Entity + Readable + Named {
    /// Histogram tag bumped on users who join one.
    const TAG: &'static str;

    fn owner(&self) -> Key;

    fn participants(&self) -> &[Key];

    fn is_participant(&self, user: Key) -> bool {
        self.participants().contains(&user)
    }

    /// Bookkeeping once `message` is stored under this aggregate: the author
    /// has seen everything, nobody else has seen the new message.
    fn on_message(&mut self, message: &Message, now: DateTime<Utc>);

    fn on_message_deleted(&mut self) {}
}

impl Aggregate for Thread {
    const TAG: &'static str = "thread";

    fn owner(&self) -> Key {
        self.owner
    }

    fn participants(&self) -> &[Key] {
        &self.users
    }

    /// The first message anchors the thread and becomes its preview. The
    /// first reply names an unnamed-by-link thread after its link title.
    fn on_message(&mut self, message: &Message, now: DateTime<Utc>) {
        self.response_count += 1;
        if self.response_count == 1 {
            self.preview = Some(message.preview());
        } else if self.response_count == 2 {
            if let Some(link) = &message.link {
                let title: String = link
                    .title
                    .trim()
                    .chars()
                    .take(convo_shared::constants::SUBJECT_MAX_LEN)
                    .collect();
                if !title.is_empty() && self.set_subject(&title).is_ok() {
                    tracing::debug!(thread = ?self.key, "subject taken from link title");
                }
            }
        }
        self.updated_at = now;
        self.clear_reads_except(message.author);
        self.mark_read(message.author, now);
    }

    fn on_message_deleted(&mut self) {
        self.response_count = (self.response_count - 1).max(0);
    }
}

impl Aggregate for Event {
    const TAG: &'static str = "event";

    fn owner(&self) -> Key {
        self.owner
    }

    fn participants(&self) -> &[Key] {
        &self.users
    }

    fn on_message(&mut self, message: &Message, now: DateTime<Utc>) {
        self.updated_at = now;
        self.clear_reads_except(message.author);
        self.mark_read(message.author, now);
    }
}

impl AppState {
    /// Load an aggregate through the open transaction, if any.
    pub(crate) async fn load_aggregate<A: Aggregate>(
        &self,
        ctx: &Context,
        key: Key,
    ) -> Result<A, ServerError> {
        self.ds
            .get_in_tx::<A>(ctx, key)
            .await?
            .ok_or_else(ServerError::not_found)
    }

    /// Load an aggregate `user` takes part in. Anyone else gets not-found.
    pub(crate) async fn load_member<A: Aggregate>(
        &self,
        ctx: &Context,
        key: Key,
        user: Key,
    ) -> Result<A, ServerError> {
        let aggregate: A = self.load_aggregate(ctx, key).await?;
        if !aggregate.is_participant(user) {
            return Err(ServerError::not_found());
        }
        Ok(aggregate)
    }

    /// `actor` brought `joined` into an aggregate tagged `tag`: each side
    /// becomes a contact of the other and the newcomers' tag counts grow.
    /// Writes join the caller's transaction.
    pub(crate) async fn introduce(
        &self,
        ctx: &Context,
        actor: Key,
        joined: &[Key],
        tag: &str,
    ) -> Result<(), ServerError> {
        let Some(mut inviter) = self.ds.get_in_tx::<User>(ctx, actor).await? else {
            return Ok(());
        };
        let mut touched: Vec<User> = Vec::with_capacity(joined.len() + 1);
        for key in joined {
            if *key == actor || touched.iter().any(|u| u.key == Some(*key)) {
                continue;
            }
            let Some(mut user) = self.ds.get_in_tx::<User>(ctx, *key).await? else {
                continue;
            };
            user.add_contact(actor);
            user.bump_tag(tag);
            inviter.add_contact(*key);
            touched.push(user);
        }
        if touched.is_empty() {
            return Ok(());
        }
        touched.push(inviter);
        self.ds.put_multi(ctx, &mut touched).await?;
        Ok(())
    }

    /// Mark `key` read by `actor`, along with up to [`READ_WALK_LIMIT`] of
    /// its newest messages, in one transaction.
    pub async fn mark_read<A: Aggregate>(
        &self,
        ctx: &Context,
        actor: &User,
        key: Key,
    ) -> Result<A, ServerError> {
        let user = actor.key.ok_or_else(ServerError::unauthorized)?;
        let now = Utc::now();
        self.ds
            .run_in_transaction(ctx, |ctx| async move {
                let mut aggregate: A = self.load_member(&ctx, key, user).await?;
                aggregate.mark_read(user, now);
                self.ds.put(&ctx, &mut aggregate).await?;

                let mut unread: Vec<Message> = self
                    .ds
                    .recent_messages(&ctx, key, READ_WALK_LIMIT)
                    .await?
                    .into_iter()
                    .filter(|m| !m.is_read(user))
                    .collect();
                for message in &mut unread {
                    message.mark_read(user, now);
                }
                self.ds.put_multi(&ctx, &mut unread).await?;
                Ok::<_, ServerError>(aggregate)
            })
            .await
    }
}

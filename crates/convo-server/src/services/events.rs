//! Events: scheduled gatherings with RSVPs, hosts and shareable invite links.
//!
//! An event is mutable only while it lies in the future. Past events accept
//! nothing but deletion.

use chrono::{DateTime, Utc};
use convo_shared::magic::{invite_salt, rsvp_salt, Action, MagicLink};
use convo_shared::{Key, Kind};
use convo_store::{Context, Event, Message, Named, Readable, User};
use serde::Deserialize;

use super::identity::UserRef;
use super::membership::Aggregate;
use crate::clients::{Place, Verb};
use crate::error::{alarm, OpExt, ServerError};
use crate::state::AppState;

#[derive(Debug, Clone, Deserialize)]
pub struct NewEvent {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub place_id: String,
    #[serde(default)]
    pub users: Vec<UserRef>,
    #[serde(default)]
    pub guests_can_invite: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct EventUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub place_id: Option<String>,
    #[serde(default)]
    pub guests_can_invite: Option<bool>,
    /// External user IDs; every host must already be a participant.
    #[serde(default)]
    pub hosts: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Cancellation {
    #[serde(default)]
    pub message: String,
}

/// The signed part of a link, as a client posts it back.
#[derive(Debug, Clone, Deserialize)]
pub struct LinkParts {
    pub timestamp: String,
    pub signature: String,
}

/// An RSVP link followed from an invitation e-mail.
#[derive(Debug, Clone, Deserialize)]
pub struct MagicRsvp {
    pub user: String,
    pub event: String,
    pub timestamp: String,
    pub signature: String,
}

fn apply_place(event: &mut Event, place_id: &str, place: Option<Place>) {
    event.place_id = place_id.trim().to_string();
    let place = place.unwrap_or_default();
    event.address = place.address;
    event.lat = place.lat;
    event.lng = place.lng;
    event.utc_offset = place.utc_offset;
}

impl AppState {
    /// Place details for `place_id`. A lookup failure leaves the event without
    /// an address rather than failing the request.
    async fn resolve_place(&self, place_id: &str) -> Option<Place> {
        let place_id = place_id.trim();
        if place_id.is_empty() {
            return None;
        }
        match self.clients.places.details(place_id).await {
            Ok(place) => Some(place),
            Err(e) => {
                alarm("events.place_details", &e);
                None
            }
        }
    }

    pub async fn create_event(
        &self,
        ctx: &Context,
        actor: &User,
        input: &NewEvent,
    ) -> Result<Event, ServerError> {
        let owner = actor.key.ok_or_else(ServerError::unauthorized)?;
        if !actor.registered {
            return Err(ServerError::bad_request("Finish signing up before creating an event"));
        }
        if input.name.trim().is_empty() {
            return Err(ServerError::invalid("name", "Give the event a name"));
        }
        let now = Utc::now();
        let mut template = Event::new(actor, &input.name, input.timestamp, now)?;
        template.description = input.description.trim().to_string();
        template.guests_can_invite = input.guests_can_invite;
        let place = self.resolve_place(&input.place_id).await;
        apply_place(&mut template, &input.place_id, place);

        let key = self
            .ds
            .allocate(ctx, Kind::Event, 1)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ServerError::Internal("no key allocated".into()))?;

        let template = &template;
        let (event, created) = self
            .ds
            .run_in_transaction(ctx, |ctx| async move {
                let mut event = template.clone();
                event.key = Some(key);
                let resolved = self.get_or_create_users(&ctx, &input.users).await?;
                let mut joined = Vec::with_capacity(resolved.users.len());
                for user in &resolved.users {
                    if user.key != Some(owner) {
                        joined.push(event.add_user(user)?);
                    }
                }
                event.mark_read(owner, now);
                self.ds.put(&ctx, &mut event).await?;
                self.introduce(&ctx, owner, &joined, Event::TAG).await?;
                Ok::<_, ServerError>((event, resolved.created))
            })
            .await
            .op("events.create")?;

        tracing::info!(event = %key, users = event.users.len(), "event created");
        self.enqueue_welcome(ctx, &created).await;
        self.enqueue_invites(ctx, key, &[], false).await;
        self.push(ctx, actor, &event.users, Verb::NewEvent, key, &event.name());
        Ok(event)
    }

    pub async fn get_event(&self, ctx: &Context, actor: &User, key: Key) -> Result<Event, ServerError> {
        let user = actor.key.ok_or_else(ServerError::unauthorized)?;
        self.load_member(ctx, key, user).await
    }

    /// `actor`'s events, soonest first.
    pub async fn list_events(&self, ctx: &Context, actor: &User) -> Result<Vec<Event>, ServerError> {
        let user = actor.key.ok_or_else(ServerError::unauthorized)?;
        Ok(self.ds.events_for_user(ctx, user).await?)
    }

    /// Owner only, and only while the event is in the future.
    pub async fn update_event(
        &self,
        ctx: &Context,
        actor: &User,
        key: Key,
        update: &EventUpdate,
    ) -> Result<Event, ServerError> {
        let user = actor.key.ok_or_else(ServerError::unauthorized)?;
        let hosts = match &update.hosts {
            Some(ids) => Some(
                ids.iter()
                    .map(|id| Key::decode_kind(id, Kind::User))
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            None => None,
        };
        let place = match &update.place_id {
            Some(place_id) => Some(self.resolve_place(place_id).await),
            None => None,
        };

        let (hosts, place) = (&hosts, &place);
        let event = self
            .ds
            .run_in_transaction(ctx, |ctx| async move {
                let now = Utc::now();
                let mut event: Event = self.load_member(&ctx, key, user).await?;
                if !event.owner_is(user) {
                    return Err(ServerError::not_found());
                }
                event.ensure_mutable(now)?;

                if let Some(name) = &update.name {
                    if name.trim().is_empty() {
                        return Err(ServerError::invalid("name", "Give the event a name"));
                    }
                    event.name = name.trim().to_string();
                }
                if let Some(description) = &update.description {
                    event.description = description.trim().to_string();
                }
                if let Some(timestamp) = update.timestamp {
                    event.set_timestamp(timestamp, now)?;
                }
                if let (Some(place_id), Some(place)) = (&update.place_id, place) {
                    apply_place(&mut event, place_id, place.clone());
                }
                if let Some(guests_can_invite) = update.guests_can_invite {
                    event.guests_can_invite = guests_can_invite;
                }
                if let Some(hosts) = hosts {
                    event.set_hosts(hosts)?;
                }
                event.updated_at = now;
                event.clear_reads_except(user);
                event.mark_read(user, now);
                self.ds.put(&ctx, &mut event).await?;
                Ok::<_, ServerError>(event)
            })
            .await
            .op(format!("events.update(event={key})"))?;

        tracing::info!(event = %key, "event updated");
        self.push(ctx, actor, &event.users, Verb::UpdateEvent, key, &event.name());
        self.enqueue_invites(ctx, key, &[], true).await;
        Ok(event)
    }

    /// Owner only. Participants who take event mail hear about it, with the
    /// owner's note; a future event also pushes a cancellation.
    pub async fn delete_event(
        &self,
        ctx: &Context,
        actor: &User,
        key: Key,
        cancellation: &Cancellation,
    ) -> Result<(), ServerError> {
        let user = actor.key.ok_or_else(ServerError::unauthorized)?;
        let event = self
            .ds
            .run_in_transaction(ctx, |ctx| async move {
                let event: Event = self.load_member(&ctx, key, user).await?;
                if !event.owner_is(user) {
                    return Err(ServerError::not_found());
                }
                let messages: Vec<Message> = self.ds.messages_for_parent(&ctx, key).await?;
                let mut keys: Vec<Key> = messages.iter().filter_map(|m| m.key).collect();
                keys.push(key);
                self.ds.delete_multi(&ctx, &keys).await?;
                Ok::<_, ServerError>(event)
            })
            .await
            .op(format!("events.delete(event={key})"))?;

        let was_future = !event.is_past(Utc::now());
        tracing::info!(event = %key, was_future, "event cancelled");
        if ctx.check().is_ok() {
            self.send_cancellation(ctx, actor, &event, &cancellation.message)
                .await;
        }
        if was_future {
            self.push(ctx, actor, &event.users, Verb::DeleteEvent, key, &event.name());
        }
        Ok(())
    }

    /// The owner, hosts and, when allowed, any guest may invite.
    pub async fn add_event_user(
        &self,
        ctx: &Context,
        actor: &User,
        key: Key,
        user_id: &str,
    ) -> Result<Event, ServerError> {
        let inviter = actor.key.ok_or_else(ServerError::unauthorized)?;
        let (event, added) = self
            .ds
            .run_in_transaction(ctx, |ctx| async move {
                let mut event: Event = self.load_member(&ctx, key, inviter).await?;
                if !event.can_invite(inviter) {
                    return Err(ServerError::not_found());
                }
                event.ensure_mutable(Utc::now())?;
                let user = self.user_by_id(&ctx, user_id).await?;
                let added = event.add_user(&user)?;
                event.updated_at = Utc::now();
                self.ds.put(&ctx, &mut event).await?;
                self.introduce(&ctx, inviter, &[added], Event::TAG).await?;
                Ok::<_, ServerError>((event, added))
            })
            .await
            .op(format!("events.add_user(event={key})"))?;

        tracing::info!(event = %key, user = %added, "user added to event");
        self.enqueue_invites(ctx, key, &[added], false).await;
        Ok(event)
    }

    /// The owner removes anyone else; a guest removes themselves.
    pub async fn remove_event_user(
        &self,
        ctx: &Context,
        actor: &User,
        key: Key,
        target: Key,
    ) -> Result<Event, ServerError> {
        let user = actor.key.ok_or_else(ServerError::unauthorized)?;
        let event = self
            .ds
            .run_in_transaction(ctx, |ctx| async move {
                let mut event: Event = self.load_member(&ctx, key, user).await?;
                if !event.owner_is(user) && target != user {
                    return Err(ServerError::not_found());
                }
                event.ensure_mutable(Utc::now())?;
                event.remove_user(target)?;
                self.ds.put(&ctx, &mut event).await?;
                Ok::<_, ServerError>(event)
            })
            .await
            .op(format!("events.remove_user(event={key})"))?;
        tracing::info!(event = %key, user = %target, "user removed from event");
        Ok(event)
    }

    /// Participants other than the owner RSVP. The owner is a bad request,
    /// outsiders get not-found.
    pub async fn rsvp(&self, ctx: &Context, actor: &User, key: Key) -> Result<Event, ServerError> {
        let user = actor.key.ok_or_else(ServerError::unauthorized)?;
        let (event, changed) = self
            .ds
            .run_in_transaction(ctx, |ctx| async move {
                let mut event: Event = self.load_member(&ctx, key, user).await?;
                event.ensure_mutable(Utc::now())?;
                let changed = event.add_rsvp(user)?;
                if changed {
                    self.ds.put(&ctx, &mut event).await?;
                }
                Ok::<_, ServerError>((event, changed))
            })
            .await
            .op(format!("events.rsvp(event={key})"))?;

        if changed {
            tracing::info!(event = %key, user = %user, "rsvp added");
            self.push(ctx, actor, &event.users, Verb::AddRsvp, key, &event.name());
        }
        Ok(event)
    }

    pub async fn remove_rsvp(&self, ctx: &Context, actor: &User, key: Key) -> Result<Event, ServerError> {
        let user = actor.key.ok_or_else(ServerError::unauthorized)?;
        let (event, changed) = self
            .ds
            .run_in_transaction(ctx, |ctx| async move {
                let mut event: Event = self.load_member(&ctx, key, user).await?;
                event.ensure_mutable(Utc::now())?;
                let changed = event.remove_rsvp(user)?;
                if changed {
                    self.ds.put(&ctx, &mut event).await?;
                }
                Ok::<_, ServerError>((event, changed))
            })
            .await
            .op(format!("events.remove_rsvp(event={key})"))?;

        if changed {
            tracing::info!(event = %key, user = %user, "rsvp withdrawn");
            self.push(ctx, actor, &event.users, Verb::RemoveRsvp, key, &event.name());
        }
        Ok(event)
    }

    /// RSVP through the signed link in an invitation. Following the link
    /// proves the invitee reads the address, so it is marked verified.
    pub async fn magic_rsvp(&self, ctx: &Context, input: &MagicRsvp) -> Result<(User, Event), ServerError> {
        let event_key = Key::decode_kind(&input.event, Kind::Event)?;
        let user_key = Key::decode_kind(&input.user, Kind::User)?;

        let (user, event, changed) = self
            .ds
            .run_in_transaction(ctx, |ctx| async move {
                let now = Utc::now();
                let mut event: Event = self.load_aggregate(&ctx, event_key).await?;
                let mut user = self
                    .ds
                    .get_in_tx::<User>(&ctx, user_key)
                    .await?
                    .ok_or_else(ServerError::not_found)?;
                self.signer.verify(
                    &user_key.encode(),
                    &input.timestamp,
                    &rsvp_salt(&event.invite_token, event.is_past(now)),
                    &input.signature,
                )?;
                event.ensure_mutable(now)?;

                if !user.verified {
                    let email = user.email.clone();
                    user.add_email(&email);
                    self.commit_user(&ctx, &mut user).await?;
                }
                let changed = event.add_rsvp(user_key)?;
                if changed {
                    self.ds.put(&ctx, &mut event).await?;
                }
                Ok::<_, ServerError>((user, event, changed))
            })
            .await
            .op(format!("events.magic_rsvp(event={event_key})"))?;

        if changed {
            tracing::info!(event = %event_key, user = %user_key, "rsvp added by link");
            self.push(ctx, &user, &event.users, Verb::AddRsvp, event_key, &event.name());
        }
        Ok((user, event))
    }

    pub fn invite_link_for(&self, event: &Event) -> Result<MagicLink, ServerError> {
        let key = event.key.ok_or_else(ServerError::not_found)?;
        Ok(self
            .signer
            .mint(Action::Invite, &key.encode(), &invite_salt(&event.invite_token)))
    }

    /// The shareable invite link. Owner and hosts only.
    pub async fn invite_link(&self, ctx: &Context, actor: &User, key: Key) -> Result<MagicLink, ServerError> {
        let user = actor.key.ok_or_else(ServerError::unauthorized)?;
        let event: Event = self.load_member(ctx, key, user).await?;
        if !event.owner_is(user) && !event.has_host(user) {
            return Err(ServerError::not_found());
        }
        self.invite_link_for(&event)
    }

    /// Rotate the invite token, killing every outstanding invite and RSVP
    /// link, and return the new invite link. Owner only.
    pub async fn roll_invite(&self, ctx: &Context, actor: &User, key: Key) -> Result<MagicLink, ServerError> {
        let user = actor.key.ok_or_else(ServerError::unauthorized)?;
        let event = self
            .ds
            .run_in_transaction(ctx, |ctx| async move {
                let mut event: Event = self.load_member(&ctx, key, user).await?;
                event.roll_invite_token(user)?;
                self.ds.put(&ctx, &mut event).await?;
                Ok::<_, ServerError>(event)
            })
            .await
            .op(format!("events.roll_invite(event={key})"))?;
        tracing::info!(event = %key, "invite token rolled");
        self.invite_link_for(&event)
    }

    /// Join an event through its shareable link.
    pub async fn join_by_invite(
        &self,
        ctx: &Context,
        actor: &User,
        key: Key,
        link: &LinkParts,
    ) -> Result<Event, ServerError> {
        let user = actor.key.ok_or_else(ServerError::unauthorized)?;
        let (event, joined) = self
            .ds
            .run_in_transaction(ctx, |ctx| async move {
                let mut event: Event = self.load_aggregate(&ctx, key).await?;
                self.signer.verify(
                    &key.encode(),
                    &link.timestamp,
                    &invite_salt(&event.invite_token),
                    &link.signature,
                )?;
                if event.has_user(user) {
                    return Ok((event, false));
                }
                event.ensure_mutable(Utc::now())?;
                event.add_user(actor)?;
                self.ds.put(&ctx, &mut event).await?;
                self.introduce(&ctx, event.owner, &[user], Event::TAG).await?;
                Ok::<_, ServerError>((event, true))
            })
            .await
            .op(format!("events.join(event={key})"))?;
        if joined {
            tracing::info!(event = %key, user = %user, "joined by invite link");
        }
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::testing::TestApp;
    use axum::http::StatusCode;
    use chrono::Duration;

    fn new_event(users: Vec<UserRef>) -> NewEvent {
        NewEvent {
            name: "Dinner".into(),
            description: "At mine".into(),
            timestamp: Utc::now() + Duration::days(3),
            place_id: "place-1".into(),
            users,
            guests_can_invite: false,
        }
    }

    #[tokio::test]
    async fn test_create_resolves_place_and_users() {
        let app = TestApp::new().await;
        let ctx = Context::background();
        let ann = app.registered_user("ann@x.com", "Ann").await;
        let bob = app.registered_user("bob@x.com", "Bob").await;

        let event = app
            .state
            .create_event(
                &ctx,
                &ann,
                &new_event(vec![UserRef::id(bob.key.unwrap().encode()), UserRef::email("new@x.com")]),
            )
            .await
            .unwrap();
        assert_eq!(event.users.len(), 3);
        assert_eq!(event.address, "1 Main St");
        assert_eq!(event.utc_offset, -300);
        let bob: User = app.state.ds.get(&ctx, bob.key.unwrap()).await.unwrap();
        assert_eq!(bob.tags.get("event"), Some(&1));
    }

    #[tokio::test]
    async fn test_past_events_rejected() {
        let app = TestApp::new().await;
        let ctx = Context::background();
        let ann = app.registered_user("ann@x.com", "Ann").await;

        let mut input = new_event(vec![]);
        input.timestamp = Utc::now() - Duration::minutes(1);
        let err = app.state.create_event(&ctx, &ann, &input).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let event = app.state.create_event(&ctx, &ann, &new_event(vec![])).await.unwrap();
        let mut stored = event.clone();
        stored.timestamp = Utc::now() - Duration::hours(1);
        app.state.ds.put(&ctx, &mut stored).await.unwrap();

        let update = EventUpdate {
            name: Some("Later".into()),
            ..EventUpdate::default()
        };
        let err = app
            .state
            .update_event(&ctx, &ann, event.key.unwrap(), &update)
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        // deletion still works
        app.state
            .delete_event(&ctx, &ann, event.key.unwrap(), &Cancellation::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_rsvp_rules() {
        let app = TestApp::new().await;
        let ctx = Context::background();
        let ann = app.registered_user("ann@x.com", "Ann").await;
        let bob = app.registered_user("bob@x.com", "Bob").await;
        let eve = app.registered_user("eve@x.com", "Eve").await;
        let event = app
            .state
            .create_event(&ctx, &ann, &new_event(vec![UserRef::id(bob.key.unwrap().encode())]))
            .await
            .unwrap();
        let key = event.key.unwrap();

        let err = app.state.rsvp(&ctx, &ann, key).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        let err = app.state.rsvp(&ctx, &eve, key).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);

        let _: Event = app.state.mark_read(&ctx, &ann, key).await.unwrap();
        let event = app.state.rsvp(&ctx, &bob, key).await.unwrap();
        assert_eq!(event.rsvps, vec![bob.key.unwrap()]);
        assert!(event.reads.is_empty());

        let _: Event = app.state.mark_read(&ctx, &ann, key).await.unwrap();
        let event = app.state.remove_rsvp(&ctx, &bob, key).await.unwrap();
        assert!(event.rsvps.is_empty());
        assert!(event.is_read(ann.key.unwrap()));
    }

    #[tokio::test]
    async fn test_magic_rsvp_verifies_shell() {
        let app = TestApp::new().await;
        let ctx = Context::background();
        let ann = app.registered_user("ann@x.com", "Ann").await;
        let event = app
            .state
            .create_event(&ctx, &ann, &new_event(vec![UserRef::email("new@x.com")]))
            .await
            .unwrap();
        let shell = app.state.user_by_email(&ctx, "new@x.com").await.unwrap().unwrap();
        let shell_id = shell.key.unwrap().encode();

        let link = app.state.signer.mint(
            Action::Rsvp,
            &shell_id,
            &rsvp_salt(&event.invite_token, false),
        );
        let mut input = MagicRsvp {
            user: shell_id.clone(),
            event: event.key.unwrap().encode(),
            timestamp: link.timestamp.clone(),
            signature: "00".repeat(32),
        };
        let err = app.state.magic_rsvp(&ctx, &input).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);

        input.signature = link.signature.clone();
        let (user, event) = app.state.magic_rsvp(&ctx, &input).await.unwrap();
        assert!(user.verified);
        assert_eq!(event.rsvps, vec![shell.key.unwrap()]);
    }

    #[tokio::test]
    async fn test_roll_invite_kills_old_link() {
        let app = TestApp::new().await;
        let ctx = Context::background();
        let ann = app.registered_user("ann@x.com", "Ann").await;
        let bob = app.registered_user("bob@x.com", "Bob").await;
        let cat = app.registered_user("cat@x.com", "Cat").await;
        let event = app
            .state
            .create_event(&ctx, &ann, &new_event(vec![UserRef::id(bob.key.unwrap().encode())]))
            .await
            .unwrap();
        let key = event.key.unwrap();

        let err = app.state.invite_link(&ctx, &bob, key).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        let err = app.state.roll_invite(&ctx, &bob, key).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);

        let first = app.state.invite_link(&ctx, &ann, key).await.unwrap();
        let second = app.state.roll_invite(&ctx, &ann, key).await.unwrap();
        assert_ne!(first.signature, second.signature);

        let stale = LinkParts {
            timestamp: first.timestamp,
            signature: first.signature,
        };
        let err = app.state.join_by_invite(&ctx, &cat, key, &stale).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);

        let fresh = LinkParts {
            timestamp: second.timestamp,
            signature: second.signature,
        };
        let event = app.state.join_by_invite(&ctx, &cat, key, &fresh).await.unwrap();
        assert!(event.has_user(cat.key.unwrap()));
    }

    #[tokio::test]
    async fn test_hosts_and_guest_invites() {
        let app = TestApp::new().await;
        let ctx = Context::background();
        let ann = app.registered_user("ann@x.com", "Ann").await;
        let bob = app.registered_user("bob@x.com", "Bob").await;
        let cat = app.registered_user("cat@x.com", "Cat").await;
        let event = app
            .state
            .create_event(&ctx, &ann, &new_event(vec![UserRef::id(bob.key.unwrap().encode())]))
            .await
            .unwrap();
        let key = event.key.unwrap();
        let cat_id = cat.key.unwrap().encode();

        let err = app.state.add_event_user(&ctx, &bob, key, &cat_id).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);

        let update = EventUpdate {
            hosts: Some(vec![bob.key.unwrap().encode()]),
            ..EventUpdate::default()
        };
        app.state.update_event(&ctx, &ann, key, &update).await.unwrap();
        let event = app.state.add_event_user(&ctx, &bob, key, &cat_id).await.unwrap();
        assert!(event.has_user(cat.key.unwrap()));

        let update = EventUpdate {
            hosts: Some(vec![Key::new(Kind::User, 999_999).encode()]),
            ..EventUpdate::default()
        };
        let err = app.state.update_event(&ctx, &ann, key, &update).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }
}

//! JSON shapes of the HTTP API. Keys are external IDs; participants are
//! rendered from the denormalized partials so no user is loaded per view.

use chrono::{DateTime, Utc};
use convo_shared::magic::MagicLink;
use convo_shared::Key;
use convo_store::{Event, Link, Message, Preview, Read, Thread, User, UserPartial};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct PartialView {
    pub id: Key,
    pub first_name: String,
    pub last_name: String,
    pub full_name: String,
    pub avatar_url: String,
}

impl PartialView {
    fn of(partial: &UserPartial) -> Self {
        Self {
            id: partial.id,
            first_name: partial.first_name.clone(),
            last_name: partial.last_name.clone(),
            full_name: partial.full_name.clone(),
            avatar_url: partial.avatar_url.clone(),
        }
    }

    fn bare(id: Key) -> Self {
        Self {
            id,
            first_name: String::new(),
            last_name: String::new(),
            full_name: String::new(),
            avatar_url: String::new(),
        }
    }
}

fn partials_for(keys: &[Key], partials: &[UserPartial]) -> Vec<PartialView> {
    keys.iter()
        .map(|key| match partials.iter().find(|p| p.id == *key) {
            Some(partial) => PartialView::of(partial),
            None => PartialView::bare(*key),
        })
        .collect()
}

fn partial_for(key: Key, partials: &[UserPartial]) -> PartialView {
    partials_for(&[key], partials)
        .pop()
        .unwrap_or_else(|| PartialView::bare(key))
}

#[derive(Debug, Serialize)]
pub struct ReadView {
    pub id: Key,
    pub time: DateTime<Utc>,
}

fn reads(reads: &[Read]) -> Vec<ReadView> {
    reads
        .iter()
        .map(|r| ReadView {
            id: r.user,
            time: r.time,
        })
        .collect()
}

/// What anyone may see of a user.
#[derive(Debug, Serialize)]
pub struct UserView {
    pub id: Option<Key>,
    pub first_name: String,
    pub last_name: String,
    pub full_name: String,
    pub avatar_url: String,
    pub registered: bool,
}

impl From<&User> for UserView {
    fn from(user: &User) -> Self {
        Self {
            id: user.key,
            first_name: user.first_name.clone(),
            last_name: user.last_name.clone(),
            full_name: user.full_name.clone(),
            avatar_url: user.avatar_url.clone(),
            registered: user.registered,
        }
    }
}

/// The signed-in user's own record, credentials included.
#[derive(Debug, Serialize)]
pub struct SelfView {
    pub id: Option<Key>,
    pub email: String,
    pub emails: Vec<String>,
    pub first_name: String,
    pub last_name: String,
    pub full_name: String,
    pub avatar_url: String,
    pub token: String,
    pub realtime_token: String,
    pub verified: bool,
    pub registered: bool,
    pub has_password: bool,
    pub google_linked: bool,
    pub facebook_linked: bool,
    pub send_digest: bool,
    pub send_threads: bool,
    pub send_events: bool,
    pub contacts: Vec<Key>,
    pub created_at: DateTime<Utc>,
}

impl From<&User> for SelfView {
    fn from(user: &User) -> Self {
        Self {
            id: user.key,
            email: user.email.clone(),
            emails: user.emails.clone(),
            first_name: user.first_name.clone(),
            last_name: user.last_name.clone(),
            full_name: user.full_name.clone(),
            avatar_url: user.avatar_url.clone(),
            token: user.token.clone(),
            realtime_token: user.realtime_token.clone(),
            verified: user.verified,
            registered: user.registered,
            has_password: user.password.is_some(),
            google_linked: user.google_id.is_some(),
            facebook_linked: user.facebook_id.is_some(),
            send_digest: user.send_digest,
            send_threads: user.send_threads,
            send_events: user.send_events,
            contacts: user.contacts.clone(),
            created_at: user.created_at,
        }
    }
}

/// Subscription state after an unsubscribe link is followed.
#[derive(Debug, Serialize)]
pub struct SubscriptionView {
    pub send_digest: bool,
    pub send_threads: bool,
    pub send_events: bool,
}

impl From<&User> for SubscriptionView {
    fn from(user: &User) -> Self {
        Self {
            send_digest: user.send_digest,
            send_threads: user.send_threads,
            send_events: user.send_events,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ThreadView {
    pub id: Option<Key>,
    pub owner: PartialView,
    pub users: Vec<PartialView>,
    pub subject: String,
    pub preview: Option<Preview>,
    pub response_count: i64,
    pub reads: Vec<ReadView>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Thread> for ThreadView {
    fn from(thread: &Thread) -> Self {
        Self {
            id: thread.key,
            owner: partial_for(thread.owner, &thread.user_partials),
            users: partials_for(&thread.users, &thread.user_partials),
            subject: thread.subject.clone(),
            preview: thread.preview.clone(),
            response_count: thread.response_count,
            reads: reads(&thread.reads),
            created_at: thread.created_at,
            updated_at: thread.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct EventView {
    pub id: Option<Key>,
    pub owner: PartialView,
    pub hosts: Vec<PartialView>,
    pub users: Vec<PartialView>,
    pub rsvps: Vec<PartialView>,
    pub name: String,
    pub description: String,
    pub timestamp: DateTime<Utc>,
    pub place_id: String,
    pub address: String,
    pub lat: f64,
    pub lng: f64,
    pub utc_offset: i32,
    pub guests_can_invite: bool,
    pub past: bool,
    pub reads: Vec<ReadView>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Event> for EventView {
    fn from(event: &Event) -> Self {
        Self {
            id: event.key,
            owner: partial_for(event.owner, &event.user_partials),
            hosts: partials_for(&event.hosts, &event.user_partials),
            users: partials_for(&event.users, &event.user_partials),
            rsvps: partials_for(&event.rsvps, &event.user_partials),
            name: event.name.clone(),
            description: event.description.clone(),
            timestamp: event.timestamp,
            place_id: event.place_id.clone(),
            address: event.address.clone(),
            lat: event.lat,
            lng: event.lng,
            utc_offset: event.utc_offset,
            guests_can_invite: event.guests_can_invite,
            past: event.is_past(Utc::now()),
            reads: reads(&event.reads),
            created_at: event.created_at,
            updated_at: event.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MessageView {
    pub id: Option<Key>,
    pub parent: Key,
    pub author: Key,
    pub body: String,
    pub photos: Vec<String>,
    pub link: Option<Link>,
    pub reads: Vec<ReadView>,
    pub created_at: DateTime<Utc>,
}

impl From<&Message> for MessageView {
    fn from(message: &Message) -> Self {
        Self {
            id: message.key,
            parent: message.parent,
            author: message.author,
            body: message.body.clone(),
            photos: message.photos.clone(),
            link: message.link.clone(),
            reads: reads(&message.reads),
            created_at: message.created_at,
        }
    }
}

/// A shareable link with the parts a client posts back.
#[derive(Debug, Serialize)]
pub struct LinkView {
    pub url: String,
    pub subject: String,
    pub timestamp: String,
    pub signature: String,
}

impl LinkView {
    pub fn new(link: &MagicLink, host: &str) -> Self {
        Self {
            url: link.url(host),
            subject: link.subject.clone(),
            timestamp: link.timestamp.clone(),
            signature: link.signature.clone(),
        }
    }
}

pub fn many<'a, T: 'a, V: From<&'a T>>(items: &'a [T]) -> Vec<V> {
    items.iter().map(V::from).collect()
}

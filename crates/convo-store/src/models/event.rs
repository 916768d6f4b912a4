use chrono::{DateTime, Utc};
use convo_shared::constants::EVENT_USER_LIMIT;
use convo_shared::crypto::random_token;
use convo_shared::{Key, Kind};
use serde::{Deserialize, Serialize};

use super::members::{self, replace_key, UserPartial};
use super::{MembershipError, Named, Read, Readable, User};
use crate::entity::{index_keys, lenient, Entity};

/// Where an event is in its life.
///
/// `Draft` events have not been saved; only `Committed` events accept
/// updates; `Past` events can only be deleted. `Cancelled` is never stored:
/// it names the deletion fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventState {
    Draft,
    Committed,
    Past,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(skip)]
    pub key: Option<Key>,
    pub owner: Key,
    #[serde(default)]
    pub hosts: Vec<Key>,
    /// Participants, owner included.
    pub users: Vec<Key>,
    #[serde(default)]
    pub user_partials: Vec<UserPartial>,
    #[serde(default)]
    pub rsvps: Vec<Key>,
    pub invite_token: String,

    #[serde(default)]
    pub place_id: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub lat: f64,
    #[serde(default)]
    pub lng: f64,
    /// Minutes east of UTC at the venue.
    #[serde(default)]
    pub utc_offset: i32,

    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub timestamp: DateTime<Utc>,

    #[serde(default)]
    pub reads: Vec<Read>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(default, alias = "GuestsCanInvite", deserialize_with = "lenient")]
    pub guests_can_invite: bool,
}

impl Event {
    pub fn new(
        owner: &User,
        name: &str,
        timestamp: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Self, MembershipError> {
        let partial = UserPartial::of(owner)?;
        let mut event = Self {
            key: None,
            owner: partial.id,
            hosts: Vec::new(),
            users: vec![partial.id],
            user_partials: vec![partial],
            rsvps: Vec::new(),
            invite_token: random_token(),
            place_id: String::new(),
            address: String::new(),
            lat: 0.0,
            lng: 0.0,
            utc_offset: 0,
            name: name.trim().to_string(),
            description: String::new(),
            timestamp: now,
            reads: Vec::new(),
            created_at: now,
            updated_at: now,
            guests_can_invite: false,
        };
        event.set_timestamp(timestamp, now)?;
        Ok(event)
    }

    pub fn state(&self, now: DateTime<Utc>) -> EventState {
        if self.key.is_none() {
            EventState::Draft
        } else if self.is_past(now) {
            EventState::Past
        } else {
            EventState::Committed
        }
    }

    pub fn is_past(&self, now: DateTime<Utc>) -> bool {
        self.timestamp <= now
    }

    /// Past events are read-only.
    pub fn ensure_mutable(&self, now: DateTime<Utc>) -> Result<(), MembershipError> {
        if self.is_past(now) {
            return Err(MembershipError::Invalid("this event has already happened".into()));
        }
        Ok(())
    }

    pub fn set_timestamp(
        &mut self,
        timestamp: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), MembershipError> {
        if timestamp <= now {
            return Err(MembershipError::Invalid("the event must be in the future".into()));
        }
        self.timestamp = timestamp;
        Ok(())
    }

    pub fn has_user(&self, user: Key) -> bool {
        self.users.contains(&user)
    }

    pub fn owner_is(&self, user: Key) -> bool {
        self.owner == user
    }

    pub fn has_host(&self, user: Key) -> bool {
        self.hosts.contains(&user)
    }

    pub fn has_rsvp(&self, user: Key) -> bool {
        self.rsvps.contains(&user)
    }

    /// Owner, hosts and, when the owner allows it, any participant.
    pub fn can_invite(&self, user: Key) -> bool {
        self.owner_is(user)
            || self.has_host(user)
            || (self.guests_can_invite && self.has_user(user))
    }

    pub fn add_user(&mut self, user: &User) -> Result<Key, MembershipError> {
        members::add(
            &mut self.users,
            &mut self.user_partials,
            self.owner,
            user,
            EVENT_USER_LIMIT,
        )
    }

    pub fn remove_user(&mut self, user: Key) -> Result<(), MembershipError> {
        members::remove(&mut self.users, &mut self.user_partials, self.owner, user)?;
        self.hosts.retain(|k| *k != user);
        self.rsvps.retain(|k| *k != user);
        self.reads.retain(|r| r.user != user);
        Ok(())
    }

    /// Record `user`'s RSVP. A new RSVP resets every read marker so all
    /// participants see the change. Repeating an RSVP changes nothing.
    pub fn add_rsvp(&mut self, user: Key) -> Result<bool, MembershipError> {
        if self.owner_is(user) {
            return Err(MembershipError::Invalid("the owner cannot RSVP".into()));
        }
        if !self.has_user(user) {
            return Err(MembershipError::Invalid("only participants can RSVP".into()));
        }
        if self.has_rsvp(user) {
            return Ok(false);
        }
        self.rsvps.push(user);
        self.clear_reads();
        Ok(true)
    }

    /// Withdraw `user`'s RSVP. Read markers are left alone.
    pub fn remove_rsvp(&mut self, user: Key) -> Result<bool, MembershipError> {
        if !self.has_user(user) {
            return Err(MembershipError::NotFound(user));
        }
        let before = self.rsvps.len();
        self.rsvps.retain(|k| *k != user);
        Ok(before != self.rsvps.len())
    }

    /// Owner only. Kills every outstanding invite and RSVP link.
    pub fn roll_invite_token(&mut self, actor: Key) -> Result<(), MembershipError> {
        if !self.owner_is(actor) {
            return Err(MembershipError::Forbidden(
                "only the owner can reset the invite link".into(),
            ));
        }
        self.invite_token = random_token();
        Ok(())
    }

    /// Replace the host set. Every host must already be a participant.
    pub fn set_hosts(&mut self, hosts: &[Key]) -> Result<(), MembershipError> {
        let mut next: Vec<Key> = Vec::with_capacity(hosts.len());
        for host in hosts {
            if !self.has_user(*host) {
                return Err(MembershipError::NotFound(*host));
            }
            if !next.contains(host) {
                next.push(*host);
            }
        }
        self.hosts = next;
        Ok(())
    }

    pub fn replace_user(&mut self, from: Key, to: &UserPartial) {
        if self.owner == from {
            self.owner = to.id;
        }
        replace_key(&mut self.users, from, to.id);
        replace_key(&mut self.hosts, from, to.id);
        replace_key(&mut self.rsvps, from, to.id);
        // the owner never RSVPs, even after two accounts merge
        let owner = self.owner;
        self.rsvps.retain(|k| *k != owner);
        members::replace_partial(&mut self.user_partials, from, to);
        self.replace_reader(from, to.id);
    }

    pub fn references(&self, user: Key) -> bool {
        self.owner == user
            || self.users.contains(&user)
            || self.hosts.contains(&user)
            || self.rsvps.contains(&user)
            || self.is_read(user)
    }
}

impl Readable for Event {
    fn reads(&self) -> &[Read] {
        &self.reads
    }

    fn reads_mut(&mut self) -> &mut Vec<Read> {
        &mut self.reads
    }
}

impl Named for Event {
    fn name(&self) -> String {
        self.name.clone()
    }
}

impl Entity for Event {
    const KIND: Kind = Kind::Event;

    fn key(&self) -> Option<Key> {
        self.key
    }

    fn set_key(&mut self, key: Key) {
        self.key = Some(key);
    }

    fn index(&self) -> Vec<(&'static str, String)> {
        let mut index = vec![("owner", self.owner.encode())];
        index.extend(index_keys("users", &self.users));
        index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn user(id: i64) -> User {
        let mut u = User::new(&format!("u{id}@x.com"));
        u.key = Some(Key::new(Kind::User, id));
        u
    }

    fn k(id: i64) -> Key {
        Key::new(Kind::User, id)
    }

    fn event() -> Event {
        let now = Utc::now();
        Event::new(&user(1), "Dinner", now + Duration::days(1), now).unwrap()
    }

    #[test]
    fn test_creation_requires_future() {
        let now = Utc::now();
        let err = Event::new(&user(1), "Late", now - Duration::minutes(1), now).unwrap_err();
        assert!(matches!(err, MembershipError::Invalid(_)));
    }

    #[test]
    fn test_rsvp_rules() {
        let mut e = event();
        e.add_user(&user(2)).unwrap();
        e.mark_read(k(1), Utc::now());

        assert!(e.add_rsvp(k(1)).is_err());
        assert!(e.add_rsvp(k(3)).is_err());

        assert!(e.add_rsvp(k(2)).unwrap());
        assert_eq!(e.rsvps, vec![k(2)]);
        assert!(e.reads.is_empty());

        e.mark_read(k(1), Utc::now());
        assert!(e.remove_rsvp(k(2)).unwrap());
        assert!(e.is_read(k(1)));
    }

    #[test]
    fn test_event_limit() {
        let mut e = event();
        for id in 2..=EVENT_USER_LIMIT as i64 {
            e.add_user(&user(id)).unwrap();
        }
        assert_eq!(e.users.len(), EVENT_USER_LIMIT);
        assert_eq!(
            e.add_user(&user(1000)),
            Err(MembershipError::Limit(EVENT_USER_LIMIT))
        );
    }

    #[test]
    fn test_roll_invite_token_owner_only() {
        let mut e = event();
        e.add_user(&user(2)).unwrap();
        let before = e.invite_token.clone();
        assert!(e.roll_invite_token(k(2)).is_err());
        e.roll_invite_token(k(1)).unwrap();
        assert_ne!(e.invite_token, before);
    }

    #[test]
    fn test_remove_user_clears_host_and_rsvp() {
        let mut e = event();
        e.add_user(&user(2)).unwrap();
        e.set_hosts(&[k(2)]).unwrap();
        e.add_rsvp(k(2)).unwrap();
        e.remove_user(k(2)).unwrap();
        assert!(e.hosts.is_empty());
        assert!(e.rsvps.is_empty());
        assert!(e.set_hosts(&[k(2)]).is_err());
    }

    #[test]
    fn test_can_invite() {
        let mut e = event();
        e.add_user(&user(2)).unwrap();
        assert!(e.can_invite(k(1)));
        assert!(!e.can_invite(k(2)));
        e.guests_can_invite = true;
        assert!(e.can_invite(k(2)));
        assert!(!e.can_invite(k(3)));
    }

    #[test]
    fn test_state() {
        let mut e = event();
        let now = Utc::now();
        assert_eq!(e.state(now), EventState::Draft);
        e.key = Some(Key::new(Kind::Event, 7));
        assert_eq!(e.state(now), EventState::Committed);
        assert_eq!(e.state(now + Duration::days(2)), EventState::Past);
        assert!(e.ensure_mutable(now + Duration::days(2)).is_err());
    }

    #[test]
    fn test_legacy_guests_can_invite() {
        let e = event();
        let mut json = serde_json::to_value(&e).unwrap();
        let obj = json.as_object_mut().unwrap();
        obj.remove("guests_can_invite");
        obj.insert("GuestsCanInvite".into(), serde_json::json!("yes"));
        let loaded: Event = serde_json::from_value(json).unwrap();
        assert!(!loaded.guests_can_invite);
    }
}

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use convo_shared::constants::CONTACT_LIMIT;
use convo_shared::crypto::random_token;
use convo_shared::{Key, Kind};
use serde::{Deserialize, Serialize};

use super::members::replace_key;
use super::{MembershipError, Named};
use crate::entity::{index_keys, Entity};

fn yes() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    #[serde(skip)]
    pub key: Option<Key>,

    /// Primary address.
    pub email: String,
    /// Verified addresses. The primary is verified iff it is in here.
    #[serde(default)]
    pub emails: Vec<String>,

    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub full_name: String,

    /// bcrypt digest.
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub google_id: Option<String>,
    #[serde(default)]
    pub facebook_id: Option<String>,

    #[serde(default)]
    pub avatar_url: String,
    pub token: String,
    #[serde(default)]
    pub realtime_token: String,

    #[serde(default)]
    pub verified: bool,
    #[serde(default)]
    pub registered: bool,
    #[serde(default)]
    pub locked: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Most recent last.
    #[serde(default)]
    pub contacts: Vec<Key>,

    #[serde(default = "yes")]
    pub send_digest: bool,
    #[serde(default = "yes")]
    pub send_threads: bool,
    #[serde(default = "yes")]
    pub send_events: bool,

    #[serde(default)]
    pub tags: BTreeMap<String, i64>,
}

impl User {
    pub fn new(email: &str) -> Self {
        let now = Utc::now();
        Self {
            key: None,
            email: email.trim().to_lowercase(),
            emails: Vec::new(),
            first_name: String::new(),
            last_name: String::new(),
            full_name: String::new(),
            password: None,
            google_id: None,
            facebook_id: None,
            avatar_url: String::new(),
            token: random_token(),
            realtime_token: String::new(),
            verified: false,
            registered: false,
            locked: false,
            created_at: now,
            updated_at: now,
            contacts: Vec::new(),
            send_digest: true,
            send_threads: true,
            send_events: true,
            tags: BTreeMap::new(),
        }
    }

    /// Shell created by an e-mail invitation: no password, unverified, first
    /// name taken from the address's local part.
    pub fn new_incomplete(email: &str) -> Self {
        let mut user = Self::new(email);
        user.first_name = user
            .email
            .split('@')
            .next()
            .unwrap_or_default()
            .to_string();
        user.derive();
        user
    }

    /// Recompute the derived fields. Called on load paths that mutate and
    /// before every save.
    pub fn derive(&mut self) {
        if !self.emails.is_empty() && !self.emails.contains(&self.email) {
            self.email = self.emails[0].clone();
        }
        self.full_name = format!("{} {}", self.first_name.trim(), self.last_name.trim())
            .trim()
            .to_string();
        self.verified = self.emails.contains(&self.email);
        self.registered = self.verified
            && (self.password.is_some() || self.google_id.is_some() || self.facebook_id.is_some());
    }

    /// Lowercase addresses, title-case names, then [`User::derive`].
    pub fn normalize(&mut self) {
        self.email = self.email.trim().to_lowercase();
        let mut emails: Vec<String> = Vec::with_capacity(self.emails.len());
        for email in self.emails.drain(..) {
            let email = email.trim().to_lowercase();
            if !email.is_empty() && !emails.contains(&email) {
                emails.push(email);
            }
        }
        self.emails = emails;
        self.first_name = title_case(&self.first_name);
        self.last_name = title_case(&self.last_name);
        if let Some(key) = self.key {
            self.contacts.retain(|c| *c != key);
        }
        self.derive();
    }

    pub fn has_email(&self, email: &str) -> bool {
        let email = email.trim().to_lowercase();
        self.email == email || self.emails.contains(&email)
    }

    pub fn has_verified_email(&self, email: &str) -> bool {
        self.emails.contains(&email.trim().to_lowercase())
    }

    /// Record `email` as verified.
    pub fn add_email(&mut self, email: &str) {
        let email = email.trim().to_lowercase();
        if !self.emails.contains(&email) {
            self.emails.push(email);
        }
        self.derive();
    }

    pub fn remove_email(&mut self, email: &str) -> Result<(), MembershipError> {
        let email = email.trim().to_lowercase();
        if email == self.email {
            return Err(MembershipError::Forbidden(
                "the primary address cannot be removed".into(),
            ));
        }
        if !self.emails.contains(&email) {
            return Err(MembershipError::Invalid(format!("{email} is not on this account")));
        }
        self.emails.retain(|e| *e != email);
        self.derive();
        Ok(())
    }

    pub fn set_primary(&mut self, email: &str) -> Result<(), MembershipError> {
        let email = email.trim().to_lowercase();
        if !self.emails.contains(&email) {
            return Err(MembershipError::Invalid(
                "only a verified address can become primary".into(),
            ));
        }
        self.email = email;
        self.derive();
        Ok(())
    }

    /// Append `contact` as the most recent, evicting the oldest past the limit.
    pub fn add_contact(&mut self, contact: Key) -> bool {
        if Some(contact) == self.key || contact.kind != Kind::User {
            return false;
        }
        self.contacts.retain(|c| *c != contact);
        self.contacts.push(contact);
        if self.contacts.len() > CONTACT_LIMIT {
            let excess = self.contacts.len() - CONTACT_LIMIT;
            self.contacts.drain(..excess);
        }
        true
    }

    pub fn remove_contact(&mut self, contact: Key) -> bool {
        let before = self.contacts.len();
        self.contacts.retain(|c| *c != contact);
        before != self.contacts.len()
    }

    pub fn has_contact(&self, contact: Key) -> bool {
        self.contacts.contains(&contact)
    }

    pub fn replace_contact(&mut self, from: Key, to: Key) {
        replace_key(&mut self.contacts, from, to);
        if let Some(key) = self.key {
            self.contacts.retain(|c| *c != key);
        }
    }

    pub fn bump_tag(&mut self, tag: &str) {
        *self.tags.entry(tag.to_string()).or_insert(0) += 1;
    }

    /// Rotating the token kills every magic-login and unsubscribe link.
    pub fn roll_token(&mut self) {
        self.token = random_token();
    }
}

impl Named for User {
    fn name(&self) -> String {
        if self.full_name.is_empty() {
            self.email.clone()
        } else {
            self.full_name.clone()
        }
    }
}

impl Entity for User {
    const KIND: Kind = Kind::User;

    fn key(&self) -> Option<Key> {
        self.key
    }

    fn set_key(&mut self, key: Key) {
        self.key = Some(key);
    }

    fn index(&self) -> Vec<(&'static str, String)> {
        let mut index = vec![("email", self.email.clone()), ("token", self.token.clone())];
        index.extend(self.emails.iter().map(|e| ("emails", e.clone())));
        if let Some(id) = &self.google_id {
            index.push(("google_id", id.clone()));
        }
        if let Some(id) = &self.facebook_id {
            index.push(("facebook_id", id.clone()));
        }
        index.extend(index_keys("contacts", &self.contacts));
        index
    }
}

fn title_case(name: &str) -> String {
    name.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incomplete_user() {
        let u = User::new_incomplete("New@X.com");
        assert_eq!(u.email, "new@x.com");
        assert_eq!(u.first_name, "new");
        assert!(!u.verified);
        assert!(!u.registered);
        assert_eq!(u.token.len(), 32);
    }

    #[test]
    fn test_verified_tracks_primary_in_aux() {
        let mut u = User::new("a@x.com");
        u.password = Some("digest".into());
        u.derive();
        assert!(!u.verified && !u.registered);

        u.add_email("a@x.com");
        assert!(u.verified && u.registered);
    }

    #[test]
    fn test_first_aux_promoted_when_primary_unverified() {
        let mut u = User::new("a@x.com");
        u.emails = vec!["b@x.com".into()];
        u.derive();
        assert_eq!(u.email, "b@x.com");
        assert!(u.verified);
    }

    #[test]
    fn test_email_rules() {
        let mut u = User::new("a@x.com");
        u.add_email("a@x.com");
        assert!(u.remove_email("a@x.com").is_err());
        assert!(u.set_primary("c@x.com").is_err());

        u.add_email("C@x.com");
        u.set_primary("c@x.com").unwrap();
        assert_eq!(u.email, "c@x.com");
        u.remove_email("a@x.com").unwrap();
        assert_eq!(u.emails, vec!["c@x.com".to_string()]);
    }

    #[test]
    fn test_normalize_names() {
        let mut u = User::new("a@x.com");
        u.first_name = "mary  ann".into();
        u.last_name = "smith".into();
        u.normalize();
        assert_eq!(u.full_name, "Mary Ann Smith");
    }

    #[test]
    fn test_contacts_bounded_and_exclude_self() {
        let mut u = User::new("a@x.com");
        u.key = Some(Key::new(Kind::User, 1));
        assert!(!u.add_contact(Key::new(Kind::User, 1)));

        for id in 2..(CONTACT_LIMIT as i64 + 5) {
            u.add_contact(Key::new(Kind::User, id));
        }
        assert_eq!(u.contacts.len(), CONTACT_LIMIT);
        assert_eq!(u.contacts.first(), Some(&Key::new(Kind::User, 5)));

        u.add_contact(Key::new(Kind::User, 5));
        assert_eq!(u.contacts.len(), CONTACT_LIMIT);
        assert_eq!(u.contacts.last(), Some(&Key::new(Kind::User, 5)));
    }

    #[test]
    fn test_replace_contact_drops_self() {
        let mut u = User::new("a@x.com");
        let me = Key::new(Kind::User, 1);
        let v = Key::new(Kind::User, 2);
        u.key = Some(me);
        u.contacts = vec![v, Key::new(Kind::User, 3)];
        u.replace_contact(v, me);
        assert_eq!(u.contacts, vec![Key::new(Kind::User, 3)]);
    }
}

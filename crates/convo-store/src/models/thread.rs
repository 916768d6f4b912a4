use chrono::{DateTime, Utc};
use convo_shared::constants::{SUBJECT_MAX_LEN, THREAD_USER_LIMIT};
use convo_shared::{Key, Kind};
use serde::{Deserialize, Serialize};

use super::members::{self, replace_key, UserPartial};
use super::{MembershipError, Named, Preview, Read, Readable, User};
use crate::entity::{index_keys, lenient, Entity};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    #[serde(skip)]
    pub key: Option<Key>,
    pub owner: Key,
    /// Participants, owner included.
    pub users: Vec<Key>,
    #[serde(default)]
    pub user_partials: Vec<UserPartial>,
    #[serde(default)]
    pub subject: String,
    #[serde(default, alias = "Preview", deserialize_with = "lenient")]
    pub preview: Option<Preview>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub response_count: i64,
    #[serde(default)]
    pub reads: Vec<Read>,
}

impl Thread {
    pub fn new(owner: &User, subject: &str) -> Result<Self, MembershipError> {
        let partial = UserPartial::of(owner)?;
        let now = Utc::now();
        let mut thread = Self {
            key: None,
            owner: partial.id,
            users: vec![partial.id],
            user_partials: vec![partial],
            subject: String::new(),
            preview: None,
            created_at: now,
            updated_at: now,
            response_count: 0,
            reads: Vec::new(),
        };
        thread.set_subject(subject)?;
        Ok(thread)
    }

    pub fn set_subject(&mut self, subject: &str) -> Result<(), MembershipError> {
        let subject = subject.trim();
        if subject.chars().count() > SUBJECT_MAX_LEN {
            return Err(MembershipError::Invalid(format!(
                "subject must be at most {SUBJECT_MAX_LEN} characters"
            )));
        }
        self.subject = subject.to_string();
        Ok(())
    }

    pub fn has_user(&self, user: Key) -> bool {
        self.users.contains(&user)
    }

    pub fn owner_is(&self, user: Key) -> bool {
        self.owner == user
    }

    pub fn add_user(&mut self, user: &User) -> Result<Key, MembershipError> {
        members::add(
            &mut self.users,
            &mut self.user_partials,
            self.owner,
            user,
            THREAD_USER_LIMIT,
        )
    }

    pub fn remove_user(&mut self, user: Key) -> Result<(), MembershipError> {
        members::remove(&mut self.users, &mut self.user_partials, self.owner, user)?;
        self.reads.retain(|r| r.user != user);
        Ok(())
    }

    /// Rewrite every reference to `from` as `to` (merge).
    pub fn replace_user(&mut self, from: Key, to: &UserPartial) {
        if self.owner == from {
            self.owner = to.id;
        }
        replace_key(&mut self.users, from, to.id);
        members::replace_partial(&mut self.user_partials, from, to);
        self.replace_reader(from, to.id);
    }

    pub fn references(&self, user: Key) -> bool {
        self.owner == user || self.users.contains(&user) || self.is_read(user)
    }
}

impl Readable for Thread {
    fn reads(&self) -> &[Read] {
        &self.reads
    }

    fn reads_mut(&mut self) -> &mut Vec<Read> {
        &mut self.reads
    }
}

impl Named for Thread {
    fn name(&self) -> String {
        self.subject.clone()
    }
}

impl Entity for Thread {
    const KIND: Kind = Kind::Thread;

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

use chrono::{DateTime, Utc};
use convo_shared::{Key, Kind};
use serde::{Deserialize, Serialize};

use crate::entity::Entity;

/// A private note. Only the owner matters here: the merge engine moves notes
/// between users.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Note {
    #[serde(skip)]
    pub key: Option<Key>,
    pub owner: Key,
    #[serde(default)]
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl Note {
    pub fn new(owner: Key, body: impl Into<String>) -> Self {
        Self {
            key: None,
            owner,
            body: body.into(),
            created_at: Utc::now(),
        }
    }
}

impl Entity for Note {
    const KIND: Kind = Kind::Note;

    fn key(&self) -> Option<Key> {
        self.key
    }

    fn set_key(&mut self, key: Key) {
        self.key = Some(key);
    }

    fn index(&self) -> Vec<(&'static str, String)> {
        vec![("owner", self.owner.encode())]
    }
}

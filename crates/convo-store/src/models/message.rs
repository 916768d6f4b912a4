use chrono::{DateTime, Utc};
use convo_shared::{Key, Kind};
use serde::{Deserialize, Serialize};

use super::{Read, Readable};
use crate::entity::Entity;

/// OpenGraph summary of the first URL in a message body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub image: String,
}

/// What a thread shows before it is opened: the anchor message's content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preview {
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub photos: Vec<String>,
    #[serde(default)]
    pub link: Option<Link>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(skip)]
    pub key: Option<Key>,
    pub author: Key,
    /// Thread or event.
    pub parent: Key,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub photos: Vec<String>,
    #[serde(default)]
    pub link: Option<Link>,
    #[serde(default)]
    pub reads: Vec<Read>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(author: Key, parent: Key, body: impl Into<String>) -> Self {
        let created_at = Utc::now();
        Self {
            key: None,
            author,
            parent,
            body: body.into(),
            photos: Vec::new(),
            link: None,
            reads: vec![Read {
                user: author,
                time: created_at,
            }],
            created_at,
        }
    }

    pub fn preview(&self) -> Preview {
        Preview {
            body: self.body.clone(),
            photos: self.photos.clone(),
            link: self.link.clone(),
        }
    }
}

impl Readable for Message {
    fn reads(&self) -> &[Read] {
        &self.reads
    }

    fn reads_mut(&mut self) -> &mut Vec<Read> {
        &mut self.reads
    }
}

impl Entity for Message {
    const KIND: Kind = Kind::Message;

    fn key(&self) -> Option<Key> {
        self.key
    }

    fn set_key(&mut self, key: Key) {
        self.key = Some(key);
    }

    fn index(&self) -> Vec<(&'static str, String)> {
        vec![
            ("parent", self.parent.encode()),
            ("author", self.author.encode()),
        ]
    }
}

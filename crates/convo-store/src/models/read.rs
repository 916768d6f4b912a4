use chrono::{DateTime, Utc};
use convo_shared::Key;
use serde::{Deserialize, Serialize};

/// A user has seen the entity at or after `time`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Read {
    pub user: Key,
    pub time: DateTime<Utc>,
}

/// Entities that carry per-user read markers (threads, events, messages).
pub trait Readable {
    fn reads(&self) -> &[Read];

    fn reads_mut(&mut self) -> &mut Vec<Read>;

    /// Set or refresh `user`'s marker. Marking twice keeps one marker.
    fn mark_read(&mut self, user: Key, at: DateTime<Utc>) {
        let reads = self.reads_mut();
        match reads.iter_mut().find(|r| r.user == user) {
            Some(read) => read.time = at,
            None => reads.push(Read { user, time: at }),
        }
    }

    fn is_read(&self, user: Key) -> bool {
        self.reads().iter().any(|r| r.user == user)
    }

    fn clear_reads(&mut self) {
        self.reads_mut().clear();
    }

    /// Drop every marker except `user`'s.
    fn clear_reads_except(&mut self, user: Key) {
        self.reads_mut().retain(|r| r.user == user);
    }

    /// Move `from`'s marker to `to`, keeping the later time when both exist.
    fn replace_reader(&mut self, from: Key, to: Key) {
        let reads = self.reads_mut();
        let Some(pos) = reads.iter().position(|r| r.user == from) else {
            return;
        };
        let moved = reads.remove(pos);
        match reads.iter_mut().find(|r| r.user == to) {
            Some(existing) => existing.time = existing.time.max(moved.time),
            None => reads.push(Read {
                user: to,
                time: moved.time,
            }),
        }
    }
}

/// Display name of something a user is told about (thread subject, event
/// name, user full name).
pub trait Named {
    fn name(&self) -> String;
}

//! Domain models persisted in the entity store.
//!
//! Every model keeps its key outside the stored document (`#[serde(skip)]`);
//! the [`Datastore`](crate::Datastore) fills it in after loading. References
//! between entities are always keys, never embedded documents.

mod event;
mod members;
mod message;
mod note;
mod read;
mod thread;
mod user;

use convo_shared::Key;
use thiserror::Error;

pub use event::{Event, EventState};
pub use members::UserPartial;
pub use message::{Link, Message, Preview};
pub use note::Note;
pub use read::{Named, Read, Readable};
pub use thread::Thread;
pub use user::User;

/// Violations of the membership and profile invariants. Each is a property of
/// the request, never of the server.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MembershipError {
    #[error("{0}")]
    Conflict(String),

    #[error("this is limited to {0} people")]
    Limit(usize),

    #[error("{0} is not a participant")]
    NotFound(Key),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Invalid(String),
}

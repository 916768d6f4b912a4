//! # convo-shared
//!
//! Types and pure helpers shared by the store and the server: entity keys and
//! their external encoding, limits, the magic-link signer and the per-thread
//! reply address codec. Nothing in this crate performs I/O.

pub mod address;
pub mod constants;
pub mod crypto;
pub mod error;
pub mod magic;
pub mod types;

pub use error::{KeyError, MagicError};
pub use types::{Key, Kind};

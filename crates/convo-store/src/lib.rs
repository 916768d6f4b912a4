//! # convo-store
//!
//! Entity store for the Convo backend, backed by SQLite.
//!
//! Entities are JSON documents keyed by kind and a server-assigned numeric ID.
//! Each document also writes a set of `(property, value)` rows that queries
//! filter on. Writes issued while a request holds a transaction are buffered
//! and applied atomically on commit, after a version check of everything the
//! transaction read.

pub mod context;
pub mod database;
pub mod datastore;
pub mod entity;
pub mod events;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod notes;
pub mod query;
pub mod threads;
pub mod transaction;
pub mod users;

mod error;

pub use context::Context;
pub use database::Database;
pub use datastore::Datastore;
pub use entity::Entity;
pub use error::{Result, StoreError};
pub use models::*;
pub use query::Query;
pub use transaction::Transaction;

//! Domain operations.
//!
//! Every service is an `impl AppState` block: handlers, the e-mail worker,
//! inbound ingest and the digest all go through the same methods. Methods
//! that write open their own transaction with
//! [`Datastore::run_in_transaction`](convo_store::Datastore::run_in_transaction)
//! and join the caller's when one is already open. Fan-out runs only after
//! the commit.

pub mod account;
pub mod digest;
pub mod events;
pub mod identity;
pub mod inbound;
pub mod membership;
pub mod merge;
pub mod messages;
pub mod notify;
pub mod threads;
pub mod worker;

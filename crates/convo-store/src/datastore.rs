//! Async facade over [`Database`].
//!
//! Every operation takes the request [`Context`], fails fast once the context
//! is cancelled or past its deadline, and runs its SQLite work on the blocking
//! pool. Writes join the context's open transaction when there is one and are
//! applied immediately otherwise. Plain reads always see committed state; use
//! [`Datastore::get_in_tx`] to read through the transaction so the version is
//! checked at commit.

use std::future::Future;
use std::sync::Arc;

use convo_shared::constants::TRANSACTION_ATTEMPTS;
use convo_shared::{Key, Kind};
use rusqlite::Connection;

use crate::context::Context;
use crate::database::{self, Database, Write};
use crate::entity::Entity;
use crate::error::{Result, StoreError};
use crate::query::Query;
use crate::transaction::Transaction;

#[derive(Clone)]
pub struct Datastore {
    db: Database,
}

impl Datastore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Datastore over a private in-memory database.
    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || db.with_conn(f))
            .await
            .map_err(|e| StoreError::Background(e.to_string()))?
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub async fn get<E: Entity>(&self, ctx: &Context, key: Key) -> Result<E> {
        self.get_opt(ctx, key).await?.ok_or(StoreError::NotFound(key))
    }

    pub async fn get_opt<E: Entity>(&self, ctx: &Context, key: Key) -> Result<Option<E>> {
        ctx.check()?;
        if key.kind != E::KIND {
            return Ok(None);
        }
        let rows = self
            .blocking(move |conn| database::load_rows(conn, key.kind, &[key.id]))
            .await?;
        match rows.into_iter().next().flatten() {
            Some(row) => Ok(Some(decode(key, &row.body)?)),
            None => Ok(None),
        }
    }

    /// Load every key, in order. Any missing key fails the whole call.
    pub async fn get_multi<E: Entity>(&self, ctx: &Context, keys: &[Key]) -> Result<Vec<E>> {
        ctx.check()?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(key) = keys.iter().find(|k| k.kind != E::KIND) {
            return Err(StoreError::NotFound(*key));
        }
        let ids: Vec<i64> = keys.iter().map(|k| k.id).collect();
        let rows = self
            .blocking(move |conn| database::load_rows(conn, E::KIND, &ids))
            .await?;
        keys.iter()
            .zip(rows)
            .map(|(key, row)| match row {
                Some(row) => decode(*key, &row.body),
                None => Err(StoreError::NotFound(*key)),
            })
            .collect()
    }

    /// Load every key, in order, with `None` for the missing ones.
    pub async fn get_multi_opt<E: Entity>(&self, ctx: &Context, keys: &[Key]) -> Result<Vec<Option<E>>> {
        ctx.check()?;
        let ids: Vec<i64> = keys.iter().map(|k| k.id).collect();
        let rows = self
            .blocking(move |conn| database::load_rows(conn, E::KIND, &ids))
            .await?;
        keys.iter()
            .zip(rows)
            .map(|(key, row)| match row {
                Some(row) if key.kind == E::KIND => decode(*key, &row.body).map(Some),
                _ => Ok(None),
            })
            .collect()
    }

    /// Read through the open transaction: sees the transaction's own buffered
    /// writes and records the stored version for the commit-time check.
    /// Without a transaction this is [`Datastore::get_opt`].
    pub async fn get_in_tx<E: Entity>(&self, ctx: &Context, key: Key) -> Result<Option<E>> {
        let Some(tx) = ctx.transaction() else {
            return self.get_opt(ctx, key).await;
        };
        ctx.check()?;
        if key.kind != E::KIND {
            return Ok(None);
        }
        match tx.buffered(key) {
            Some(Some(body)) => return Ok(Some(decode(key, &body)?)),
            Some(None) => return Ok(None),
            None => {}
        }
        let rows = self
            .blocking(move |conn| database::load_rows(conn, key.kind, &[key.id]))
            .await?;
        match rows.into_iter().next().flatten() {
            Some(row) => {
                tx.record_read(key, row.version);
                Ok(Some(decode(key, &row.body)?))
            }
            None => {
                tx.record_read(key, 0);
                Ok(None)
            }
        }
    }

    pub async fn query<E: Entity>(&self, ctx: &Context, query: &Query) -> Result<Vec<E>> {
        let keys = self.query_keys(ctx, query).await?;
        let ids: Vec<i64> = keys.iter().map(|k| k.id).collect();
        let rows = self
            .blocking(move |conn| database::load_rows(conn, E::KIND, &ids))
            .await?;
        keys.into_iter()
            .zip(rows)
            .filter_map(|(key, row)| row.map(|row| decode(key, &row.body)))
            .collect()
    }

    pub async fn query_keys(&self, ctx: &Context, query: &Query) -> Result<Vec<Key>> {
        ctx.check()?;
        let query = query.clone();
        let kind = query.kind;
        let ids = self
            .blocking(move |conn| database::query_ids(conn, query.kind, &query.filters, query.limit))
            .await?;
        Ok(ids.into_iter().map(|id| Key::new(kind, id)).collect())
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    pub async fn allocate(&self, ctx: &Context, kind: Kind, count: usize) -> Result<Vec<Key>> {
        ctx.check()?;
        let ids = self
            .blocking(move |conn| database::allocate_ids(conn, count))
            .await?;
        Ok(ids.into_iter().map(|id| Key::new(kind, id)).collect())
    }

    /// Store `entity`, assigning it a key first when it has none.
    pub async fn put<E: Entity>(&self, ctx: &Context, entity: &mut E) -> Result<Key> {
        let keys = self.put_multi(ctx, std::slice::from_mut(entity)).await?;
        keys.into_iter()
            .next()
            .ok_or_else(|| StoreError::Integrity("put returned no key".into()))
    }

    pub async fn put_multi<E: Entity>(&self, ctx: &Context, entities: &mut [E]) -> Result<Vec<Key>> {
        ctx.check()?;
        let missing = entities.iter().filter(|e| e.key().is_none()).count();
        if missing > 0 {
            let mut fresh = self.allocate(ctx, E::KIND, missing).await?.into_iter();
            for entity in entities.iter_mut().filter(|e| e.key().is_none()) {
                if let Some(key) = fresh.next() {
                    entity.set_key(key);
                }
            }
        }

        let mut writes = Vec::with_capacity(entities.len());
        let mut keys = Vec::with_capacity(entities.len());
        for entity in entities.iter() {
            let key = entity
                .key()
                .ok_or_else(|| StoreError::Integrity("entity without key".into()))?;
            writes.push(Write::Put {
                key,
                body: serde_json::to_string(entity)?,
                index: entity
                    .index()
                    .into_iter()
                    .map(|(p, v)| (p.to_string(), v))
                    .collect(),
            });
            keys.push(key);
        }
        self.write(ctx, writes).await?;
        Ok(keys)
    }

    pub async fn delete(&self, ctx: &Context, key: Key) -> Result<()> {
        self.delete_multi(ctx, &[key]).await
    }

    pub async fn delete_multi(&self, ctx: &Context, keys: &[Key]) -> Result<()> {
        ctx.check()?;
        let writes = keys.iter().map(|key| Write::Delete { key: *key }).collect();
        self.write(ctx, writes).await
    }

    async fn write(&self, ctx: &Context, writes: Vec<Write>) -> Result<()> {
        if writes.is_empty() {
            return Ok(());
        }
        match ctx.transaction() {
            Some(tx) => {
                for write in writes {
                    tx.buffer(write);
                }
                Ok(())
            }
            None => {
                self.blocking(move |conn| database::apply(conn, &[], &writes))
                    .await
            }
        }
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    /// Open a transaction on `ctx`. Every clone of `ctx` joins it.
    pub fn begin(&self, ctx: &Context) -> Result<Arc<Transaction>> {
        ctx.check()?;
        if ctx.in_transaction() {
            return Err(StoreError::Integrity("transaction already open".into()));
        }
        let tx = Arc::new(Transaction::new());
        ctx.install(tx.clone());
        Ok(tx)
    }

    /// Check the versions read through the transaction and apply its writes
    /// atomically. The transaction is closed whatever the outcome.
    pub async fn commit(&self, ctx: &Context) -> Result<()> {
        let tx = ctx.take_transaction().ok_or(StoreError::NoTransaction)?;
        if let Err(e) = ctx.check() {
            tx.discard();
            return Err(e);
        }
        let (reads, writes) = tx.take();
        if writes.is_empty() {
            return Ok(());
        }
        let count = writes.len();
        self.blocking(move |conn| database::apply(conn, &reads, &writes))
            .await?;
        tracing::debug!(writes = count, "transaction committed");
        Ok(())
    }

    pub fn rollback(&self, ctx: &Context) -> Result<()> {
        let tx = ctx.take_transaction().ok_or(StoreError::NoTransaction)?;
        tx.discard();
        Ok(())
    }

    /// Run `f` in a transaction and commit it. An error from `f` rolls back;
    /// a commit conflict reruns `f` up to [`TRANSACTION_ATTEMPTS`] times.
    /// When `ctx` already has a transaction open, `f` joins it and the outer
    /// owner commits.
    pub async fn run_in_transaction<T, Err, F, Fut>(&self, ctx: &Context, mut f: F) -> std::result::Result<T, Err>
    where
        F: FnMut(Context) -> Fut,
        Fut: Future<Output = std::result::Result<T, Err>>,
        Err: From<StoreError>,
    {
        if ctx.in_transaction() {
            return f(ctx.clone()).await;
        }

        let mut attempt = 1;
        loop {
            self.begin(ctx)?;
            let value = match f(ctx.clone()).await {
                Ok(value) => value,
                Err(e) => {
                    let _ = self.rollback(ctx);
                    return Err(e);
                }
            };
            match self.commit(ctx).await {
                Ok(()) => return Ok(value),
                Err(e) if e.is_conflict() && attempt < TRANSACTION_ATTEMPTS => {
                    tracing::debug!(attempt, error = %e, "transaction conflict, retrying");
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn decode<E: Entity>(key: Key, body: &str) -> Result<E> {
    let mut entity: E = serde_json::from_str(body)?;
    entity.set_key(key);
    Ok(entity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Note;
    use chrono::Utc;

    fn note(owner: Key, body: &str) -> Note {
        Note {
            key: None,
            owner,
            body: body.to_string(),
            created_at: Utc::now(),
        }
    }

    fn owner() -> Key {
        Key::new(Kind::User, 1)
    }

    #[tokio::test]
    async fn test_put_assigns_key_and_get_loads_it() {
        let ds = Datastore::in_memory().unwrap();
        let ctx = Context::background();

        let mut n = note(owner(), "hello");
        let key = ds.put(&ctx, &mut n).await.unwrap();
        assert_eq!(n.key, Some(key));
        assert_eq!(key.kind, Kind::Note);

        let loaded: Note = ds.get(&ctx, key).await.unwrap();
        assert_eq!(loaded.body, "hello");
        assert_eq!(loaded.key, Some(key));
    }

    #[tokio::test]
    async fn test_get_wrong_kind_is_not_found() {
        let ds = Datastore::in_memory().unwrap();
        let ctx = Context::background();
        let key = ds.put(&ctx, &mut note(owner(), "x")).await.unwrap();
        let err = ds
            .get::<Note>(&ctx, Key::new(Kind::Thread, key.id))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_transaction_buffers_until_commit() {
        let ds = Datastore::in_memory().unwrap();
        let ctx = Context::background();

        ds.begin(&ctx).unwrap();
        let key = ds.put(&ctx, &mut note(owner(), "pending")).await.unwrap();
        assert!(ds.get_opt::<Note>(&ctx, key).await.unwrap().is_none());
        let seen: Option<Note> = ds.get_in_tx(&ctx, key).await.unwrap();
        assert_eq!(seen.unwrap().body, "pending");

        ds.commit(&ctx).await.unwrap();
        assert!(ds.get_opt::<Note>(&ctx, key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_rollback_discards_writes() {
        let ds = Datastore::in_memory().unwrap();
        let ctx = Context::background();

        ds.begin(&ctx).unwrap();
        let key = ds.put(&ctx, &mut note(owner(), "gone")).await.unwrap();
        ds.rollback(&ctx).unwrap();
        assert!(ds.get_opt::<Note>(&ctx, key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_commit_detects_concurrent_write() {
        let ds = Datastore::in_memory().unwrap();
        let setup = Context::background();
        let key = ds.put(&setup, &mut note(owner(), "v1")).await.unwrap();

        let ctx = Context::background();
        ds.begin(&ctx).unwrap();
        let mut mine: Note = ds.get_in_tx(&ctx, key).await.unwrap().unwrap();

        // someone else writes in between
        let mut theirs: Note = ds.get(&setup, key).await.unwrap();
        theirs.body = "theirs".into();
        ds.put(&setup, &mut theirs).await.unwrap();

        mine.body = "mine".into();
        ds.put(&ctx, &mut mine).await.unwrap();
        let err = ds.commit(&ctx).await.unwrap_err();
        assert!(err.is_conflict());
        assert!(!ctx.in_transaction());

        let stored: Note = ds.get(&setup, key).await.unwrap();
        assert_eq!(stored.body, "theirs");
    }

    #[tokio::test]
    async fn test_run_in_transaction_retries_on_conflict() {
        let ds = Datastore::in_memory().unwrap();
        let setup = Context::background();
        let key = ds.put(&setup, &mut note(owner(), "0")).await.unwrap();

        let ctx = Context::background();
        let mut runs = 0;
        let result: Result<()> = ds
            .run_in_transaction(&ctx, |ctx| {
                runs += 1;
                let first = runs == 1;
                let ds = ds.clone();
                let setup = setup.clone();
                async move {
                    let mut n: Note = ds.get_in_tx(&ctx, key).await?.ok_or(StoreError::NotFound(key))?;
                    if first {
                        let mut other: Note = ds.get(&setup, key).await?;
                        other.body = "other".into();
                        ds.put(&setup, &mut other).await?;
                    }
                    n.body.push('!');
                    ds.put(&ctx, &mut n).await?;
                    Ok(())
                }
            })
            .await;
        result.unwrap();
        assert_eq!(runs, 2);
        let stored: Note = ds.get(&setup, key).await.unwrap();
        assert_eq!(stored.body, "other!");
    }

    #[tokio::test]
    async fn test_run_in_transaction_error_rolls_back() {
        let ds = Datastore::in_memory().unwrap();
        let ctx = Context::background();
        let result: Result<Key> = ds
            .run_in_transaction(&ctx, |ctx| {
                let ds = ds.clone();
                async move {
                    let key = ds.put(&ctx, &mut note(owner(), "x")).await?;
                    Err(StoreError::NotFound(key))
                }
            })
            .await;
        let key = match result {
            Err(StoreError::NotFound(key)) => key,
            other => panic!("unexpected {other:?}"),
        };
        assert!(!ctx.in_transaction());
        assert!(ds.get_opt::<Note>(&ctx, key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancelled_context_fails_fast() {
        let ds = Datastore::in_memory().unwrap();
        let ctx = Context::background();
        ctx.cancel();
        let err = ds.put(&ctx, &mut note(owner(), "x")).await.unwrap_err();
        assert!(matches!(err, StoreError::Cancelled));
    }

    #[tokio::test]
    async fn test_query_by_index() {
        let ds = Datastore::in_memory().unwrap();
        let ctx = Context::background();
        let other = Key::new(Kind::User, 2);
        ds.put(&ctx, &mut note(owner(), "a")).await.unwrap();
        ds.put(&ctx, &mut note(other, "b")).await.unwrap();
        ds.put(&ctx, &mut note(owner(), "c")).await.unwrap();

        let mine: Vec<Note> = ds
            .query(&ctx, &Query::of::<Note>().filter_key("owner", owner()))
            .await
            .unwrap();
        let bodies: Vec<_> = mine.iter().map(|n| n.body.as_str()).collect();
        assert_eq!(bodies, vec!["a", "c"]);
    }
}

use convo_shared::Key;

use crate::context::Context;
use crate::datastore::Datastore;
use crate::error::Result;
use crate::models::Thread;
use crate::query::Query;

impl Datastore {
    /// Threads `user` participates in, most recently updated first.
    pub async fn threads_for_user(&self, ctx: &Context, user: Key) -> Result<Vec<Thread>> {
        let mut threads: Vec<Thread> = self
            .query(ctx, &Query::of::<Thread>().filter_key("users", user))
            .await?;
        threads.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(threads)
    }

    /// Threads that reference `user` in any role.
    pub async fn threads_referencing(&self, ctx: &Context, user: Key) -> Result<Vec<Thread>> {
        let mut threads = self.threads_for_user(ctx, user).await?;
        let owned: Vec<Thread> = self
            .query(ctx, &Query::of::<Thread>().filter_key("owner", user))
            .await?;
        for thread in owned {
            if !threads.iter().any(|t| t.key == thread.key) {
                threads.push(thread);
            }
        }
        Ok(threads)
    }
}

use convo_shared::Key;

use crate::context::Context;
use crate::datastore::Datastore;
use crate::error::Result;
use crate::models::Note;
use crate::query::Query;

impl Datastore {
    pub async fn notes_by_owner(&self, ctx: &Context, owner: Key) -> Result<Vec<Note>> {
        self.query(ctx, &Query::of::<Note>().filter_key("owner", owner))
            .await
    }
}

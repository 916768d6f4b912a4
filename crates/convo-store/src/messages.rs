use convo_shared::Key;

use crate::context::Context;
use crate::datastore::Datastore;
use crate::error::Result;
use crate::models::Message;
use crate::query::Query;

impl Datastore {
    /// Messages under a thread or event, oldest first.
    pub async fn messages_for_parent(&self, ctx: &Context, parent: Key) -> Result<Vec<Message>> {
        let mut messages: Vec<Message> = self
            .query(ctx, &Query::of::<Message>().filter_key("parent", parent))
            .await?;
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.key.cmp(&b.key)));
        Ok(messages)
    }

    /// The `limit` newest messages under `parent`, oldest first.
    pub async fn recent_messages(
        &self,
        ctx: &Context,
        parent: Key,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let mut messages = self.messages_for_parent(ctx, parent).await?;
        let skip = messages.len().saturating_sub(limit);
        messages.drain(..skip);
        Ok(messages)
    }

    pub async fn messages_by_author(&self, ctx: &Context, author: Key) -> Result<Vec<Message>> {
        self.query(ctx, &Query::of::<Message>().filter_key("author", author))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use convo_shared::Kind;

    #[tokio::test]
    async fn test_messages_ordered_by_creation() {
        let ds = Datastore::in_memory().unwrap();
        let ctx = Context::background();
        let parent = Key::new(Kind::Thread, 1);
        let author = Key::new(Kind::User, 2);

        let mut second = Message::new(author, parent, "second");
        ds.put(&ctx, &mut second).await.unwrap();
        let mut first = Message::new(author, parent, "first");
        first.created_at = second.created_at - Duration::minutes(5);
        ds.put(&ctx, &mut first).await.unwrap();
        let mut third = Message::new(author, parent, "third");
        third.created_at = second.created_at + Duration::minutes(5);
        ds.put(&ctx, &mut third).await.unwrap();
        ds.put(&ctx, &mut Message::new(author, Key::new(Kind::Thread, 9), "elsewhere"))
            .await
            .unwrap();

        let all = ds.messages_for_parent(&ctx, parent).await.unwrap();
        let bodies: Vec<_> = all.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["first", "second", "third"]);

        let recent = ds.recent_messages(&ctx, parent, 2).await.unwrap();
        let bodies: Vec<_> = recent.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["second", "third"]);

        assert_eq!(ds.messages_by_author(&ctx, author).await.unwrap().len(), 4);
    }
}

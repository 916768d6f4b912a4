use convo_shared::Key;

use crate::context::Context;
use crate::datastore::Datastore;
use crate::error::Result;
use crate::models::Event;
use crate::query::Query;

impl Datastore {
    /// Events `user` participates in, soonest first.
    pub async fn events_for_user(&self, ctx: &Context, user: Key) -> Result<Vec<Event>> {
        let mut events: Vec<Event> = self
            .query(ctx, &Query::of::<Event>().filter_key("users", user))
            .await?;
        events.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(events)
    }

    pub async fn events_referencing(&self, ctx: &Context, user: Key) -> Result<Vec<Event>> {
        let mut events = self.events_for_user(ctx, user).await?;
        let owned: Vec<Event> = self
            .query(ctx, &Query::of::<Event>().filter_key("owner", user))
            .await?;
        for event in owned {
            if !events.iter().any(|e| e.key == event.key) {
                events.push(event);
            }
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::User;
    use chrono::{Duration, Utc};

    #[tokio::test]
    async fn test_events_for_user_soonest_first() {
        let ds = Datastore::in_memory().unwrap();
        let ctx = Context::background();
        let mut a = User::new("a@x.com");
        ds.put(&ctx, &mut a).await.unwrap();

        let now = Utc::now();
        let mut later = Event::new(&a, "later", now + Duration::days(3), now).unwrap();
        ds.put(&ctx, &mut later).await.unwrap();
        let mut sooner = Event::new(&a, "sooner", now + Duration::days(1), now).unwrap();
        ds.put(&ctx, &mut sooner).await.unwrap();

        let events = ds.events_for_user(&ctx, a.key.unwrap()).await.unwrap();
        let names: Vec<_> = events.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["sooner", "later"]);
    }
}

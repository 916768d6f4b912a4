use convo_shared::Key;

use crate::context::Context;
use crate::datastore::Datastore;
use crate::error::{Result, StoreError};
use crate::models::User;
use crate::query::Query;

impl Datastore {
    /// User whose primary address is `email`, falling back to one that has it
    /// as a verified auxiliary address. Two matches is an integrity failure.
    pub async fn user_by_email(&self, ctx: &Context, email: &str) -> Result<Option<User>> {
        let email = email.trim().to_lowercase();
        if email.is_empty() {
            return Ok(None);
        }
        let primary = self
            .unique_user(ctx, Query::of::<User>().filter("email", email.clone()), "email", &email)
            .await?;
        if primary.is_some() {
            return Ok(primary);
        }
        self.unique_user(ctx, Query::of::<User>().filter("emails", email.clone()), "emails", &email)
            .await
    }

    pub async fn user_by_token(&self, ctx: &Context, token: &str) -> Result<Option<User>> {
        if token.is_empty() {
            return Ok(None);
        }
        self.unique_user(ctx, Query::of::<User>().filter("token", token), "token", "<redacted>")
            .await
    }

    pub async fn user_by_google_id(&self, ctx: &Context, id: &str) -> Result<Option<User>> {
        self.unique_user(ctx, Query::of::<User>().filter("google_id", id), "google_id", id)
            .await
    }

    pub async fn user_by_facebook_id(&self, ctx: &Context, id: &str) -> Result<Option<User>> {
        self.unique_user(ctx, Query::of::<User>().filter("facebook_id", id), "facebook_id", id)
            .await
    }

    /// Users that list `contact` among their contacts.
    pub async fn users_with_contact(&self, ctx: &Context, contact: Key) -> Result<Vec<User>> {
        self.query(ctx, &Query::of::<User>().filter_key("contacts", contact))
            .await
    }

    pub async fn all_users(&self, ctx: &Context) -> Result<Vec<User>> {
        self.query(ctx, &Query::of::<User>()).await
    }

    async fn unique_user(
        &self,
        ctx: &Context,
        query: Query,
        property: &str,
        value: &str,
    ) -> Result<Option<User>> {
        let mut users: Vec<User> = self.query(ctx, &query.limit(2)).await?;
        match users.len() {
            0 => Ok(None),
            1 => Ok(users.pop()),
            _ => Err(StoreError::Integrity(format!(
                "more than one user with {property} = {value}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convo_shared::Kind;

    #[tokio::test]
    async fn test_lookup_by_primary_then_aux() {
        let ds = Datastore::in_memory().unwrap();
        let ctx = Context::background();

        let mut a = User::new("a@x.com");
        a.emails = vec!["a@x.com".into(), "alias@x.com".into()];
        ds.put(&ctx, &mut a).await.unwrap();

        let found = ds.user_by_email(&ctx, "A@X.com").await.unwrap().unwrap();
        assert_eq!(found.key, a.key);
        let found = ds.user_by_email(&ctx, "alias@x.com").await.unwrap().unwrap();
        assert_eq!(found.key, a.key);
        assert!(ds.user_by_email(&ctx, "nobody@x.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_email_is_integrity_error() {
        let ds = Datastore::in_memory().unwrap();
        let ctx = Context::background();
        ds.put(&ctx, &mut User::new("d@x.com")).await.unwrap();
        ds.put(&ctx, &mut User::new("d@x.com")).await.unwrap();
        let err = ds.user_by_email(&ctx, "d@x.com").await.unwrap_err();
        assert!(matches!(err, StoreError::Integrity(_)));
    }

    #[tokio::test]
    async fn test_lookup_by_token_and_contact() {
        let ds = Datastore::in_memory().unwrap();
        let ctx = Context::background();
        let mut a = User::new("a@x.com");
        ds.put(&ctx, &mut a).await.unwrap();
        let mut b = User::new("b@x.com");
        b.add_contact(a.key.unwrap());
        ds.put(&ctx, &mut b).await.unwrap();

        let by_token = ds.user_by_token(&ctx, &a.token).await.unwrap().unwrap();
        assert_eq!(by_token.key, a.key);
        assert!(ds.user_by_token(&ctx, "").await.unwrap().is_none());

        let with = ds.users_with_contact(&ctx, a.key.unwrap()).await.unwrap();
        assert_eq!(with.len(), 1);
        assert_eq!(with[0].key, b.key);
        assert!(ds
            .users_with_contact(&ctx, Key::new(Kind::User, 999))
            .await
            .unwrap()
            .is_empty());
    }
}

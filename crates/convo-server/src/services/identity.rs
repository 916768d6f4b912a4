//! User identity: lookup by e-mail, token and external ID; creation of
//! invitation shells; persistence with the derived fields and the search
//! index kept in step.

use chrono::Utc;
use convo_shared::constants::BCRYPT_COST;
use convo_shared::{Key, Kind};
use convo_store::{Context, User};
use serde::Deserialize;

use crate::clients::SearchEntry;
use crate::error::{alarm, OpExt, ServerError};
use crate::state::AppState;

const MIN_PASSWORD_LEN: usize = 8;

/// A user named by ID or by e-mail address. Accepts `{"id": ..}`,
/// `{"email": ..}` or a bare string, which is an address when it holds `@`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "RawUserRef")]
pub struct UserRef {
    pub id: Option<String>,
    pub email: Option<String>,
}

impl UserRef {
    pub fn id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            email: None,
        }
    }

    pub fn email(email: impl Into<String>) -> Self {
        Self {
            id: None,
            email: Some(email.into()),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawUserRef {
    Text(String),
    Object {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        email: Option<String>,
    },
}

impl From<RawUserRef> for UserRef {
    fn from(raw: RawUserRef) -> Self {
        match raw {
            RawUserRef::Text(text) if text.contains('@') => UserRef::email(text),
            RawUserRef::Text(text) => UserRef::id(text),
            RawUserRef::Object { id, email } => UserRef { id, email },
        }
    }
}

/// Users materialized from a list of [`UserRef`]s.
#[derive(Debug, Default)]
pub struct Resolved {
    pub users: Vec<User>,
    /// Shells created along the way; they are owed a welcome e-mail once the
    /// surrounding transaction commits.
    pub created: Vec<Key>,
}

pub async fn hash_password(password: &str) -> Result<String, ServerError> {
    validate_password(password)?;
    let password = password.to_string();
    tokio::task::spawn_blocking(move || bcrypt::hash(password, BCRYPT_COST))
        .await
        .map_err(|e| ServerError::Internal(format!("hashing task failed: {e}")))?
        .map_err(|e| ServerError::Internal(format!("bcrypt: {e}")))
}

/// Constant-time check inside bcrypt. A user without a password never
/// matches.
pub async fn check_password(digest: Option<&str>, password: &str) -> bool {
    let Some(digest) = digest.map(str::to_string) else {
        return false;
    };
    let password = password.to_string();
    tokio::task::spawn_blocking(move || bcrypt::verify(password, &digest).unwrap_or(false))
        .await
        .unwrap_or(false)
}

pub fn validate_password(password: &str) -> Result<(), ServerError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ServerError::invalid(
            "password",
            format!("Passwords must be at least {MIN_PASSWORD_LEN} characters"),
        ));
    }
    Ok(())
}

/// Trimmed, lowercased address, or a validation error on `email`.
pub fn normalize_email(email: &str) -> Result<String, ServerError> {
    let email = email.trim().to_lowercase();
    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !email.chars().any(char::is_whitespace)
                && !domain.contains('@')
        }
        None => false,
    };
    if !valid {
        return Err(ServerError::invalid("email", "Please enter a valid email address"));
    }
    Ok(email)
}

impl AppState {
    /// The user holding bearer `token`. Locked accounts are refused.
    pub async fn authenticate(&self, ctx: &Context, token: &str) -> Result<User, ServerError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(ServerError::unauthorized());
        }
        match self.ds.user_by_token(ctx, token).await? {
            Some(user) if user.locked => {
                tracing::info!(user = ?user.key, "locked user refused");
                Err(ServerError::Unauthorized("This account is locked".into()))
            }
            Some(user) => Ok(user),
            None => Err(ServerError::unauthorized()),
        }
    }

    pub async fn user_by_id(&self, ctx: &Context, id: &str) -> Result<User, ServerError> {
        let key = Key::decode_kind(id, Kind::User)?;
        self.ds
            .get_in_tx::<User>(ctx, key)
            .await?
            .ok_or_else(ServerError::not_found)
    }

    pub async fn user_by_email(&self, ctx: &Context, email: &str) -> Result<Option<User>, ServerError> {
        let email = normalize_email(email)?;
        self.ds
            .user_by_email(ctx, &email)
            .await
            .op(format!("identity.user_by_email(email={email})"))
    }

    /// The user holding `email`, or a new incomplete shell for it. The flag
    /// is true when the shell was created.
    pub async fn get_or_create_by_email(
        &self,
        ctx: &Context,
        email: &str,
    ) -> Result<(User, bool), ServerError> {
        let email = normalize_email(email)?;
        if let Some(user) = self
            .ds
            .user_by_email(ctx, &email)
            .await
            .op(format!("identity.get_or_create(email={email})"))?
        {
            return Ok((user, false));
        }
        let mut user = User::new_incomplete(&email);
        let key = self
            .commit_user(ctx, &mut user)
            .await
            .op(format!("identity.get_or_create(email={email})"))?;
        tracing::info!(user = %key, "created user from invitation");
        Ok((user, true))
    }

    /// Resolve `refs` in order, dropping duplicates. Unknown IDs are a
    /// not-found error; unknown addresses become shells.
    pub async fn get_or_create_users(
        &self,
        ctx: &Context,
        refs: &[UserRef],
    ) -> Result<Resolved, ServerError> {
        let mut resolved = Resolved::default();
        let mut seen_emails: Vec<String> = Vec::new();

        for r in refs {
            let user = match (&r.id, &r.email) {
                (Some(id), _) if !id.trim().is_empty() => self.user_by_id(ctx, id.trim()).await?,
                (_, Some(email)) => {
                    let email = normalize_email(email)?;
                    if seen_emails.contains(&email) {
                        continue;
                    }
                    seen_emails.push(email.clone());
                    let (user, created) = self.get_or_create_by_email(ctx, &email).await?;
                    if created {
                        resolved.created.extend(user.key);
                    }
                    user
                }
                _ => {
                    return Err(ServerError::invalid(
                        "users",
                        "Each person needs an id or an email address",
                    ))
                }
            };
            if !resolved.users.iter().any(|u| u.key == user.key) {
                resolved.users.push(user);
            }
        }
        Ok(resolved)
    }

    /// Normalize, assign a key on first save, persist, and keep the search
    /// index current for registered users.
    pub async fn commit_user(&self, ctx: &Context, user: &mut User) -> Result<Key, ServerError> {
        let now = Utc::now();
        if user.key.is_none() {
            let key = self
                .ds
                .allocate(ctx, Kind::User, 1)
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| ServerError::Internal("no key allocated".into()))?;
            user.key = Some(key);
            user.created_at = now;
        }
        user.normalize();
        user.updated_at = now;

        let key = user
            .key
            .ok_or_else(|| ServerError::Internal("user without key".into()))?;
        if user.realtime_token.is_empty() {
            match self.clients.push.realtime_token(&key.encode()).await {
                Ok(token) => user.realtime_token = token,
                Err(e) => alarm("identity.realtime_token", &e),
            }
        }

        self.ds
            .put(ctx, user)
            .await
            .op(format!("identity.commit(email={})", user.email))?;

        if user.registered {
            let entry = SearchEntry {
                id: key.encode(),
                full_name: user.full_name.clone(),
            };
            if let Err(e) = self.clients.search.upsert(&entry).await {
                alarm("identity.search_upsert", &e);
            }
        }
        Ok(key)
    }

    /// Drop `user` from the search index, then delete it under the open
    /// transaction.
    pub async fn delete_user_with_tx(&self, ctx: &Context, user: Key) -> Result<(), ServerError> {
        if let Err(e) = self.clients.search.remove(&user.encode()).await {
            alarm("identity.search_remove", &e);
        }
        self.ds.delete(ctx, user).await?;
        tracing::info!(user = %user, "user deleted");
        Ok(())
    }

    pub async fn search_users(&self, ctx: &Context, query: &str) -> Result<Vec<User>, ServerError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(ServerError::invalid("query", "Type a name to search for"));
        }
        let ids = self
            .clients
            .search
            .search(query, 20)
            .await
            .op("identity.search")?;
        let keys: Vec<Key> = ids
            .iter()
            .filter_map(|id| Key::decode_kind(id, Kind::User).ok())
            .collect();
        let users = self.ds.get_multi_opt::<User>(ctx, &keys).await?;
        Ok(users.into_iter().flatten().filter(|u| u.registered).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::testing::TestApp;

    #[test]
    fn test_user_ref_shapes() {
        let refs: Vec<UserRef> =
            serde_json::from_str(r#"[{"id":"abc"},{"email":"a@x.com"},"b@x.com","xyz"]"#).unwrap();
        assert_eq!(refs[0], UserRef::id("abc"));
        assert_eq!(refs[1], UserRef::email("a@x.com"));
        assert_eq!(refs[2], UserRef::email("b@x.com"));
        assert_eq!(refs[3], UserRef::id("xyz"));
    }

    #[test]
    fn test_normalize_email() {
        assert_eq!(normalize_email(" Bob@X.com ").unwrap(), "bob@x.com");
        assert!(normalize_email("bob").is_err());
        assert!(normalize_email("bob@localhost").is_err());
        assert!(normalize_email("b ob@x.com").is_err());
    }

    #[tokio::test]
    async fn test_password_roundtrip() {
        let digest = hash_password("correct horse").await.unwrap();
        assert!(check_password(Some(&digest), "correct horse").await);
        assert!(!check_password(Some(&digest), "wrong horse").await);
        assert!(!check_password(None, "correct horse").await);
        assert!(hash_password("short").await.is_err());
    }

    #[tokio::test]
    async fn test_get_or_create_dedupes_and_reports_created() {
        let app = TestApp::new().await;
        let ctx = Context::background();
        let ann = app.registered_user("ann@x.com", "Ann").await;

        let resolved = app
            .state
            .get_or_create_users(
                &ctx,
                &[
                    UserRef::id(ann.key.unwrap().encode()),
                    UserRef::email("New@X.com"),
                    UserRef::email("new@x.com"),
                    UserRef::email("ann@x.com"),
                ],
            )
            .await
            .unwrap();

        assert_eq!(resolved.users.len(), 2);
        assert_eq!(resolved.created.len(), 1);
        let shell = &resolved.users[1];
        assert_eq!(shell.email, "new@x.com");
        assert_eq!(shell.first_name, "New");
        assert!(!shell.verified);
        assert!(!shell.registered);
    }

    #[tokio::test]
    async fn test_commit_indexes_registered_users_only() {
        let app = TestApp::new().await;
        let ctx = Context::background();
        let ann = app.registered_user("ann@x.com", "Ann").await;
        let (shell, _) = app.state.get_or_create_by_email(&ctx, "shell@x.com").await.unwrap();

        assert!(app.search.contains(&ann.key.unwrap().encode()).await);
        assert!(!app.search.contains(&shell.key.unwrap().encode()).await);
        assert!(!ann.realtime_token.is_empty());
    }

    #[tokio::test]
    async fn test_authenticate() {
        let app = TestApp::new().await;
        let ctx = Context::background();
        let mut ann = app.registered_user("ann@x.com", "Ann").await;

        let found = app.state.authenticate(&ctx, &ann.token).await.unwrap();
        assert_eq!(found.key, ann.key);
        assert!(app.state.authenticate(&ctx, "nope").await.is_err());

        ann.locked = true;
        app.state.commit_user(&ctx, &mut ann).await.unwrap();
        let err = app.state.authenticate(&ctx, &ann.token).await.unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_delete_removes_from_index() {
        let app = TestApp::new().await;
        let ctx = Context::background();
        let ann = app.registered_user("ann@x.com", "Ann").await;
        let key = ann.key.unwrap();

        app.state.delete_user_with_tx(&ctx, key).await.unwrap();
        assert!(!app.search.contains(&key.encode()).await);
        assert!(app.state.ds.get_opt::<User>(&ctx, key).await.unwrap().is_none());
    }
}

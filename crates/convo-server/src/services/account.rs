//! Account flows: registration, sign-in (password, OAuth, magic link),
//! verification, password reset, preferences, addresses and contacts.
//!
//! Every magic link is bound to state that changes when it is used, so a
//! link works once: the reset salt is the password digest, the verify salt
//! flips when the address becomes verified, and login and unsubscribe links
//! die with the user token.

use chrono::Utc;
use convo_shared::magic::{reset_salt, token_salt, verify_salt, Action};
use convo_shared::{Key, Kind};
use convo_store::{Context, Event, Thread, User, UserPartial};
use serde::Deserialize;

use super::identity::{check_password, hash_password, normalize_email, Resolved, UserRef};
use super::worker::{recipient, Channel};
use crate::clients::blob_store::blob_path;
use crate::clients::{Provider, Recipient};
use crate::error::{alarm, OpExt, ServerError};
use crate::render;
use crate::state::AppState;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Registration {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OAuthLogin {
    pub provider: Provider,
    pub token: String,
}

/// The parts of a signed link that names a user.
#[derive(Debug, Clone, Deserialize)]
pub struct SignedUserLink {
    pub user: String,
    pub timestamp: String,
    pub signature: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmailVerification {
    pub user: String,
    pub email: String,
    pub timestamp: String,
    pub signature: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PasswordReset {
    pub user: String,
    pub timestamp: String,
    pub signature: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Unsubscribe {
    pub user: String,
    pub timestamp: String,
    pub signature: String,
    /// `threads`, `events` or `digest`; absent means all three.
    #[serde(default)]
    pub channel: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileUpdate {
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub send_digest: Option<bool>,
    #[serde(default)]
    pub send_threads: Option<bool>,
    #[serde(default)]
    pub send_events: Option<bool>,
}

fn provider_id(user: &User, provider: Provider) -> Option<&str> {
    match provider {
        Provider::Google => user.google_id.as_deref(),
        Provider::Facebook => user.facebook_id.as_deref(),
    }
}

fn set_provider_id(user: &mut User, provider: Provider, id: &str) {
    let id = Some(id.to_string());
    match provider {
        Provider::Google => user.google_id = id,
        Provider::Facebook => user.facebook_id = id,
    }
}

impl AppState {
    async fn load_user_in_tx(&self, ctx: &Context, key: Key) -> Result<User, ServerError> {
        self.ds
            .get_in_tx::<User>(ctx, key)
            .await?
            .ok_or_else(ServerError::not_found)
    }

    /// Re-read `actor` under a transaction, apply `f` and commit.
    async fn update_user<F>(&self, ctx: &Context, actor: &User, op: &str, f: F) -> Result<User, ServerError>
    where
        F: Fn(&mut User) -> Result<(), ServerError> + Sync,
    {
        let key = actor.key.ok_or_else(ServerError::unauthorized)?;
        let f = &f;
        self.ds
            .run_in_transaction(ctx, |ctx| async move {
                let mut user = self.load_user_in_tx(&ctx, key).await?;
                f(&mut user)?;
                self.commit_user(&ctx, &mut user).await?;
                Ok::<_, ServerError>(user)
            })
            .await
            .op(format!("{op}(user={key})"))
    }

    /// Create an account with a password. The address stays unverified until
    /// the emailed link is followed.
    pub async fn register(&self, ctx: &Context, input: &Registration) -> Result<User, ServerError> {
        let email = normalize_email(&input.email)?;
        let digest = hash_password(&input.password).await?;
        if self.ds.user_by_email(ctx, &email).await?.is_some() {
            return Err(ServerError::invalid(
                "email",
                "An account already exists for this address. Try signing in or resetting your password.",
            ));
        }

        let mut user = User::new(&email);
        user.first_name = input.first_name.clone();
        user.last_name = input.last_name.clone();
        user.password = Some(digest);
        let key = self
            .commit_user(ctx, &mut user)
            .await
            .op(format!("account.register(email={email})"))?;
        tracing::info!(user = %key, "user registered");

        if let Err(e) = self.send_verification(ctx, &user, &email).await {
            alarm("account.register.verification", &e);
        }
        Ok(user)
    }

    pub async fn login(&self, ctx: &Context, input: &Credentials) -> Result<User, ServerError> {
        let rejected = || ServerError::Unauthorized("Wrong e-mail or password".into());
        let email = normalize_email(&input.email)?;
        let Some(user) = self.ds.user_by_email(ctx, &email).await? else {
            return Err(rejected());
        };
        if !check_password(user.password.as_deref(), &input.password).await {
            tracing::debug!(user = ?user.key, "password rejected");
            return Err(rejected());
        }
        if user.locked {
            return Err(ServerError::Unauthorized("This account is locked".into()));
        }
        Ok(user)
    }

    /// Sign in with a provider token. The account is found by provider ID,
    /// then by the address the provider vouches for; a signed-in caller
    /// without a match links the provider to their own account, and anyone
    /// else gets a new account. When the caller and the match differ, the
    /// caller's account is merged into the match.
    pub async fn oauth_login(
        &self,
        ctx: &Context,
        input: &OAuthLogin,
        caller: Option<&User>,
    ) -> Result<User, ServerError> {
        let profile = self
            .clients
            .oauth
            .profile(input.provider, &input.token)
            .await
            .map_err(|e| {
                tracing::info!(provider = ?input.provider, error = %e, "oauth token refused");
                ServerError::Unauthorized("Sign-in with this provider failed".into())
            })?;
        if profile.id.is_empty() {
            return Err(ServerError::Unauthorized("Sign-in with this provider failed".into()));
        }
        let email = if profile.email.is_empty() {
            None
        } else {
            Some(normalize_email(&profile.email)?)
        };
        let provider = input.provider;
        let caller_key = caller.and_then(|c| c.key);
        let (profile, email) = (&profile, &email);

        let user = self
            .ds
            .run_in_transaction(ctx, |ctx| async move {
                let by_provider = match provider {
                    Provider::Google => self.ds.user_by_google_id(&ctx, &profile.id).await?,
                    Provider::Facebook => self.ds.user_by_facebook_id(&ctx, &profile.id).await?,
                };
                let found = match (by_provider, email) {
                    (Some(user), _) => Some(user),
                    (None, Some(email)) => self.ds.user_by_email(&ctx, email).await?,
                    (None, None) => None,
                };

                let mut user = match (found.and_then(|u| u.key), caller_key) {
                    (Some(key), _) => self.load_user_in_tx(&ctx, key).await?,
                    (None, Some(key)) => self.load_user_in_tx(&ctx, key).await?,
                    (None, None) => {
                        let email = email.as_deref().ok_or_else(|| {
                            ServerError::invalid("email", "The provider did not share an e-mail address")
                        })?;
                        User::new(email)
                    }
                };

                if provider_id(&user, provider).is_none() {
                    set_provider_id(&mut user, provider, &profile.id);
                }
                if let Some(email) = email {
                    let holder = self.ds.user_by_email(&ctx, email).await?;
                    if holder.is_none() || holder.and_then(|h| h.key) == user.key {
                        user.add_email(email);
                    }
                }
                if user.first_name.is_empty() && user.last_name.is_empty() {
                    user.first_name = profile.first_name.clone();
                    user.last_name = profile.last_name.clone();
                }
                if user.avatar_url.is_empty() {
                    user.avatar_url = profile.avatar_url.clone();
                }

                if let (Some(caller), Some(key)) = (caller_key, user.key) {
                    if caller != key {
                        let absorbed = self.load_user_in_tx(&ctx, caller).await?;
                        self.absorb(&ctx, &mut user, &absorbed).await?;
                    }
                }
                self.commit_user(&ctx, &mut user).await?;
                Ok::<_, ServerError>(user)
            })
            .await
            .op(format!("account.oauth(provider={provider:?})"))?;

        tracing::info!(user = ?user.key, provider = ?provider, "oauth sign-in");
        Ok(user)
    }

    /// Mail a verification link for `email` to that address.
    pub async fn send_verification(&self, _ctx: &Context, user: &User, email: &str) -> Result<(), ServerError> {
        let key = user.key.ok_or_else(ServerError::not_found)?;
        let email = normalize_email(email)?;
        let link = self.signer.mint(
            Action::Verify,
            &key.encode(),
            &verify_salt(&email, user.has_verified_email(&email)),
        );
        let url = link.url_with(&self.config.app_host, "email", &email);
        let to = Recipient {
            name: user.full_name.clone(),
            email: email.clone(),
        };
        self.send_system_mail(to, render::verification(&email, &url))
            .await
            .op("account.send_verification")
    }

    /// Resend the verification link for the primary address.
    pub async fn resend_verification(&self, ctx: &Context, actor: &User) -> Result<(), ServerError> {
        if actor.verified {
            return Err(ServerError::invalid("email", "This address is already verified"));
        }
        self.send_verification(ctx, actor, &actor.email).await
    }

    /// Follow a verification link. If another account holds the address, it
    /// is merged into this one.
    pub async fn verify_email(&self, ctx: &Context, input: &EmailVerification) -> Result<User, ServerError> {
        let key = Key::decode_kind(&input.user, Kind::User)?;
        let email = normalize_email(&input.email)?;
        let email = &email;
        let user = self
            .ds
            .run_in_transaction(ctx, |ctx| async move {
                let mut user = self.load_user_in_tx(&ctx, key).await?;
                self.signer.verify_fresh(
                    &input.user,
                    &input.timestamp,
                    &verify_salt(email, user.has_verified_email(email)),
                    &input.signature,
                    Utc::now(),
                )?;
                if let Some(holder) = self.ds.user_by_email(&ctx, email).await? {
                    if holder.key != Some(key) {
                        let absorbed = self
                            .ds
                            .get_in_tx::<User>(&ctx, holder.key.ok_or_else(ServerError::not_found)?)
                            .await?
                            .ok_or_else(ServerError::not_found)?;
                        self.absorb(&ctx, &mut user, &absorbed).await?;
                    }
                }
                user.add_email(email);
                self.commit_user(&ctx, &mut user).await?;
                Ok::<_, ServerError>(user)
            })
            .await
            .op(format!("account.verify(user={key})"))?;
        tracing::info!(user = %key, "address verified");
        Ok(user)
    }

    /// Mail a reset link. Unknown addresses succeed silently.
    pub async fn forgot_password(&self, ctx: &Context, email: &str) -> Result<(), ServerError> {
        let email = normalize_email(email)?;
        let Some(user) = self.ds.user_by_email(ctx, &email).await? else {
            tracing::debug!("password reset for unknown address");
            return Ok(());
        };
        let key = user.key.ok_or_else(ServerError::not_found)?;
        let url = self
            .signer
            .mint(Action::ResetPassword, &key.encode(), &reset_salt(user.password.as_deref()))
            .url(&self.config.app_host);
        self.send_system_mail(recipient(&user), render::password_reset(&url))
            .await
            .op("account.forgot")
    }

    /// Set a new password from a reset link. Reaching the link proves the
    /// primary address.
    pub async fn reset_password(&self, ctx: &Context, input: &PasswordReset) -> Result<User, ServerError> {
        let key = Key::decode_kind(&input.user, Kind::User)?;
        let digest = hash_password(&input.password).await?;
        let digest = &digest;
        let user = self
            .ds
            .run_in_transaction(ctx, |ctx| async move {
                let mut user = self.load_user_in_tx(&ctx, key).await?;
                self.signer.verify_fresh(
                    &input.user,
                    &input.timestamp,
                    &reset_salt(user.password.as_deref()),
                    &input.signature,
                    Utc::now(),
                )?;
                user.password = Some(digest.clone());
                let primary = user.email.clone();
                user.add_email(&primary);
                self.commit_user(&ctx, &mut user).await?;
                Ok::<_, ServerError>(user)
            })
            .await
            .op(format!("account.reset(user={key})"))?;
        tracing::info!(user = %key, "password reset");
        Ok(user)
    }

    /// The current password is required only when one is set.
    pub async fn change_password(
        &self,
        ctx: &Context,
        actor: &User,
        old_password: Option<&str>,
        password: &str,
    ) -> Result<User, ServerError> {
        if actor.password.is_some()
            && !check_password(actor.password.as_deref(), old_password.unwrap_or_default()).await
        {
            return Err(ServerError::invalid("old_password", "That is not your current password"));
        }
        let digest = hash_password(password).await?;
        self.update_user(ctx, actor, "account.change_password", |user| {
            user.password = Some(digest.clone());
            Ok(())
        })
        .await
    }

    /// Mail a sign-in link. Unknown addresses succeed silently.
    pub async fn send_magic_login(&self, ctx: &Context, email: &str) -> Result<(), ServerError> {
        let email = normalize_email(email)?;
        let Some(user) = self.ds.user_by_email(ctx, &email).await? else {
            tracing::debug!("magic link for unknown address");
            return Ok(());
        };
        if user.locked {
            return Ok(());
        }
        let key = user.key.ok_or_else(ServerError::not_found)?;
        let url = self
            .signer
            .mint(Action::MagicLogin, &key.encode(), &token_salt(&user.token))
            .url(&self.config.app_host);
        self.send_system_mail(recipient(&user), render::magic_login(&url))
            .await
            .op("account.send_magic")
    }

    /// Sign in through a magic link, which also proves the primary address.
    pub async fn consume_magic_login(&self, ctx: &Context, input: &SignedUserLink) -> Result<User, ServerError> {
        let key = Key::decode_kind(&input.user, Kind::User)?;
        let user = self
            .ds
            .run_in_transaction(ctx, |ctx| async move {
                let mut user = self.load_user_in_tx(&ctx, key).await?;
                self.signer.verify_fresh(
                    &input.user,
                    &input.timestamp,
                    &token_salt(&user.token),
                    &input.signature,
                    Utc::now(),
                )?;
                if user.locked {
                    return Err(ServerError::Unauthorized("This account is locked".into()));
                }
                if !user.verified {
                    let primary = user.email.clone();
                    user.add_email(&primary);
                    self.commit_user(&ctx, &mut user).await?;
                }
                Ok::<_, ServerError>(user)
            })
            .await
            .op(format!("account.magic(user={key})"))?;
        tracing::info!(user = %key, "signed in by magic link");
        Ok(user)
    }

    pub async fn unsubscribe(&self, ctx: &Context, input: &Unsubscribe) -> Result<User, ServerError> {
        let key = Key::decode_kind(&input.user, Kind::User)?;
        let channel = match input.channel.as_deref().filter(|c| !c.is_empty()) {
            Some(name) => Some(
                Channel::parse(name)
                    .ok_or_else(|| ServerError::invalid("channel", "Unknown e-mail type"))?,
            ),
            None => None,
        };
        let user = self
            .ds
            .run_in_transaction(ctx, |ctx| async move {
                let mut user = self.load_user_in_tx(&ctx, key).await?;
                self.signer.verify_fresh(
                    &input.user,
                    &input.timestamp,
                    &token_salt(&user.token),
                    &input.signature,
                    Utc::now(),
                )?;
                match channel {
                    Some(Channel::Threads) => user.send_threads = false,
                    Some(Channel::Events) => user.send_events = false,
                    Some(Channel::Digest) => user.send_digest = false,
                    None => {
                        user.send_threads = false;
                        user.send_events = false;
                        user.send_digest = false;
                    }
                }
                self.commit_user(&ctx, &mut user).await?;
                Ok::<_, ServerError>(user)
            })
            .await
            .op(format!("account.unsubscribe(user={key})"))?;
        tracing::info!(user = %key, channel = ?channel, "unsubscribed");
        Ok(user)
    }

    /// Names and mail preferences. A name change is copied into the
    /// participant lists that show it.
    pub async fn update_profile(&self, ctx: &Context, actor: &User, input: &ProfileUpdate) -> Result<User, ServerError> {
        let key = actor.key.ok_or_else(ServerError::unauthorized)?;
        let user = self
            .ds
            .run_in_transaction(ctx, |ctx| async move {
                let mut user = self.load_user_in_tx(&ctx, key).await?;
                let before = UserPartial::of(&user)?;
                if let Some(first_name) = &input.first_name {
                    user.first_name = first_name.trim().to_string();
                }
                if let Some(last_name) = &input.last_name {
                    user.last_name = last_name.trim().to_string();
                }
                if let Some(flag) = input.send_digest {
                    user.send_digest = flag;
                }
                if let Some(flag) = input.send_threads {
                    user.send_threads = flag;
                }
                if let Some(flag) = input.send_events {
                    user.send_events = flag;
                }
                self.commit_user(&ctx, &mut user).await?;
                let after = UserPartial::of(&user)?;
                if after != before {
                    self.refresh_partials(&ctx, &after).await?;
                }
                Ok::<_, ServerError>(user)
            })
            .await
            .op(format!("account.update(user={key})"))?;
        Ok(user)
    }

    /// Rewrite the denormalized profile copy in every thread and event that
    /// lists the user.
    async fn refresh_partials(&self, ctx: &Context, partial: &UserPartial) -> Result<(), ServerError> {
        for found in self.ds.threads_for_user(ctx, partial.id).await? {
            let Some(key) = found.key else { continue };
            if let Some(mut thread) = self.ds.get_in_tx::<Thread>(ctx, key).await? {
                if let Some(p) = thread.user_partials.iter_mut().find(|p| p.id == partial.id) {
                    *p = partial.clone();
                    self.ds.put(ctx, &mut thread).await?;
                }
            }
        }
        for found in self.ds.events_for_user(ctx, partial.id).await? {
            let Some(key) = found.key else { continue };
            if let Some(mut event) = self.ds.get_in_tx::<Event>(ctx, key).await? {
                if let Some(p) = event.user_partials.iter_mut().find(|p| p.id == partial.id) {
                    *p = partial.clone();
                    self.ds.put(ctx, &mut event).await?;
                }
            }
        }
        Ok(())
    }

    pub async fn upload_avatar(&self, ctx: &Context, actor: &User, data: &[u8]) -> Result<User, ServerError> {
        let key = actor.key.ok_or_else(ServerError::unauthorized)?;
        let path = blob_path(&format!("avatars/{}", key.encode()));
        let url = self
            .clients
            .blobs
            .put(&path, data)
            .await
            .op("account.upload_avatar")?;
        let url = &url;
        self.ds
            .run_in_transaction(ctx, |ctx| async move {
                let mut user = self.load_user_in_tx(&ctx, key).await?;
                user.avatar_url = url.clone();
                self.commit_user(&ctx, &mut user).await?;
                let partial = UserPartial::of(&user)?;
                self.refresh_partials(&ctx, &partial).await?;
                Ok::<_, ServerError>(user)
            })
            .await
            .op(format!("account.avatar(user={key})"))
    }

    /// Start verifying another address for `actor`.
    pub async fn add_email(&self, ctx: &Context, actor: &User, email: &str) -> Result<(), ServerError> {
        let email = normalize_email(email)?;
        if actor.has_verified_email(&email) {
            return Err(ServerError::invalid("email", "This address is already on your account"));
        }
        self.send_verification(ctx, actor, &email).await
    }

    pub async fn remove_email(&self, ctx: &Context, actor: &User, email: &str) -> Result<User, ServerError> {
        let email = normalize_email(email)?;
        self.update_user(ctx, actor, "account.remove_email", |user| {
            user.remove_email(&email)?;
            Ok(())
        })
        .await
    }

    pub async fn set_primary_email(&self, ctx: &Context, actor: &User, email: &str) -> Result<User, ServerError> {
        let email = normalize_email(email)?;
        self.update_user(ctx, actor, "account.set_primary", |user| {
            user.set_primary(&email)?;
            Ok(())
        })
        .await
    }

    /// `actor`'s contacts, most recent last.
    pub async fn list_contacts(&self, ctx: &Context, actor: &User) -> Result<Vec<User>, ServerError> {
        Ok(self
            .ds
            .get_multi_opt::<User>(ctx, &actor.contacts)
            .await?
            .into_iter()
            .flatten()
            .collect())
    }

    /// Add contacts by ID or address, creating shells for unknown addresses.
    pub async fn add_contacts(&self, ctx: &Context, actor: &User, refs: &[UserRef]) -> Result<Vec<User>, ServerError> {
        let key = actor.key.ok_or_else(ServerError::unauthorized)?;
        let (user, resolved) = self
            .ds
            .run_in_transaction(ctx, |ctx| async move {
                let resolved: Resolved = self.get_or_create_users(&ctx, refs).await?;
                let mut user = self.load_user_in_tx(&ctx, key).await?;
                for contact in &resolved.users {
                    if let Some(contact) = contact.key {
                        user.add_contact(contact);
                    }
                }
                self.commit_user(&ctx, &mut user).await?;
                Ok::<_, ServerError>((user, resolved))
            })
            .await
            .op(format!("account.add_contacts(user={key})"))?;
        self.enqueue_welcome(ctx, &resolved.created).await;
        self.list_contacts(ctx, &user).await
    }

    pub async fn add_contact(&self, ctx: &Context, actor: &User, contact_id: &str) -> Result<User, ServerError> {
        let contact = Key::decode_kind(contact_id, Kind::User)?;
        let _ = self.ds.get::<User>(ctx, contact).await?;
        self.update_user(ctx, actor, "account.add_contact", |user| {
            if !user.add_contact(contact) {
                return Err(ServerError::bad_request("You cannot add yourself as a contact"));
            }
            Ok(())
        })
        .await
    }

    pub async fn remove_contact(&self, ctx: &Context, actor: &User, contact_id: &str) -> Result<User, ServerError> {
        let contact = Key::decode_kind(contact_id, Kind::User)?;
        self.update_user(ctx, actor, "account.remove_contact", |user| {
            if !user.remove_contact(contact) {
                return Err(ServerError::not_found());
            }
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::events::NewEvent;
    use crate::state::testing::TestApp;
    use axum::http::StatusCode;
    use convo_shared::magic::MagicLink;

    fn signed(link: &MagicLink) -> SignedUserLink {
        SignedUserLink {
            user: link.subject.clone(),
            timestamp: link.timestamp.clone(),
            signature: link.signature.clone(),
        }
    }

    #[tokio::test]
    async fn test_register_then_login() {
        let app = TestApp::new().await;
        let ctx = Context::background();
        let input = Registration {
            email: "Ann@X.com".into(),
            password: "password1".into(),
            first_name: "ann".into(),
            last_name: String::new(),
        };
        let user = app.state.register(&ctx, &input).await.unwrap();
        assert_eq!(user.email, "ann@x.com");
        assert!(!user.verified);
        assert_eq!(app.mailbox.sent_to("ann@x.com").await.len(), 1);

        let err = app.state.register(&ctx, &input).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let ok = Credentials {
            email: "ann@x.com".into(),
            password: "password1".into(),
        };
        assert_eq!(app.state.login(&ctx, &ok).await.unwrap().key, user.key);
        let bad = Credentials {
            email: "ann@x.com".into(),
            password: "password2".into(),
        };
        let err = app.state.login(&ctx, &bad).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_short_password_rejected() {
        let app = TestApp::new().await;
        let input = Registration {
            email: "ann@x.com".into(),
            password: "short".into(),
            ..Registration::default()
        };
        let err = app.state.register(&Context::background(), &input).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_verify_link_works_once() {
        let app = TestApp::new().await;
        let ctx = Context::background();
        let input = Registration {
            email: "ann@x.com".into(),
            password: "password1".into(),
            first_name: "Ann".into(),
            last_name: String::new(),
        };
        let user = app.state.register(&ctx, &input).await.unwrap();
        let id = user.key.unwrap().encode();
        let link = app
            .state
            .signer
            .mint(Action::Verify, &id, &verify_salt("ann@x.com", false));
        let verification = EmailVerification {
            user: id,
            email: "ann@x.com".into(),
            timestamp: link.timestamp.clone(),
            signature: link.signature.clone(),
        };

        let user = app.state.verify_email(&ctx, &verification).await.unwrap();
        assert!(user.verified);
        assert!(user.registered);

        let err = app.state.verify_email(&ctx, &verification).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_verify_merges_holder_of_address() {
        let app = TestApp::new().await;
        let ctx = Context::background();
        let ann = app.registered_user("ann@x.com", "Ann").await;
        let carl = app.registered_user("carl@x.com", "Carl").await;
        let event = app
            .state
            .create_event(
                &ctx,
                &carl,
                &NewEvent {
                    name: "Party".into(),
                    description: String::new(),
                    timestamp: Utc::now() + chrono::Duration::days(1),
                    place_id: String::new(),
                    users: vec![UserRef::email("dup@x.com")],
                    guests_can_invite: false,
                },
            )
            .await
            .unwrap();
        let shell = app.state.user_by_email(&ctx, "dup@x.com").await.unwrap().unwrap();

        let id = ann.key.unwrap().encode();
        let link = app
            .state
            .signer
            .mint(Action::Verify, &id, &verify_salt("dup@x.com", false));
        let user = app
            .state
            .verify_email(
                &ctx,
                &EmailVerification {
                    user: id,
                    email: "dup@x.com".into(),
                    timestamp: link.timestamp,
                    signature: link.signature,
                },
            )
            .await
            .unwrap();
        assert!(user.has_verified_email("dup@x.com"));
        assert_eq!(user.email, "ann@x.com");

        let event: Event = app.state.ds.get(&ctx, event.key.unwrap()).await.unwrap();
        assert!(event.has_user(ann.key.unwrap()));
        assert!(!event.has_user(shell.key.unwrap()));
        assert!(app.state.ds.get_opt::<User>(&ctx, shell.key.unwrap()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reset_kills_older_links() {
        let app = TestApp::new().await;
        let ctx = Context::background();
        let ann = app.registered_user("ann@x.com", "Ann").await;
        let id = ann.key.unwrap().encode();
        let link = app
            .state
            .signer
            .mint(Action::ResetPassword, &id, &reset_salt(ann.password.as_deref()));
        let reset = PasswordReset {
            user: id,
            timestamp: link.timestamp,
            signature: link.signature,
            password: "new-password".into(),
        };
        app.state.reset_password(&ctx, &reset).await.unwrap();
        let err = app.state.reset_password(&ctx, &reset).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);

        let creds = Credentials {
            email: "ann@x.com".into(),
            password: "new-password".into(),
        };
        app.state.login(&ctx, &creds).await.unwrap();
    }

    #[tokio::test]
    async fn test_magic_login_verifies_shell() {
        let app = TestApp::new().await;
        let ctx = Context::background();
        let (shell, _) = app.state.get_or_create_by_email(&ctx, "new@x.com").await.unwrap();
        app.state.send_magic_login(&ctx, "new@x.com").await.unwrap();
        assert_eq!(app.mailbox.sent_to("new@x.com").await.len(), 1);

        let link = app.state.signer.mint(
            Action::MagicLogin,
            &shell.key.unwrap().encode(),
            &token_salt(&shell.token),
        );
        let user = app.state.consume_magic_login(&ctx, &signed(&link)).await.unwrap();
        assert!(user.verified);
        assert_eq!(user.token, shell.token);

        let mut forged = signed(&link);
        forged.user = Key::new(Kind::User, 999).encode();
        let err = app.state.consume_magic_login(&ctx, &forged).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unsubscribe_one_channel() {
        let app = TestApp::new().await;
        let ctx = Context::background();
        let ann = app.registered_user("ann@x.com", "Ann").await;
        let link = app.state.signer.mint(
            Action::Unsubscribe,
            &ann.key.unwrap().encode(),
            &token_salt(&ann.token),
        );
        let input = Unsubscribe {
            user: link.subject,
            timestamp: link.timestamp,
            signature: link.signature,
            channel: Some("digest".into()),
        };
        let user = app.state.unsubscribe(&ctx, &input).await.unwrap();
        assert!(!user.send_digest);
        assert!(user.send_threads);
        assert!(user.send_events);
    }

    #[tokio::test]
    async fn test_oauth_creates_then_finds() {
        let app = TestApp::new().await;
        let ctx = Context::background();
        let input = OAuthLogin {
            provider: Provider::Google,
            token: "google-token".into(),
        };
        let first = app.state.oauth_login(&ctx, &input, None).await.unwrap();
        assert_eq!(first.google_id.as_deref(), Some("g-1"));
        assert!(first.registered);
        assert_eq!(first.first_name, "Olive");

        let again = app.state.oauth_login(&ctx, &input, None).await.unwrap();
        assert_eq!(again.key, first.key);

        let bad = OAuthLogin {
            provider: Provider::Google,
            token: "nope".into(),
        };
        let err = app.state.oauth_login(&ctx, &bad, None).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_oauth_links_signed_in_caller() {
        let app = TestApp::new().await;
        let ctx = Context::background();
        let ann = app.registered_user("ann@x.com", "Ann").await;
        let input = OAuthLogin {
            provider: Provider::Google,
            token: "google-token".into(),
        };
        let user = app.state.oauth_login(&ctx, &input, Some(&ann)).await.unwrap();
        assert_eq!(user.key, ann.key);
        assert_eq!(user.google_id.as_deref(), Some("g-1"));
        assert!(user.has_verified_email("oauth@x.com"));
    }

    #[tokio::test]
    async fn test_profile_change_reaches_participant_lists() {
        let app = TestApp::new().await;
        let ctx = Context::background();
        let ann = app.registered_user("ann@x.com", "Ann").await;
        let thread = app
            .state
            .create_thread(&ctx, &ann, &crate::services::threads::NewThread::default(), None)
            .await
            .unwrap();
        let update = ProfileUpdate {
            last_name: Some("smith".into()),
            send_digest: Some(false),
            ..ProfileUpdate::default()
        };
        let user = app.state.update_profile(&ctx, &ann, &update).await.unwrap();
        assert_eq!(user.full_name, "Ann Smith");
        assert!(!user.send_digest);
        let thread: Thread = app.state.ds.get(&ctx, thread.key.unwrap()).await.unwrap();
        assert_eq!(thread.user_partials[0].full_name, "Ann Smith");
    }

    #[tokio::test]
    async fn test_contacts() {
        let app = TestApp::new().await;
        let ctx = Context::background();
        let ann = app.registered_user("ann@x.com", "Ann").await;
        let bob = app.registered_user("bob@x.com", "Bob").await;
        let bob_id = bob.key.unwrap().encode();

        let ann = app.state.add_contact(&ctx, &ann, &bob_id).await.unwrap();
        assert!(ann.has_contact(bob.key.unwrap()));
        let contacts = app
            .state
            .add_contacts(&ctx, &ann, &[UserRef::email("new@x.com")])
            .await
            .unwrap();
        assert_eq!(contacts.len(), 2);

        let ann = app.state.remove_contact(&ctx, &ann, &bob_id).await.unwrap();
        assert!(!ann.has_contact(bob.key.unwrap()));
        let err = app.state.remove_contact(&ctx, &ann, &bob_id).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);

        let own = ann.key.unwrap().encode();
        let err = app.state.add_contact(&ctx, &ann, &own).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }
}

//! One-shot signed links ("magic links").
//!
//! A link is `https://<host>/<action>/<subject>/<base64-ts>/<hex-sig>` where
//! the signature is HMAC-SHA256 over `subject || base64-ts || salt`, keyed by
//! the process secret. The salt is never part of the URL: it is a value bound
//! to the subject that changes whenever outstanding links must die (password
//! digest, user token, event invite token, ...).

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use url::form_urlencoded;

use crate::constants::MAGIC_LINK_TTL_SECS;
use crate::crypto;
use crate::error::MagicError;

/// What a magic link authorizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    ResetPassword,
    Verify,
    MagicLogin,
    Unsubscribe,
    Rsvp,
    Invite,
}

impl Action {
    pub fn path(&self) -> &'static str {
        match self {
            Action::ResetPassword => "reset",
            Action::Verify => "verify",
            Action::MagicLogin => "magic",
            Action::Unsubscribe => "unsubscribe",
            Action::Rsvp => "rsvp",
            Action::Invite => "invite",
        }
    }

    /// Whether the link expires after [`MAGIC_LINK_TTL_SECS`]. RSVP and invite
    /// links live until the event's invite token rotates or the event passes.
    pub fn is_time_bound(&self) -> bool {
        !matches!(self, Action::Rsvp | Action::Invite)
    }
}

/// A minted link, split into the parts a client posts back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MagicLink {
    pub action: Action,
    pub subject: String,
    pub timestamp: String,
    pub signature: String,
}

impl MagicLink {
    pub fn url(&self, host: &str) -> String {
        format!(
            "https://{}/{}/{}/{}/{}",
            host,
            self.action.path(),
            self.subject,
            self.timestamp,
            self.signature
        )
    }

    /// URL with an extra query parameter (the e-mail of a verify link, the
    /// event of an RSVP link).
    pub fn url_with(&self, host: &str, param: &str, value: &str) -> String {
        let query = form_urlencoded::Serializer::new(String::new())
            .append_pair(param, value)
            .finish();
        format!("{}?{query}", self.url(host))
    }
}

/// Mints and verifies magic links with the process-wide secret.
#[derive(Clone)]
pub struct MagicSigner {
    secret: Vec<u8>,
}

impl std::fmt::Debug for MagicSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MagicSigner").finish_non_exhaustive()
    }
}

impl MagicSigner {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    pub fn mint(&self, action: Action, subject: &str, salt: &str) -> MagicLink {
        self.mint_at(action, subject, salt, Utc::now())
    }

    pub fn mint_at(
        &self,
        action: Action,
        subject: &str,
        salt: &str,
        at: DateTime<Utc>,
    ) -> MagicLink {
        let timestamp = encode_timestamp(at);
        let signature = crypto::sign(
            &self.secret,
            &[subject.as_bytes(), timestamp.as_bytes(), salt.as_bytes()],
        );
        MagicLink {
            action,
            subject: subject.to_string(),
            timestamp,
            signature: hex::encode(signature),
        }
    }

    /// Check the signature only and return the decoded timestamp. Freshness
    /// is the caller's business (see [`MagicSigner::verify_fresh`]).
    pub fn verify(
        &self,
        subject: &str,
        timestamp: &str,
        salt: &str,
        signature: &str,
    ) -> Result<DateTime<Utc>, MagicError> {
        let sig = hex::decode(signature.trim())
            .map_err(|_| MagicError::Malformed("signature is not hex".into()))?;
        if !crypto::verify(
            &self.secret,
            &[subject.as_bytes(), timestamp.as_bytes(), salt.as_bytes()],
            &sig,
        ) {
            return Err(MagicError::InvalidSignature);
        }
        decode_timestamp(timestamp)
    }

    /// Signature check plus the 24-hour freshness rule.
    pub fn verify_fresh(
        &self,
        subject: &str,
        timestamp: &str,
        salt: &str,
        signature: &str,
        now: DateTime<Utc>,
    ) -> Result<(), MagicError> {
        let minted = self.verify(subject, timestamp, salt, signature)?;
        check_fresh(minted, now, Duration::seconds(MAGIC_LINK_TTL_SECS))
    }
}

pub fn check_fresh(
    minted: DateTime<Utc>,
    now: DateTime<Utc>,
    ttl: Duration,
) -> Result<(), MagicError> {
    if now - minted > ttl || minted - now > Duration::minutes(5) {
        return Err(MagicError::Expired);
    }
    Ok(())
}

pub fn encode_timestamp(at: DateTime<Utc>) -> String {
    URL_SAFE_NO_PAD.encode(at.timestamp().to_string())
}

pub fn decode_timestamp(encoded: &str) -> Result<DateTime<Utc>, MagicError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(encoded.trim())
        .map_err(|_| MagicError::Malformed("timestamp is not base64".into()))?;
    let secs: i64 = std::str::from_utf8(&bytes)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| MagicError::Malformed("timestamp is not a number".into()))?;
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| MagicError::Malformed("timestamp out of range".into()))
}

// ---------------------------------------------------------------------------
// Salts
// ---------------------------------------------------------------------------

/// Password reset: the current digest, so a reset kills older links.
pub fn reset_salt(password_digest: Option<&str>) -> String {
    password_digest.unwrap_or_default().to_string()
}

/// E-mail verification: the address plus whether it is already verified.
pub fn verify_salt(email: &str, has_email: bool) -> String {
    format!("{email}{has_email}")
}

/// Magic login and unsubscribe: the user's token.
pub fn token_salt(user_token: &str) -> String {
    user_token.to_string()
}

/// RSVP: the event invite token plus whether the event is past.
pub fn rsvp_salt(invite_token: &str, is_past: bool) -> String {
    format!("{invite_token}{is_past}")
}

/// Shareable event invite: the invite token alone.
pub fn invite_salt(invite_token: &str) -> String {
    invite_token.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> MagicSigner {
        MagicSigner::new(b"test-secret".to_vec())
    }

    #[test]
    fn test_mint_verify_roundtrip() {
        let s = signer();
        let link = s.mint(Action::MagicLogin, "abc", "salt");
        s.verify_fresh(&link.subject, &link.timestamp, "salt", &link.signature, Utc::now())
            .expect("fresh link verifies");
    }

    #[test]
    fn test_any_part_changed_fails() {
        let s = signer();
        let link = s.mint(Action::Verify, "abc", "salt");

        assert_eq!(
            s.verify("abd", &link.timestamp, "salt", &link.signature),
            Err(MagicError::InvalidSignature)
        );
        assert_eq!(
            s.verify("abc", &link.timestamp, "salu", &link.signature),
            Err(MagicError::InvalidSignature)
        );
        let other_ts = encode_timestamp(Utc::now() - Duration::seconds(1000));
        assert_eq!(
            s.verify("abc", &other_ts, "salt", &link.signature),
            Err(MagicError::InvalidSignature)
        );

        let mut sig = hex::decode(&link.signature).unwrap();
        sig[0] ^= 0x01;
        assert_eq!(
            s.verify("abc", &link.timestamp, "salt", &hex::encode(sig)),
            Err(MagicError::InvalidSignature)
        );
    }

    #[test]
    fn test_stale_link_rejected() {
        let s = signer();
        let minted = Utc::now() - Duration::hours(25);
        let link = s.mint_at(Action::ResetPassword, "abc", "", minted);
        assert_eq!(
            s.verify_fresh(&link.subject, &link.timestamp, "", &link.signature, Utc::now()),
            Err(MagicError::Expired)
        );
        // The signature itself is still valid.
        assert!(s.verify(&link.subject, &link.timestamp, "", &link.signature).is_ok());
    }

    #[test]
    fn test_url_shape() {
        let s = signer();
        let link = s.mint(Action::Rsvp, "sub", "tok");
        let url = link.url_with("convo.example", "event", "ev/1");
        assert!(url.starts_with("https://convo.example/rsvp/sub/"));
        assert!(url.ends_with("?event=ev%2F1"));

        let url = link.url_with("convo.example", "email", "ann+1@x.com");
        assert!(url.ends_with("?email=ann%2B1%40x.com"));
    }

    #[test]
    fn test_salts_change_with_state() {
        assert_ne!(verify_salt("a@b.c", false), verify_salt("a@b.c", true));
        assert_ne!(rsvp_salt("tok", false), rsvp_salt("tok", true));
        assert_eq!(reset_salt(None), "");
    }
}

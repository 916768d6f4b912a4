use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{check, transport};
use crate::error::ServerError;

const GOOGLE_USERINFO: &str = "https://www.googleapis.com/oauth2/v3/userinfo";
const FACEBOOK_ME: &str = "https://graph.facebook.com/me";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Google,
    Facebook,
}

/// Identity a provider vouches for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OAuthProfile {
    pub id: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub avatar_url: String,
}

#[async_trait]
pub trait OAuthProviders: Send + Sync {
    /// Exchange a provider access token for the profile it belongs to.
    async fn profile(&self, provider: Provider, access_token: &str) -> Result<OAuthProfile, ServerError>;
}

pub struct HttpOAuth {
    http: reqwest::Client,
}

impl HttpOAuth {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[derive(Deserialize)]
struct GoogleUser {
    sub: String,
    #[serde(default)]
    email: String,
    #[serde(default)]
    given_name: String,
    #[serde(default)]
    family_name: String,
    #[serde(default)]
    picture: String,
}

#[derive(Deserialize)]
struct FacebookUser {
    id: String,
    #[serde(default)]
    email: String,
    #[serde(default)]
    first_name: String,
    #[serde(default)]
    last_name: String,
    picture: Option<FacebookPicture>,
}

#[derive(Deserialize)]
struct FacebookPicture {
    data: FacebookPictureData,
}

#[derive(Deserialize)]
struct FacebookPictureData {
    url: String,
}

#[async_trait]
impl OAuthProviders for HttpOAuth {
    async fn profile(&self, provider: Provider, access_token: &str) -> Result<OAuthProfile, ServerError> {
        let request = match provider {
            Provider::Google => self.http.get(GOOGLE_USERINFO).bearer_auth(access_token),
            Provider::Facebook => self.http.get(FACEBOOK_ME).query(&[
                ("fields", "id,email,first_name,last_name,picture"),
                ("access_token", access_token),
            ]),
        };
        let response = request.send().await.map_err(transport("oauth"))?;
        if response.status() == reqwest::StatusCode::UNAUTHORIZED
            || response.status() == reqwest::StatusCode::BAD_REQUEST
        {
            return Err(ServerError::Unauthorized(
                "The sign-in provider rejected this login".into(),
            ));
        }
        let response = check("oauth", response).await?;
        let profile = match provider {
            Provider::Google => {
                let user: GoogleUser = response.json().await.map_err(transport("oauth"))?;
                OAuthProfile {
                    id: user.sub,
                    email: user.email,
                    first_name: user.given_name,
                    last_name: user.family_name,
                    avatar_url: user.picture,
                }
            }
            Provider::Facebook => {
                let user: FacebookUser = response.json().await.map_err(transport("oauth"))?;
                OAuthProfile {
                    id: user.id,
                    email: user.email,
                    first_name: user.first_name,
                    last_name: user.last_name,
                    avatar_url: user.picture.map(|p| p.data.url).unwrap_or_default(),
                }
            }
        };
        Ok(profile)
    }
}

/// Fixed access tokens, for tests and offline development.
#[derive(Default)]
pub struct StaticOAuth {
    profiles: HashMap<(Provider, String), OAuthProfile>,
}

impl StaticOAuth {
    pub fn with(mut self, provider: Provider, access_token: &str, profile: OAuthProfile) -> Self {
        self.profiles.insert((provider, access_token.to_string()), profile);
        self
    }
}

#[async_trait]
impl OAuthProviders for StaticOAuth {
    async fn profile(&self, provider: Provider, access_token: &str) -> Result<OAuthProfile, ServerError> {
        self.profiles
            .get(&(provider, access_token.to_string()))
            .cloned()
            .ok_or_else(|| ServerError::Unauthorized("The sign-in provider rejected this login".into()))
    }
}

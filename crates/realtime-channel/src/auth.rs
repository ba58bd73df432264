use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::AuthError;

/// Source of the bearer token sent to the channel-auth endpoint. Read once
/// per handshake so a token refreshed elsewhere is picked up on reconnect.
pub trait CredentialProvider: Send + Sync {
    fn bearer_token(&self) -> Option<String>;
}

impl<F> CredentialProvider for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    fn bearer_token(&self) -> Option<String> {
        (self)()
    }
}

#[derive(Debug, Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl CredentialProvider for StaticToken {
    fn bearer_token(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

/// Token slot shared with whatever refreshes the user's session.
#[derive(Debug, Clone, Default)]
pub struct SharedToken {
    inner: Arc<RwLock<Option<String>>>,
}

impl SharedToken {
    pub fn new(token: impl Into<String>) -> Self {
        let shared = Self::default();
        shared.set(token);
        shared
    }

    pub fn set(&self, token: impl Into<String>) {
        *self.inner.write() = Some(token.into());
    }

    pub fn clear(&self) {
        *self.inner.write() = None;
    }
}

impl CredentialProvider for SharedToken {
    fn bearer_token(&self) -> Option<String> {
        self.inner.read().clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthRequest {
    pub socket_id: String,
    pub channel_name: String,
}

/// Signed authorization for one `(channel, socket_id)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelAuthGrant {
    pub auth: String,
    pub channel_data: Option<String>,
}

#[async_trait]
pub trait ChannelAuthorizer: Send + Sync {
    async fn authorize(
        &self,
        request: &AuthRequest,
        bearer_token: &str,
    ) -> Result<ChannelAuthGrant, AuthError>;
}

#[derive(Debug, Deserialize)]
struct RawGrant {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    channel_data: Option<String>,
}

/// Calls the backend's `POST /broadcasting/auth` route.
#[derive(Debug, Clone)]
pub struct HttpChannelAuthorizer {
    http: Client,
    endpoint: Url,
}

impl HttpChannelAuthorizer {
    pub fn new(endpoint: Url, timeout: Duration) -> Result<Self, AuthError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self { http, endpoint })
    }
}

#[async_trait]
impl ChannelAuthorizer for HttpChannelAuthorizer {
    async fn authorize(
        &self,
        request: &AuthRequest,
        bearer_token: &str,
    ) -> Result<ChannelAuthGrant, AuthError> {
        let res = self
            .http
            .post(self.endpoint.clone())
            .bearer_auth(bearer_token)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(request)
            .send()
            .await?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(AuthError::UnexpectedStatus { status, body });
        }

        let grant = res.json::<RawGrant>().await?;
        match grant.auth {
            Some(auth) if !auth.is_empty() => Ok(ChannelAuthGrant {
                auth,
                channel_data: grant.channel_data,
            }),
            _ => Err(AuthError::MissingGrant),
        }
    }
}

//! Access tokens for the warehouse API.
//!
//! Tokens come from one of three places: a token handed to the process
//! directly, a local `authorized_user` key file (what `gcloud auth
//! application-default login` writes), or the metadata server available
//! inside managed deployments.

use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, instrument};

use crate::{WarehouseError, map_transport_error};

pub const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
pub const OAUTH_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Cached tokens are refreshed this long before they expire.
const EXPIRY_MARGIN_SECS: i64 = 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenSource {
    Static(String),
    AuthorizedUser {
        client_id: String,
        client_secret: String,
        refresh_token: String,
        token_url: String,
    },
    Metadata {
        token_url: String,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum KeyFile {
    AuthorizedUser {
        client_id: String,
        client_secret: String,
        refresh_token: String,
    },
    ServiceAccount {
        #[serde(default)]
        client_email: String,
    },
}

impl TokenSource {
    pub fn metadata() -> Self {
        Self::Metadata {
            token_url: METADATA_TOKEN_URL.to_string(),
        }
    }

    pub fn from_key_file(path: &Path) -> Result<Self, WarehouseError> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            WarehouseError::Credentials(format!(
                "failed reading key file '{}': {err}",
                path.display()
            ))
        })?;
        Self::from_key_json(&raw)
    }

    pub fn from_key_json(raw: &str) -> Result<Self, WarehouseError> {
        let key: KeyFile = serde_json::from_str(raw)
            .map_err(|err| WarehouseError::Credentials(format!("invalid key file: {err}")))?;
        match key {
            KeyFile::AuthorizedUser {
                client_id,
                client_secret,
                refresh_token,
            } => Ok(Self::AuthorizedUser {
                client_id,
                client_secret,
                refresh_token,
                token_url: OAUTH_TOKEN_URL.to_string(),
            }),
            KeyFile::ServiceAccount { client_email } => Err(WarehouseError::Credentials(format!(
                "service account key files are not supported (account '{client_email}'); \
                 provide an access token or an authorized_user key file instead"
            ))),
        }
    }

    /// Points the token exchange at another endpoint. No effect on static
    /// tokens.
    pub fn with_token_url(self, url: impl Into<String>) -> Self {
        match self {
            Self::Static(token) => Self::Static(token),
            Self::AuthorizedUser {
                client_id,
                client_secret,
                refresh_token,
                ..
            } => Self::AuthorizedUser {
                client_id,
                client_secret,
                refresh_token,
                token_url: url.into(),
            },
            Self::Metadata { .. } => Self::Metadata {
                token_url: url.into(),
            },
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Static(_) => "static",
            Self::AuthorizedUser { .. } => "authorized_user",
            Self::Metadata { .. } => "metadata",
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: Option<DateTime<Utc>>,
}

impl CachedToken {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => now + Duration::seconds(EXPIRY_MARGIN_SECS) < expires_at,
            None => true,
        }
    }
}

/// Shared token cache. One instance lives as long as the client that owns it.
#[derive(Debug)]
pub struct AccessTokenCache {
    source: TokenSource,
    cached: RwLock<Option<CachedToken>>,
}

impl AccessTokenCache {
    pub fn new(source: TokenSource) -> Self {
        Self {
            source,
            cached: RwLock::new(None),
        }
    }

    pub async fn bearer(&self, http: &reqwest::Client) -> Result<String, WarehouseError> {
        if let TokenSource::Static(token) = &self.source {
            return Ok(token.clone());
        }

        {
            let guard = self.cached.read().await;
            if let Some(cached) = guard.as_ref()
                && cached.is_fresh(Utc::now())
            {
                return Ok(cached.token.clone());
            }
        }

        let mut guard = self.cached.write().await;
        if let Some(cached) = guard.as_ref()
            && cached.is_fresh(Utc::now())
        {
            return Ok(cached.token.clone());
        }
        let fetched = self.fetch(http).await?;
        let token = fetched.token.clone();
        *guard = Some(fetched);
        Ok(token)
    }

    #[instrument(skip(self, http), fields(source = self.source.kind()))]
    async fn fetch(&self, http: &reqwest::Client) -> Result<CachedToken, WarehouseError> {
        let request = match &self.source {
            TokenSource::Static(token) => {
                return Ok(CachedToken {
                    token: token.clone(),
                    expires_at: None,
                });
            }
            TokenSource::AuthorizedUser {
                client_id,
                client_secret,
                refresh_token,
                token_url,
            } => http.post(token_url).form(&[
                ("grant_type", "refresh_token"),
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
                ("refresh_token", refresh_token.as_str()),
            ]),
            TokenSource::Metadata { token_url } => {
                http.get(token_url).header("Metadata-Flavor", "Google")
            }
        };

        let response = request.send().await.map_err(map_transport_error)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(WarehouseError::Credentials(format!(
                "token endpoint returned {status}: {body}"
            )));
        }
        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|err| WarehouseError::Serialization(err.to_string()))?;
        debug!(expires_in = ?parsed.expires_in, "fetched access token");
        Ok(CachedToken {
            token: parsed.access_token,
            expires_at: parsed
                .expires_in
                .map(|seconds| Utc::now() + Duration::seconds(seconds)),
        })
    }
}

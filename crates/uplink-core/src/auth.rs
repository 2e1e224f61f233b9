//! Bearer-token authentication with refresh.
//!
//! [`TokenAuth`] keeps a [`TokenSet`] in memory, mirrors it to a JSON file so
//! it survives restarts, and refreshes the ID token through
//! `POST {base}/auth/refresh` when it is within the refresh buffer of expiry.
//! A refresh that fails clears the stored tokens; the next upload run then
//! reports `Unauthenticated` until the user logs in again.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use uplink_types::EpochMillis;

use crate::backoff::{BackoffPolicy, with_retry};
use crate::error::{Error, Result};
use crate::traits::AuthProvider;
use crate::util::now_millis;

/// Refresh tokens this long before they expire.
pub const DEFAULT_REFRESH_BUFFER: Duration = Duration::from_secs(5 * 60);

/// Stored credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSet {
    /// Token presented to the ingestion API.
    pub id_token: String,
    /// Token exchanged for a new ID token.
    pub refresh_token: String,
    /// Expiry of the ID token in epoch milliseconds.
    pub expires_at: EpochMillis,
}

impl TokenSet {
    /// Whether the ID token expires within `buffer` of `now`.
    pub fn needs_refresh(&self, now: EpochMillis, buffer: Duration) -> bool {
        let buffer_ms = i64::try_from(buffer.as_millis()).unwrap_or(i64::MAX);
        now.saturating_add(buffer_ms) >= self.expires_at
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    id_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_in: i64,
}

/// [`AuthProvider`] backed by a persisted [`TokenSet`].
pub struct TokenAuth {
    client: Client,
    base_url: String,
    timeout: Duration,
    token_file: Option<PathBuf>,
    refresh_buffer: Duration,
    tokens: Mutex<Option<TokenSet>>,
}

impl std::fmt::Debug for TokenAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenAuth")
            .field("base_url", &self.base_url)
            .field("token_file", &self.token_file)
            .finish_non_exhaustive()
    }
}

impl TokenAuth {
    /// Create a provider holding `tokens` in memory only.
    pub fn new(base_url: &str, timeout: Duration, tokens: Option<TokenSet>) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::invalid_config(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
            token_file: None,
            refresh_buffer: DEFAULT_REFRESH_BUFFER,
            tokens: Mutex::new(tokens),
        })
    }

    /// Create a provider persisted to `token_file`, loading any tokens
    /// already stored there.
    pub fn load(base_url: &str, timeout: Duration, token_file: &Path) -> Result<Self> {
        let tokens = read_token_file(token_file)?;
        let mut auth = Self::new(base_url, timeout, tokens)?;
        auth.token_file = Some(token_file.to_path_buf());
        Ok(auth)
    }

    /// Set how long before expiry tokens are refreshed.
    #[must_use]
    pub fn refresh_buffer(mut self, buffer: Duration) -> Self {
        self.refresh_buffer = buffer;
        self
    }

    /// Current tokens, if any.
    pub async fn tokens(&self) -> Option<TokenSet> {
        self.tokens.lock().await.clone()
    }

    /// Exchange credentials for tokens and store them.
    pub async fn login(&self, email: &str, password: &str) -> Result<()> {
        let url = format!("{}/auth/login", self.base_url);
        let response = self
            .post_json(&url, LoginRequest { email, password })
            .await?;
        let refresh_token = response
            .refresh_token
            .clone()
            .ok_or_else(|| Error::Serialization("login response without refreshToken".into()))?;
        self.store(TokenSet {
            id_token: response.id_token,
            refresh_token,
            expires_at: now_millis().saturating_add(response.expires_in.saturating_mul(1000)),
        })
        .await?;
        info!("Logged in as {}", email);
        Ok(())
    }

    /// Forget the stored tokens.
    pub async fn logout(&self) -> Result<()> {
        *self.tokens.lock().await = None;
        if let Some(path) = &self.token_file {
            if path.exists() {
                std::fs::remove_file(path).map_err(|e| {
                    Error::invalid_config(format!("remove {}: {}", path.display(), e))
                })?;
            }
        }
        Ok(())
    }

    /// Refresh the ID token if it is within the refresh buffer of expiry.
    ///
    /// Returns whether a usable token is available afterwards.
    pub async fn refresh_if_needed(&self) -> bool {
        let current = match self.tokens().await {
            Some(tokens) => tokens,
            None => return false,
        };

        if !current.needs_refresh(now_millis(), self.refresh_buffer) {
            return true;
        }

        debug!("ID token near expiry, refreshing");
        let url = format!("{}/auth/refresh", self.base_url);
        let refreshed = with_retry(&BackoffPolicy::quick(), 2, "token refresh", || {
            self.post_json(
                &url,
                RefreshRequest {
                    refresh_token: &current.refresh_token,
                },
            )
        })
        .await;

        match refreshed {
            Ok(response) => {
                let tokens = TokenSet {
                    id_token: response.id_token,
                    refresh_token: response.refresh_token.unwrap_or(current.refresh_token),
                    expires_at: now_millis()
                        .saturating_add(response.expires_in.saturating_mul(1000)),
                };
                match self.store(tokens).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("Refreshed token could not be persisted: {}", e);
                        true
                    }
                }
            }
            Err(e) => {
                warn!("Token refresh failed, logging out: {}", e);
                if let Err(e) = self.logout().await {
                    warn!("Failed to clear tokens: {}", e);
                }
                false
            }
        }
    }

    async fn store(&self, tokens: TokenSet) -> Result<()> {
        let persisted = match &self.token_file {
            Some(path) => write_token_file(path, &tokens),
            None => Ok(()),
        };
        *self.tokens.lock().await = Some(tokens);
        persisted
    }

    async fn post_json<B: Serialize>(&self, url: &str, body: B) -> Result<TokenResponse> {
        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::timeout(format!("POST {url}"), self.timeout)
                } else {
                    Error::network(url, e.to_string())
                }
            })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(Error::Unauthenticated);
        }
        if !status.is_success() {
            return Err(Error::Api {
                status: status.as_u16(),
                message: status.to_string(),
            });
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| Error::Serialization(e.to_string()))
    }
}

fn read_token_file(path: &Path) -> Result<Option<TokenSet>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::invalid_config(format!("read {}: {}", path.display(), e)))?;
    Ok(Some(serde_json::from_str(&content)?))
}

fn write_token_file(path: &Path, tokens: &TokenSet) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::invalid_config(format!("create {}: {}", parent.display(), e)))?;
        }
    }

    let content = serde_json::to_string_pretty(tokens)?;
    std::fs::write(path, content)
        .map_err(|e| Error::invalid_config(format!("write {}: {}", path.display(), e)))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
    }

    Ok(())
}

#[async_trait]
impl AuthProvider for TokenAuth {
    async fn is_logged_in(&self) -> bool {
        self.tokens.lock().await.is_some()
    }

    async fn authorization_header(&self) -> Option<String> {
        if !self.refresh_if_needed().await {
            return None;
        }
        self.tokens()
            .await
            .map(|t| format!("Bearer {}", t.id_token))
    }
}

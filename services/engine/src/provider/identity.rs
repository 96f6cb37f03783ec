//! Azure Resource Manager access tokens
//!
//! Tokens come from Microsoft Entra ID, either with a client secret or a
//! federated (workload identity) token, with the Azure CLI as a fallback for
//! local use. Tokens are cached until shortly before they expire.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

const ARM_SCOPE: &str = "https://management.azure.com/.default";
const AUTHORITY: &str = "https://login.microsoftonline.com";
/// Refresh this long before the reported expiry
const EXPIRY_MARGIN: Duration = Duration::from_secs(120);

/// Bearer token with its expiry. The token never appears in Debug output.
#[derive(Clone)]
pub struct AccessToken {
    token: String,
    expires_at: Instant,
}

impl AccessToken {
    pub fn new(token: String, expires_in: Duration) -> Self {
        Self {
            token,
            expires_at: Instant::now() + expires_in,
        }
    }

    pub fn secret(&self) -> &str {
        &self.token
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() + EXPIRY_MARGIN >= self.expires_at
    }

    pub fn time_until_expiry(&self) -> Duration {
        self.expires_at
            .checked_duration_since(Instant::now())
            .unwrap_or(Duration::ZERO)
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"[REDACTED]")
            .field("expires_in", &self.time_until_expiry())
            .finish()
    }
}

/// How a token is obtained
#[derive(Clone)]
pub enum TokenStrategy {
    ClientSecret {
        tenant_id: String,
        client_id: String,
        client_secret: String,
    },
    FederatedToken {
        tenant_id: String,
        client_id: String,
        token_file: PathBuf,
    },
    AzureCli,
    /// Fixed token, for tests and pre-acquired tokens
    Static(String),
}

impl TokenStrategy {
    fn label(&self) -> &'static str {
        match self {
            TokenStrategy::ClientSecret { .. } => "client_secret",
            TokenStrategy::FederatedToken { .. } => "federated_token",
            TokenStrategy::AzureCli => "azure_cli",
            TokenStrategy::Static(_) => "static",
        }
    }
}

impl std::fmt::Debug for TokenStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Credentials picked up from the command line or environment
#[derive(Debug, Clone, Default)]
pub struct TokenSettings {
    pub tenant_id: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub federated_token_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CliTokenResponse {
    access_token: String,
    /// Unix seconds; older CLI versions only report a local timestamp
    #[serde(default, rename = "expires_on")]
    expires_on: Option<i64>,
}

/// Caching source of ARM bearer tokens
pub struct TokenSource {
    http_client: reqwest::Client,
    strategy: TokenStrategy,
    cached: Mutex<Option<AccessToken>>,
}

impl TokenSource {
    pub fn new(strategy: TokenStrategy) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http_client,
            strategy,
            cached: Mutex::new(None),
        })
    }

    /// Pick a strategy: client secret, then federated token file, then the
    /// Azure CLI.
    pub fn from_settings(settings: TokenSettings) -> Result<Self> {
        let strategy = match (settings.tenant_id, settings.client_id) {
            (Some(tenant_id), Some(client_id)) => {
                if let Some(client_secret) = settings.client_secret {
                    TokenStrategy::ClientSecret {
                        tenant_id,
                        client_id,
                        client_secret,
                    }
                } else if let Some(token_file) = settings.federated_token_file {
                    TokenStrategy::FederatedToken {
                        tenant_id,
                        client_id,
                        token_file,
                    }
                } else {
                    TokenStrategy::AzureCli
                }
            }
            _ => TokenStrategy::AzureCli,
        };

        info!(strategy = strategy.label(), "Selected Azure token strategy");
        Self::new(strategy)
    }

    pub fn strategy(&self) -> &TokenStrategy {
        &self.strategy
    }

    /// A valid token, fetched again if the cached one is about to expire
    pub async fn token(&self) -> Result<AccessToken> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if !token.is_expired() {
                return Ok(token.clone());
            }
        }

        let token = self.acquire().await?;
        debug!(
            strategy = self.strategy.label(),
            expires_in_secs = token.time_until_expiry().as_secs(),
            "Acquired ARM access token"
        );
        *cached = Some(token.clone());
        Ok(token)
    }

    async fn acquire(&self) -> Result<AccessToken> {
        match &self.strategy {
            TokenStrategy::ClientSecret {
                tenant_id,
                client_id,
                client_secret,
            } => {
                let form = [
                    ("grant_type", "client_credentials"),
                    ("client_id", client_id.as_str()),
                    ("client_secret", client_secret.as_str()),
                    ("scope", ARM_SCOPE),
                ];
                self.exchange(tenant_id, &form).await
            }
            TokenStrategy::FederatedToken {
                tenant_id,
                client_id,
                token_file,
            } => {
                let assertion = tokio::fs::read_to_string(token_file)
                    .await
                    .with_context(|| format!("Failed to read federated token from {}", token_file.display()))?;
                let form = [
                    ("grant_type", "client_credentials"),
                    ("client_id", client_id.as_str()),
                    (
                        "client_assertion_type",
                        "urn:ietf:params:oauth:client-assertion-type:jwt-bearer",
                    ),
                    ("client_assertion", assertion.trim()),
                    ("scope", ARM_SCOPE),
                ];
                self.exchange(tenant_id, &form).await
            }
            TokenStrategy::AzureCli => azure_cli_token().await,
            TokenStrategy::Static(token) => Ok(AccessToken::new(
                token.clone(),
                Duration::from_secs(24 * 3600),
            )),
        }
    }

    async fn exchange(&self, tenant_id: &str, form: &[(&str, &str)]) -> Result<AccessToken> {
        let token_url = format!("{}/{}/oauth2/v2.0/token", AUTHORITY, tenant_id);

        let response = self
            .http_client
            .post(&token_url)
            .form(form)
            .send()
            .await
            .context("Failed to call Microsoft Entra ID")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Microsoft Entra ID token request failed with {}: {}", status, body);
        }

        let token: TokenResponse = response
            .json()
            .await
            .context("Invalid Microsoft Entra ID token response")?;

        Ok(AccessToken::new(
            token.access_token,
            Duration::from_secs(token.expires_in.unwrap_or(3600)),
        ))
    }
}

/// Fall back to the Azure CLI login for local development
async fn azure_cli_token() -> Result<AccessToken> {
    let output = tokio::process::Command::new("az")
        .args([
            "account",
            "get-access-token",
            "--resource",
            "https://management.azure.com/",
            "--output",
            "json",
        ])
        .output()
        .await
        .context("Failed to run az CLI")?;

    if !output.status.success() {
        anyhow::bail!(
            "az account get-access-token failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    parse_cli_token(&output.stdout, chrono::Utc::now().timestamp())
}

fn parse_cli_token(stdout: &[u8], now_unix: i64) -> Result<AccessToken> {
    let parsed: CliTokenResponse =
        serde_json::from_slice(stdout).context("Invalid az CLI token output")?;

    let expires_in = parsed
        .expires_on
        .map(|at| Duration::from_secs(at.saturating_sub(now_unix).max(0) as u64))
        .unwrap_or(Duration::from_secs(3600));

    Ok(AccessToken::new(parsed.access_token, expires_in))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_expiry() {
        let token = AccessToken::new("t".to_string(), Duration::from_secs(3600));
        assert!(!token.is_expired());
        assert!(token.time_until_expiry() > Duration::from_secs(3500));

        // Inside the refresh margin counts as expired
        let token = AccessToken::new("t".to_string(), Duration::from_secs(60));
        assert!(token.is_expired());
    }

    #[test]
    fn test_token_debug_is_redacted() {
        let token = AccessToken::new("super-secret".to_string(), Duration::from_secs(3600));
        assert!(!format!("{:?}", token).contains("super-secret"));
    }

    #[test]
    fn test_strategy_selection_order() {
        let settings = TokenSettings {
            tenant_id: Some("tenant".to_string()),
            client_id: Some("client".to_string()),
            client_secret: Some("secret".to_string()),
            federated_token_file: Some(PathBuf::from("/var/run/token")),
        };
        let source = TokenSource::from_settings(settings.clone()).unwrap();
        assert!(matches!(source.strategy(), TokenStrategy::ClientSecret { .. }));

        let source = TokenSource::from_settings(TokenSettings {
            client_secret: None,
            ..settings.clone()
        })
        .unwrap();
        assert!(matches!(source.strategy(), TokenStrategy::FederatedToken { .. }));

        let source = TokenSource::from_settings(TokenSettings {
            client_id: None,
            ..settings
        })
        .unwrap();
        assert!(matches!(source.strategy(), TokenStrategy::AzureCli));
    }

    #[test]
    fn test_parse_cli_token() {
        let stdout = br#"{"accessToken":"abc","expiresOn":"2026-01-01 10:00:00.000000"}"#;
        let token = parse_cli_token(stdout, 0).unwrap();
        assert_eq!(token.secret(), "abc");
        assert!(token.time_until_expiry() > Duration::from_secs(3500));

        let stdout = br#"{"accessToken":"abc","expires_on":1000}"#;
        let token = parse_cli_token(stdout, 100).unwrap();
        assert!(token.time_until_expiry() > Duration::from_secs(800));
    }

    #[tokio::test]
    async fn test_static_token_is_cached() {
        let source = TokenSource::new(TokenStrategy::Static("fixed".to_string())).unwrap();
        let first = source.token().await.unwrap();
        let second = source.token().await.unwrap();
        assert_eq!(first.secret(), "fixed");
        assert_eq!(second.secret(), "fixed");
    }
}

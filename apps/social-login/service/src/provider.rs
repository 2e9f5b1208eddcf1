use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::Config;
use crate::oauth2_exchange::OAuth2Adapter;
use crate::twitter::TwitterAdapter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Facebook,
    Google,
    Instagram,
    Twitter,
}

impl Provider {
    pub const ALL: [Provider; 4] = [
        Provider::Facebook,
        Provider::Google,
        Provider::Instagram,
        Provider::Twitter,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Facebook => "facebook",
            Self::Google => "google",
            Self::Instagram => "instagram",
            Self::Twitter => "twitter",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported social provider '{0}'")]
pub struct UnknownProvider(pub String);

impl FromStr for Provider {
    type Err = UnknownProvider;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "facebook" => Ok(Self::Facebook),
            "google" => Ok(Self::Google),
            "instagram" => Ok(Self::Instagram),
            "twitter" => Ok(Self::Twitter),
            other => Err(UnknownProvider(other.to_string())),
        }
    }
}

/// Normalized identity returned by a provider exchange. Never persisted as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalProfile {
    pub provider: Provider,
    pub external_id: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub access_token: String,
    pub access_secret: Option<String>,
}

/// Proof that the user approved access at the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Grant {
    AuthorizationCode(String),
    OAuth1Verifier {
        oauth_token: String,
        oauth_verifier: String,
        request_secret: String,
    },
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{provider} exchange failed: {detail}")]
pub struct ProviderError {
    pub provider: Provider,
    pub transient: bool,
    /// Human-readable message the provider itself returned, safe to show verbatim.
    pub provider_message: Option<String>,
    pub detail: String,
}

impl ProviderError {
    pub fn network(provider: Provider, error: &reqwest::Error) -> Self {
        Self {
            provider,
            transient: error.is_timeout() || error.is_connect(),
            provider_message: None,
            detail: format!("unable to contact provider: {error}"),
        }
    }

    pub fn status(provider: Provider, status: reqwest::StatusCode, body: &Value) -> Self {
        Self {
            provider,
            transient: status.is_server_error(),
            provider_message: provider_message(body),
            detail: format!("unexpected response status {status}"),
        }
    }

    pub fn malformed(provider: Provider, detail: impl Into<String>) -> Self {
        Self {
            provider,
            transient: false,
            provider_message: None,
            detail: detail.into(),
        }
    }

    pub fn unavailable(provider: Provider) -> Self {
        Self::malformed(provider, "provider credentials are not configured")
    }

    pub fn with_provider_message(mut self, body: &Value) -> Self {
        if self.provider_message.is_none() {
            self.provider_message = provider_message(body);
        }
        self
    }
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider(&self) -> Provider;

    async fn exchange(
        &self,
        grant: &Grant,
        redirect_target: &str,
    ) -> Result<ExternalProfile, ProviderError>;
}

/// Single dispatch table from [`Provider`] to its adapter.
#[derive(Clone)]
pub struct ProviderRegistry {
    facebook: Arc<dyn ProviderAdapter>,
    google: Arc<dyn ProviderAdapter>,
    instagram: Arc<dyn ProviderAdapter>,
    twitter: Arc<TwitterAdapter>,
}

impl ProviderRegistry {
    pub fn from_config(config: &Config) -> Self {
        let http = http_client(config.provider_timeout_ms);

        Self {
            facebook: Arc::new(OAuth2Adapter::from_config(
                Provider::Facebook,
                &config.facebook,
                &config.grant_type,
                http.clone(),
            )),
            google: Arc::new(OAuth2Adapter::from_config(
                Provider::Google,
                &config.google,
                &config.grant_type,
                http.clone(),
            )),
            instagram: Arc::new(OAuth2Adapter::from_config(
                Provider::Instagram,
                &config.instagram,
                &config.grant_type,
                http.clone(),
            )),
            twitter: Arc::new(TwitterAdapter::from_config(
                &config.twitter,
                &config.redirect_url,
                http,
            )),
        }
    }

    pub fn adapter(&self, provider: Provider) -> Arc<dyn ProviderAdapter> {
        match provider {
            Provider::Facebook => self.facebook.clone(),
            Provider::Google => self.google.clone(),
            Provider::Instagram => self.instagram.clone(),
            Provider::Twitter => self.twitter.clone() as Arc<dyn ProviderAdapter>,
        }
    }

    /// The OAuth1 adapter, which also owns the request-token half of the handshake.
    pub fn twitter(&self) -> &TwitterAdapter {
        &self.twitter
    }
}

fn http_client(timeout_ms: u64) -> reqwest::Client {
    match reqwest::Client::builder()
        .timeout(Duration::from_millis(timeout_ms))
        .build()
    {
        Ok(client) => client,
        Err(error) => {
            tracing::warn!(
                target: "social_login.provider",
                error = %error,
                "failed to build provider http client; falling back to defaults",
            );
            reqwest::Client::new()
        }
    }
}

/// Parses a provider response body that is expected to be JSON.
pub(crate) async fn read_json_body(
    provider: Provider,
    response: reqwest::Response,
) -> Result<(reqwest::StatusCode, Value), ProviderError> {
    let status = response.status();
    let raw = response
        .text()
        .await
        .map_err(|error| ProviderError::network(provider, &error))?;

    match serde_json::from_str::<Value>(&raw) {
        Ok(body) => Ok((status, body)),
        Err(error) => Err(ProviderError {
            provider,
            transient: status.is_server_error(),
            provider_message: None,
            detail: format!("response body is not valid JSON ({status}): {error}"),
        }),
    }
}

/// Human-readable error a provider placed in its response body, if any.
pub(crate) fn provider_message(body: &Value) -> Option<String> {
    [
        body.get("error_description"),
        body.get("error_message"),
        body.get("error").and_then(|error| error.get("message")),
    ]
    .into_iter()
    .flatten()
    .filter_map(Value::as_str)
    .find(|message| !message.is_empty())
    .map(ToString::to_string)
}

/// Non-empty trimmed string at `value`.
pub(crate) fn json_string(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}

/// Provider ids arrive as strings or bare numbers depending on the API.
pub(crate) fn json_id(value: Option<&Value>) -> Option<String> {
    match value {
        Some(Value::Number(number)) => Some(number.to_string()),
        other => json_string(other),
    }
}

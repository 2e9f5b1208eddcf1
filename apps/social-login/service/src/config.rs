use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8788";
const DEFAULT_LOG_FILTER: &str = "info";
const DEFAULT_GRANT_TYPE: &str = "authorization_code";
const DEFAULT_PROVIDER_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_FACEBOOK_OAUTH_URL: &str = "https://graph.facebook.com/v2.9/oauth/access_token";
const DEFAULT_FACEBOOK_PROFILE_URL: &str = "https://graph.facebook.com/v2.9/me";
const DEFAULT_GOOGLE_OAUTH_URL: &str = "https://www.googleapis.com/oauth2/v4/token";
const DEFAULT_GOOGLE_PROFILE_URL: &str = "https://www.googleapis.com/oauth2/v1/userinfo";
const DEFAULT_INSTAGRAM_OAUTH_URL: &str = "https://api.instagram.com/oauth/access_token";
const DEFAULT_INSTAGRAM_PROFILE_URL: &str = "https://api.instagram.com/v1/users/self";
const DEFAULT_TWITTER_API_BASE_URL: &str = "https://api.twitter.com";
const DEFAULT_SIGN_IN_TOKEN_ISSUER: &str = "social-login-service";
const DEFAULT_SIGN_IN_TOKEN_AUDIENCE: &str = "social-login";
const DEFAULT_SIGN_IN_TOKEN_KEY_ID: &str = "sign-in-v1";
const DEFAULT_SIGN_IN_TOKEN_TTL_SECONDS: u32 = 3600;

/// Client credentials and endpoints for one OAuth2 code-exchange provider.
#[derive(Debug, Clone)]
pub struct OAuth2ProviderConfig {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub oauth_url: String,
    pub profile_url: String,
}

impl OAuth2ProviderConfig {
    /// Both halves of the client credential pair, when configured.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.client_id.as_deref(), self.client_secret.as_deref()) {
            (Some(id), Some(secret)) => Some((id, secret)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TwitterConfig {
    pub consumer_key: Option<String>,
    pub consumer_secret: Option<String>,
    pub api_base_url: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub log_filter: String,
    pub redirect_url: String,
    pub grant_type: String,
    pub provider_timeout_ms: u64,
    pub facebook: OAuth2ProviderConfig,
    pub google: OAuth2ProviderConfig,
    pub instagram: OAuth2ProviderConfig,
    pub twitter: TwitterConfig,
    pub identity_store_path: Option<PathBuf>,
    pub user_store_path: Option<PathBuf>,
    pub sign_in_token_signing_key: Option<String>,
    pub sign_in_token_issuer: String,
    pub sign_in_token_audience: String,
    pub sign_in_token_key_id: String,
    pub sign_in_token_ttl_seconds: u32,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid SOCIAL_LOGIN_BIND_ADDR value '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
    #[error("invalid {name} value '{value}': expected a positive integer")]
    InvalidNumber { name: &'static str, value: String },
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_addr_raw = non_empty_var("SOCIAL_LOGIN_BIND_ADDR")
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());

        let bind_addr = bind_addr_raw
            .parse()
            .map_err(|source| ConfigError::InvalidBindAddr {
                value: bind_addr_raw,
                source,
            })?;

        let log_filter = non_empty_var("SOCIAL_LOGIN_LOG_FILTER")
            .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

        let redirect_url = non_empty_var("SOCIAL_LOGIN_REDIRECT_URL").unwrap_or_default();

        let grant_type = non_empty_var("SOCIAL_LOGIN_GRANT_TYPE")
            .unwrap_or_else(|| DEFAULT_GRANT_TYPE.to_string());

        let provider_timeout_ms = parse_number(
            "SOCIAL_LOGIN_PROVIDER_TIMEOUT_MS",
            DEFAULT_PROVIDER_TIMEOUT_MS,
        )?;

        let facebook = oauth2_provider_from_env(
            "FACEBOOK",
            DEFAULT_FACEBOOK_OAUTH_URL,
            DEFAULT_FACEBOOK_PROFILE_URL,
        );
        let google = oauth2_provider_from_env(
            "GOOGLE",
            DEFAULT_GOOGLE_OAUTH_URL,
            DEFAULT_GOOGLE_PROFILE_URL,
        );
        let instagram = oauth2_provider_from_env(
            "INSTAGRAM",
            DEFAULT_INSTAGRAM_OAUTH_URL,
            DEFAULT_INSTAGRAM_PROFILE_URL,
        );

        let twitter = TwitterConfig {
            consumer_key: non_empty_var("TWITTER_CONSUMER_KEY"),
            consumer_secret: non_empty_var("TWITTER_CONSUMER_SECRET"),
            api_base_url: non_empty_var("TWITTER_API_BASE_URL")
                .unwrap_or_else(|| DEFAULT_TWITTER_API_BASE_URL.to_string()),
        };

        let identity_store_path = non_empty_var("SOCIAL_LOGIN_STORE_PATH").map(PathBuf::from);
        let user_store_path = non_empty_var("SOCIAL_LOGIN_USER_STORE_PATH").map(PathBuf::from);

        let sign_in_token_signing_key = non_empty_var("SIGN_IN_TOKEN_SIGNING_KEY");

        let sign_in_token_issuer = non_empty_var("SIGN_IN_TOKEN_ISSUER")
            .unwrap_or_else(|| DEFAULT_SIGN_IN_TOKEN_ISSUER.to_string());

        let sign_in_token_audience = non_empty_var("SIGN_IN_TOKEN_AUDIENCE")
            .unwrap_or_else(|| DEFAULT_SIGN_IN_TOKEN_AUDIENCE.to_string());

        let sign_in_token_key_id = non_empty_var("SIGN_IN_TOKEN_KEY_ID")
            .unwrap_or_else(|| DEFAULT_SIGN_IN_TOKEN_KEY_ID.to_string());

        let sign_in_token_ttl_seconds =
            parse_number("SIGN_IN_TOKEN_TTL_SECONDS", DEFAULT_SIGN_IN_TOKEN_TTL_SECONDS)?;

        Ok(Self {
            bind_addr,
            log_filter,
            redirect_url,
            grant_type,
            provider_timeout_ms,
            facebook,
            google,
            instagram,
            twitter,
            identity_store_path,
            user_store_path,
            sign_in_token_signing_key,
            sign_in_token_issuer,
            sign_in_token_audience,
            sign_in_token_key_id,
            sign_in_token_ttl_seconds,
        })
    }
}

#[cfg(test)]
impl Config {
    /// Fixture with every provider configured against the given endpoints.
    #[must_use]
    pub fn for_tests(provider_base_url: &str) -> Self {
        let base = provider_base_url.trim_end_matches('/');
        let oauth2 = |name: &str| OAuth2ProviderConfig {
            client_id: Some(format!("{name}-client-id")),
            client_secret: Some(format!("{name}-client-secret")),
            oauth_url: format!("{base}/{name}/token"),
            profile_url: format!("{base}/{name}/me"),
        };

        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            log_filter: "debug".to_string(),
            redirect_url: "https://app.example.test/social-redirect".to_string(),
            grant_type: DEFAULT_GRANT_TYPE.to_string(),
            provider_timeout_ms: 2_000,
            facebook: oauth2("facebook"),
            google: oauth2("google"),
            instagram: oauth2("instagram"),
            twitter: TwitterConfig {
                consumer_key: Some("twitter-consumer-key".to_string()),
                consumer_secret: Some("twitter-consumer-secret".to_string()),
                api_base_url: format!("{base}/twitter"),
            },
            identity_store_path: None,
            user_store_path: None,
            sign_in_token_signing_key: Some("sign-in-test-signing-key".to_string()),
            sign_in_token_issuer: "https://social-login.test".to_string(),
            sign_in_token_audience: "social-login-test".to_string(),
            sign_in_token_key_id: "sign-in-test-v1".to_string(),
            sign_in_token_ttl_seconds: 300,
        }
    }
}

fn oauth2_provider_from_env(
    prefix: &str,
    default_oauth_url: &str,
    default_profile_url: &str,
) -> OAuth2ProviderConfig {
    OAuth2ProviderConfig {
        client_id: non_empty_var(&format!("{prefix}_CLIENT_ID")),
        client_secret: non_empty_var(&format!("{prefix}_CLIENT_SECRET")),
        oauth_url: non_empty_var(&format!("{prefix}_OAUTH_URL"))
            .unwrap_or_else(|| default_oauth_url.to_string()),
        profile_url: non_empty_var(&format!("{prefix}_PROFILE_URL"))
            .unwrap_or_else(|| default_profile_url.to_string()),
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_number<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default,
{
    positive_number(name, non_empty_var(name), default)
}

/// Values that overflow `T` or are not positive are rejected, never clamped.
fn positive_number<T>(name: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default,
{
    match raw {
        None => Ok(default),
        Some(value) => value
            .parse::<T>()
            .ok()
            .filter(|parsed| *parsed > T::default())
            .ok_or(ConfigError::InvalidNumber { name, value }),
    }
}

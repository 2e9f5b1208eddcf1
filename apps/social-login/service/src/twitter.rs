//! OAuth 1.0a login against Twitter.
//!
//! Unlike the code-exchange providers this takes two inbound requests: the
//! first obtains a request token and sends the user to Twitter, the second
//! trades the returned verifier (plus the request secret saved in between)
//! for an access token and reads the profile with it.

use std::collections::HashMap;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha1::Sha1;
use uuid::Uuid;

use crate::config::TwitterConfig;
use crate::provider::{
    ExternalProfile, Grant, Provider, ProviderAdapter, ProviderError, json_id, json_string,
    read_json_body,
};

type HmacSha1 = Hmac<Sha1>;

const REQUEST_TOKEN_PATH: &str = "/oauth/request_token";
const ACCESS_TOKEN_PATH: &str = "/oauth/access_token";
const AUTHENTICATE_PATH: &str = "/oauth/authenticate";
const VERIFY_CREDENTIALS_PATH: &str = "/1.1/account/verify_credentials.json";

#[derive(Debug, Clone)]
struct ConsumerCredentials {
    key: String,
    secret: String,
}

#[derive(Debug, Clone)]
pub struct TwitterAdapter {
    consumer: Option<ConsumerCredentials>,
    callback_url: String,
    api_base_url: String,
    http: reqwest::Client,
}

/// Temporary credentials issued at the start of the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestToken {
    pub token: String,
    pub secret: String,
}

/// Token pair plus the extra OAuth protocol parameters for one signed call.
#[derive(Debug, Clone, Copy, Default)]
struct SigningContext<'a> {
    token: Option<&'a str>,
    token_secret: Option<&'a str>,
    oauth_params: &'a [(&'a str, &'a str)],
}

impl TwitterAdapter {
    pub fn from_config(config: &TwitterConfig, callback_url: &str, http: reqwest::Client) -> Self {
        let consumer = match (config.consumer_key.as_ref(), config.consumer_secret.as_ref()) {
            (Some(key), Some(secret)) => Some(ConsumerCredentials {
                key: key.clone(),
                secret: secret.clone(),
            }),
            _ => None,
        };

        Self {
            consumer,
            callback_url: callback_url.to_string(),
            api_base_url: config.api_base_url.trim_end_matches('/').to_string(),
            http,
        }
    }

    fn consumer(&self) -> Result<&ConsumerCredentials, ProviderError> {
        self.consumer
            .as_ref()
            .ok_or_else(|| ProviderError::unavailable(Provider::Twitter))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base_url, path)
    }

    pub async fn request_token(&self) -> Result<RequestToken, ProviderError> {
        let consumer = self.consumer()?;
        let context = SigningContext {
            oauth_params: &[("oauth_callback", self.callback_url.as_str())],
            ..SigningContext::default()
        };
        let fields = self
            .signed_token_post(consumer, REQUEST_TOKEN_PATH, context)
            .await?;

        match (
            non_empty_field(&fields, "oauth_token"),
            non_empty_field(&fields, "oauth_token_secret"),
        ) {
            (Some(token), Some(secret)) => Ok(RequestToken { token, secret }),
            _ => Err(ProviderError::malformed(
                Provider::Twitter,
                "request token response is incomplete",
            )),
        }
    }

    /// Where the user approves the request token.
    pub fn authenticate_url(&self, request_token: &str) -> String {
        format!(
            "{}?oauth_token={}",
            self.url(AUTHENTICATE_PATH),
            urlencoding::encode(request_token)
        )
    }

    async fn access_token(
        &self,
        consumer: &ConsumerCredentials,
        oauth_token: &str,
        request_secret: &str,
        oauth_verifier: &str,
    ) -> Result<(String, String), ProviderError> {
        let context = SigningContext {
            token: Some(oauth_token),
            token_secret: Some(request_secret),
            oauth_params: &[("oauth_verifier", oauth_verifier)],
        };
        let fields = self
            .signed_token_post(consumer, ACCESS_TOKEN_PATH, context)
            .await?;

        match (
            non_empty_field(&fields, "oauth_token"),
            non_empty_field(&fields, "oauth_token_secret"),
        ) {
            (Some(token), Some(secret)) => Ok((token, secret)),
            _ => Err(ProviderError::malformed(
                Provider::Twitter,
                "access token response is incomplete",
            )),
        }
    }

    async fn verify_credentials(
        &self,
        consumer: &ConsumerCredentials,
        access_token: &str,
        access_secret: &str,
    ) -> Result<Value, ProviderError> {
        let url = self.url(VERIFY_CREDENTIALS_PATH);
        let query = [("include_email", "true")];
        let context = SigningContext {
            token: Some(access_token),
            token_secret: Some(access_secret),
            oauth_params: &[],
        };
        let header = authorization_header(
            consumer,
            "GET",
            &url,
            &query,
            context,
            &nonce(),
            Utc::now().timestamp(),
        )?;

        let response = self
            .http
            .get(&url)
            .query(&query)
            .header(reqwest::header::AUTHORIZATION, header)
            .send()
            .await
            .map_err(|error| ProviderError::network(Provider::Twitter, &error))?;

        let (status, body) = read_json_body(Provider::Twitter, response).await?;
        if !status.is_success() {
            return Err(ProviderError::status(Provider::Twitter, status, &body));
        }
        Ok(body)
    }

    async fn signed_token_post(
        &self,
        consumer: &ConsumerCredentials,
        path: &str,
        context: SigningContext<'_>,
    ) -> Result<HashMap<String, String>, ProviderError> {
        let url = self.url(path);
        let header = authorization_header(
            consumer,
            "POST",
            &url,
            &[],
            context,
            &nonce(),
            Utc::now().timestamp(),
        )?;

        let response = self
            .http
            .post(&url)
            .header(reqwest::header::AUTHORIZATION, header)
            .send()
            .await
            .map_err(|error| ProviderError::network(Provider::Twitter, &error))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|error| ProviderError::network(Provider::Twitter, &error))?;

        if !status.is_success() {
            return Err(ProviderError::status(
                Provider::Twitter,
                status,
                &Value::Null,
            ));
        }

        Ok(parse_form_body(&body))
    }
}

#[async_trait]
impl ProviderAdapter for TwitterAdapter {
    fn provider(&self) -> Provider {
        Provider::Twitter
    }

    async fn exchange(
        &self,
        grant: &Grant,
        _redirect_target: &str,
    ) -> Result<ExternalProfile, ProviderError> {
        let Grant::OAuth1Verifier {
            oauth_token,
            oauth_verifier,
            request_secret,
        } = grant
        else {
            return Err(ProviderError::malformed(
                Provider::Twitter,
                "expected an OAuth1 verifier grant",
            ));
        };
        let consumer = self.consumer()?;

        let (access_token, access_secret) = self
            .access_token(consumer, oauth_token, request_secret, oauth_verifier)
            .await?;
        let user = self
            .verify_credentials(consumer, &access_token, &access_secret)
            .await?;

        let external_id = json_id(user.get("id_str"))
            .or_else(|| json_id(user.get("id")))
            .ok_or_else(|| {
                ProviderError::malformed(Provider::Twitter, "verified user has no id")
            })?;

        Ok(ExternalProfile {
            provider: Provider::Twitter,
            external_id,
            email: json_string(user.get("email")),
            display_name: json_string(user.get("name")),
            avatar_url: json_string(user.get("profile_image_url"))
                .or_else(|| json_string(user.get("profile_image_url_https"))),
            access_token,
            access_secret: Some(access_secret),
        })
    }
}

fn nonce() -> String {
    Uuid::new_v4().simple().to_string()
}

fn non_empty_field(fields: &HashMap<String, String>, key: &str) -> Option<String> {
    fields
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}

fn parse_form_body(body: &str) -> HashMap<String, String> {
    body.trim()
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .map(|(key, value)| {
            let decode = |raw: &str| {
                let raw = raw.replace('+', " ");
                urlencoding::decode(&raw)
                    .map(|decoded| decoded.into_owned())
                    .unwrap_or(raw)
            };
            (decode(key), decode(value))
        })
        .collect()
}

/// Builds the `Authorization: OAuth ...` header for one request.
///
/// `request_params` are the query or form parameters sent alongside, which are
/// part of the signature but not of the header itself.
fn authorization_header(
    consumer: &ConsumerCredentials,
    method: &str,
    url: &str,
    request_params: &[(&str, &str)],
    context: SigningContext<'_>,
    nonce: &str,
    timestamp: i64,
) -> Result<String, ProviderError> {
    let timestamp = timestamp.to_string();
    let mut oauth_params: Vec<(&str, &str)> = vec![
        ("oauth_consumer_key", consumer.key.as_str()),
        ("oauth_nonce", nonce),
        ("oauth_signature_method", "HMAC-SHA1"),
        ("oauth_timestamp", timestamp.as_str()),
        ("oauth_version", "1.0"),
    ];
    if let Some(token) = context.token {
        oauth_params.push(("oauth_token", token));
    }
    oauth_params.extend_from_slice(context.oauth_params);

    let mut signed_params = oauth_params.clone();
    signed_params.extend_from_slice(request_params);
    let base_string = signature_base_string(method, url, &signed_params);

    let signing_key = format!(
        "{}&{}",
        urlencoding::encode(&consumer.secret),
        urlencoding::encode(context.token_secret.unwrap_or_default())
    );
    let mut mac = HmacSha1::new_from_slice(signing_key.as_bytes()).map_err(|error| {
        ProviderError::malformed(
            Provider::Twitter,
            format!("failed to initialize oauth signer: {error}"),
        )
    })?;
    mac.update(base_string.as_bytes());
    let signature = STANDARD.encode(mac.finalize().into_bytes());

    oauth_params.push(("oauth_signature", signature.as_str()));
    oauth_params.sort_unstable();

    let fields = oauth_params
        .iter()
        .map(|(key, value)| {
            format!(
                "{}=\"{}\"",
                urlencoding::encode(key),
                urlencoding::encode(value)
            )
        })
        .collect::<Vec<_>>()
        .join(", ");

    Ok(format!("OAuth {fields}"))
}

fn signature_base_string(method: &str, url: &str, params: &[(&str, &str)]) -> String {
    let mut encoded = params
        .iter()
        .map(|(key, value)| {
            (
                urlencoding::encode(key).into_owned(),
                urlencoding::encode(value).into_owned(),
            )
        })
        .collect::<Vec<_>>();
    encoded.sort();

    let parameter_string = encoded
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("&");

    format!(
        "{}&{}&{}",
        method.to_ascii_uppercase(),
        urlencoding::encode(url),
        urlencoding::encode(&parameter_string)
    )
}

#[cfg(test)]
mod tests {
    use super::{
        ConsumerCredentials, SigningContext, authorization_header, parse_form_body,
        signature_base_string,
    };

    #[test]
    fn base_string_sorts_and_double_encodes_parameters() {
        let base = signature_base_string(
            "get",
            "https://api.twitter.com/1.1/account/verify_credentials.json",
            &[
                ("oauth_token", "t"),
                ("include_email", "true"),
                ("oauth_consumer_key", "ck"),
                ("status", "a b+c"),
            ],
        );

        assert_eq!(
            base,
            "GET&https%3A%2F%2Fapi.twitter.com%2F1.1%2Faccount%2Fverify_credentials.json&\
             include_email%3Dtrue%26oauth_consumer_key%3Dck%26oauth_token%3Dt%26status%3Da%2520b%252Bc"
        );
    }

    #[test]
    fn authorization_header_carries_signature_and_extra_oauth_params() {
        let consumer = ConsumerCredentials {
            key: "consumer-key".to_string(),
            secret: "consumer-secret".to_string(),
        };
        let context = SigningContext {
            token: Some("request-token"),
            token_secret: Some("request-secret"),
            oauth_params: &[("oauth_verifier", "verifier 1")],
        };

        let header = authorization_header(
            &consumer,
            "POST",
            "https://api.twitter.com/oauth/access_token",
            &[],
            context,
            "nonce123",
            1_318_622_958,
        )
        .expect("header should sign");

        assert!(header.starts_with("OAuth "));
        assert!(header.contains("oauth_consumer_key=\"consumer-key\""));
        assert!(header.contains("oauth_token=\"request-token\""));
        assert!(header.contains("oauth_verifier=\"verifier%201\""));
        assert!(header.contains("oauth_timestamp=\"1318622958\""));
        assert!(!header.contains("request-secret"));

        let signature = header
            .split(", ")
            .find_map(|field| field.strip_prefix("oauth_signature=\""))
            .and_then(|value| value.strip_suffix('"'))
            .expect("signature field");
        let decoded = urlencoding::decode(signature).expect("signature decodes");
        // base64 of a 20 byte SHA-1 MAC
        assert_eq!(decoded.len(), 28);
    }

    #[test]
    fn signature_depends_on_token_secret() {
        let consumer = ConsumerCredentials {
            key: "ck".to_string(),
            secret: "cs".to_string(),
        };
        let sign = |secret: &'static str| {
            authorization_header(
                &consumer,
                "POST",
                "https://api.twitter.com/oauth/access_token",
                &[],
                SigningContext {
                    token: Some("t"),
                    token_secret: Some(secret),
                    oauth_params: &[],
                },
                "n",
                1,
            )
            .expect("header should sign")
        };

        assert_eq!(sign("one"), sign("one"));
        assert_ne!(sign("one"), sign("two"));
    }

    #[test]
    fn form_body_is_decoded() {
        let fields = parse_form_body(
            "oauth_token=abc%2D1&oauth_token_secret=s+e&oauth_callback_confirmed=true\n",
        );
        assert_eq!(fields.get("oauth_token").map(String::as_str), Some("abc-1"));
        assert_eq!(
            fields.get("oauth_token_secret").map(String::as_str),
            Some("s e")
        );
        assert_eq!(
            fields.get("oauth_callback_confirmed").map(String::as_str),
            Some("true")
        );
    }
}

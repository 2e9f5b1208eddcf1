use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{Duration, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;

use crate::config::Config;

type HmacSha256 = Hmac<Sha256>;

/// Mints the short-lived token a client trades for a session.
#[derive(Debug, Clone)]
pub struct SignInTokenIssuer {
    signing_key: Option<String>,
    issuer: String,
    audience: String,
    key_id: String,
    ttl_seconds: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum SignInTokenError {
    #[error("{message}")]
    Unavailable { message: String },
}

impl SignInTokenIssuer {
    pub fn from_config(config: &Config) -> Self {
        Self {
            signing_key: config.sign_in_token_signing_key.clone(),
            issuer: config.sign_in_token_issuer.clone(),
            audience: config.sign_in_token_audience.clone(),
            key_id: config.sign_in_token_key_id.clone(),
            ttl_seconds: config.sign_in_token_ttl_seconds,
        }
    }

    pub fn issue(&self, local_user_id: &str) -> Result<String, SignInTokenError> {
        let signing_key = self
            .signing_key
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| SignInTokenError::Unavailable {
                message: "sign-in token signing key is not configured".to_string(),
            })?;

        if self.issuer.trim().is_empty() || self.audience.trim().is_empty() {
            return Err(SignInTokenError::Unavailable {
                message: "sign-in token issuer and audience must be configured".to_string(),
            });
        }
        if self.ttl_seconds == 0 {
            return Err(SignInTokenError::Unavailable {
                message: "sign-in token ttl_seconds must be positive".to_string(),
            });
        }

        let issued_at = Utc::now();
        let expires_at = issued_at + Duration::seconds(i64::from(self.ttl_seconds));

        let claims = serde_json::json!({
            "iss": self.issuer,
            "aud": self.audience,
            "sub": local_user_id,
            "uid": local_user_id,
            "iat": issued_at.timestamp(),
            "exp": expires_at.timestamp(),
            "jti": format!("signin_{}", Uuid::new_v4().simple()),
        });

        let mut header = serde_json::json!({
            "alg": "HS256",
            "typ": "JWT",
        });
        if !self.key_id.trim().is_empty() {
            header["kid"] = serde_json::Value::String(self.key_id.clone());
        }

        encode_hs256_jwt(&header, &claims, signing_key)
    }
}

fn encode_hs256_jwt(
    header: &serde_json::Value,
    claims: &serde_json::Value,
    signing_key: &str,
) -> Result<String, SignInTokenError> {
    let header_bytes =
        serde_json::to_vec(header).map_err(|error| SignInTokenError::Unavailable {
            message: format!("failed to encode sign-in jwt header: {error}"),
        })?;
    let claims_bytes =
        serde_json::to_vec(claims).map_err(|error| SignInTokenError::Unavailable {
            message: format!("failed to encode sign-in jwt claims: {error}"),
        })?;

    let signing_input = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(header_bytes),
        URL_SAFE_NO_PAD.encode(claims_bytes)
    );

    let mut mac = HmacSha256::new_from_slice(signing_key.as_bytes()).map_err(|error| {
        SignInTokenError::Unavailable {
            message: format!("failed to initialize sign-in jwt signer: {error}"),
        }
    })?;
    mac.update(signing_input.as_bytes());
    let signature_segment = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

    Ok(format!("{signing_input}.{signature_segment}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_segment(segment: &str) -> serde_json::Value {
        let bytes = URL_SAFE_NO_PAD.decode(segment).expect("segment is base64url");
        serde_json::from_slice(&bytes).expect("segment is json")
    }

    #[test]
    fn sign_in_token_carries_user_and_service_claims() {
        let issuer = SignInTokenIssuer::from_config(&Config::for_tests("http://127.0.0.1:9"));
        let token = issuer
            .issue("googleUserId::g-1")
            .expect("sign-in token should issue");

        let segments = token.split('.').collect::<Vec<_>>();
        assert_eq!(segments.len(), 3);

        let header = decode_segment(segments[0]);
        assert_eq!(header["alg"], "HS256");
        assert_eq!(header["kid"], "sign-in-test-v1");

        let claims = decode_segment(segments[1]);
        assert_eq!(claims["uid"], "googleUserId::g-1");
        assert_eq!(claims["sub"], "googleUserId::g-1");
        assert_eq!(claims["iss"], "https://social-login.test");
        assert_eq!(claims["aud"], "social-login-test");
        let iat = claims["iat"].as_i64().expect("iat");
        let exp = claims["exp"].as_i64().expect("exp");
        assert_eq!(exp - iat, 300);

        let mut mac = HmacSha256::new_from_slice(b"sign-in-test-signing-key").expect("mac");
        mac.update(format!("{}.{}", segments[0], segments[1]).as_bytes());
        assert_eq!(
            segments[2],
            URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
        );
    }

    #[test]
    fn every_token_has_a_distinct_id() {
        let issuer = SignInTokenIssuer::from_config(&Config::for_tests("http://127.0.0.1:9"));
        let first = issuer.issue("user-1").expect("first token");
        let second = issuer.issue("user-1").expect("second token");
        assert_ne!(first, second);
    }

    #[test]
    fn sign_in_token_requires_signing_key() {
        let mut config = Config::for_tests("http://127.0.0.1:9");
        config.sign_in_token_signing_key = Some("   ".to_string());
        let result = SignInTokenIssuer::from_config(&config).issue("user-1");

        assert!(matches!(result, Err(SignInTokenError::Unavailable { .. })));
    }
}

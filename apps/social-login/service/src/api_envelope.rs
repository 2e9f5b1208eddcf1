use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::provider::{ExternalProfile, Provider};
use crate::resolution::Outcome;

/// Every body the login endpoints answer with. Callers branch on the shape,
/// so all of them go out as `200 OK`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged, rename_all_fields = "camelCase")]
pub enum SocialLoginResponse {
    Token {
        token: String,
    },
    Linked {
        islinked: bool,
    },
    SocialUserAlreadyExists {
        social_user_already_exists: bool,
    },
    EmailAlreadyExists {
        email_already_exists: bool,
        email: String,
        social_providers: Vec<String>,
        social_user: SocialUser,
    },
    Message {
        message: String,
    },
    Error {
        error: bool,
    },
}

/// Fresh credentials handed back on a collision so the client can retry as a link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SocialUser {
    pub provider: Provider,
    pub id: String,
    pub access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_secret: Option<String>,
}

impl From<ExternalProfile> for SocialUser {
    fn from(profile: ExternalProfile) -> Self {
        Self {
            provider: profile.provider,
            id: profile.external_id,
            access_token: profile.access_token,
            access_secret: profile.access_secret,
        }
    }
}

impl SocialLoginResponse {
    pub fn error() -> Self {
        Self::Error { error: true }
    }

    pub fn message(message: impl Into<String>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }
}

impl From<Outcome> for SocialLoginResponse {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::SignedIn { token, .. } => Self::Token { token },
            Outcome::Linked { .. } => Self::Linked { islinked: true },
            Outcome::AlreadyLinkedElsewhere => Self::SocialUserAlreadyExists {
                social_user_already_exists: true,
            },
            Outcome::EmailCollision {
                email,
                social_providers,
                profile,
            } => Self::EmailAlreadyExists {
                email_already_exists: true,
                email,
                social_providers,
                social_user: profile.into(),
            },
        }
    }
}

impl IntoResponse for SocialLoginResponse {
    fn into_response(self) -> Response {
        (StatusCode::OK, Json(self)).into_response()
    }
}

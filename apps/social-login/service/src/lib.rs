use std::sync::Arc;
use std::time::SystemTime;

use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::http::header::LOCATION;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

pub mod api_envelope;
pub mod config;
pub mod identity_store;
pub mod oauth2_exchange;
pub mod persistence;
pub mod provider;
pub mod resolution;
pub mod sign_in_token;
pub mod twitter;
pub mod user_directory;

use crate::api_envelope::SocialLoginResponse;
use crate::config::Config;
use crate::identity_store::{IdentityStore, JsonTreeStore, KeyValueStore, StoreError, store_key};
use crate::provider::{Grant, Provider, ProviderError, ProviderRegistry, UnknownProvider};
use crate::resolution::{Outcome, ResolutionEngine, ResolveError};
use crate::user_directory::{DirectoryError, LocalUserDirectory, UserDirectory};

const SERVICE_NAME: &str = "social-login-service";
const ROUTE_SOCIAL_LOGIN: &str = "/handleSocialLogin";
const ROUTE_INSTAGRAM_LOGIN: &str = "/handleInstagramLogin";

#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    providers: ProviderRegistry,
    identities: IdentityStore,
    resolver: ResolutionEngine,
    started_at: SystemTime,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    uptime_seconds: u64,
}

#[derive(Debug, Default, Deserialize)]
struct SocialLoginQuery {
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    redirect_uri: Option<String>,
    #[serde(default)]
    provider: Option<String>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    uid: Option<String>,
}

/// Twitter's callback arrives with the OAuth1 pair packed into `code`.
#[derive(Debug, Deserialize)]
struct OAuth1CallbackCode {
    #[serde(default)]
    oauth_token: Option<String>,
    #[serde(default)]
    oauth_verifier: Option<String>,
}

#[derive(Debug)]
enum LoginRequest<'a> {
    TwitterHandshake {
        client_id: &'a str,
    },
    Exchange {
        provider: Provider,
        code: &'a str,
        client_id: Option<&'a str>,
        uid: Option<&'a str>,
    },
}

#[derive(Debug, thiserror::Error)]
enum InputError {
    #[error("query string could not be parsed: {0}")]
    Query(String),
    #[error("request matches no login flow")]
    NoMatchingFlow,
    #[error("redirect_uri does not match the configured redirect")]
    RedirectMismatch,
    #[error(transparent)]
    UnknownProvider(#[from] UnknownProvider),
    #[error("twitter code is not a JSON object with oauth_token and oauth_verifier")]
    MalformedOAuth1Code,
    #[error("twitter callback requires client_id")]
    MissingClientId,
    #[error("no pending twitter handshake for this client_id")]
    MissingRequestSecret,
    #[error("twitter callback is missing oauth_token or oauth_verifier")]
    IncompleteOAuth1Code,
}

#[derive(Debug, thiserror::Error)]
enum LoginError {
    #[error(transparent)]
    Input(#[from] InputError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
}

pub fn build_router(config: Config) -> Router {
    let tree: Arc<dyn KeyValueStore> =
        Arc::new(JsonTreeStore::new(config.identity_store_path.clone()));
    let users: Arc<dyn UserDirectory> = Arc::new(LocalUserDirectory::from_config(&config));
    build_router_with_collaborators(config, tree, users)
}

/// Router over caller-supplied identity and user stores.
pub fn build_router_with_collaborators(
    config: Config,
    tree: Arc<dyn KeyValueStore>,
    users: Arc<dyn UserDirectory>,
) -> Router {
    let providers = ProviderRegistry::from_config(&config);
    let identities = IdentityStore::new(tree);
    let resolver = ResolutionEngine::new(identities.clone(), users);
    let state = AppState {
        config: Arc::new(config),
        providers,
        identities,
        resolver,
        started_at: SystemTime::now(),
    };

    Router::new()
        .route("/healthz", get(health))
        .route(ROUTE_SOCIAL_LOGIN, any(handle_social_login))
        .route(ROUTE_INSTAGRAM_LOGIN, any(handle_instagram_login))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime_seconds = match state.started_at.elapsed() {
        Ok(duration) => duration.as_secs(),
        Err(_) => 0,
    };

    Json(HealthResponse {
        status: "ok",
        service: SERVICE_NAME,
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds,
    })
}

async fn handle_social_login(
    State(state): State<AppState>,
    query: Result<Query<SocialLoginQuery>, QueryRejection>,
) -> Response {
    match query {
        Ok(Query(query)) => social_login(&state, &query).await,
        Err(rejection) => {
            failure_response(&LoginError::Input(InputError::Query(rejection.body_text())))
                .into_response()
        }
    }
}

/// Legacy Instagram-only entry point, served by the general pipeline.
async fn handle_instagram_login(
    State(state): State<AppState>,
    query: Result<Query<SocialLoginQuery>, QueryRejection>,
) -> Response {
    match query {
        Ok(Query(mut query)) => {
            query.provider = Some(Provider::Instagram.as_str().to_string());
            social_login(&state, &query).await
        }
        Err(rejection) => {
            failure_response(&LoginError::Input(InputError::Query(rejection.body_text())))
                .into_response()
        }
    }
}

async fn social_login(state: &AppState, query: &SocialLoginQuery) -> Response {
    let request = match classify_request(&state.config, query) {
        Ok(request) => request,
        Err(error) => return failure_response(&LoginError::Input(error)).into_response(),
    };

    match request {
        LoginRequest::TwitterHandshake { client_id } => {
            begin_twitter_handshake(state, client_id).await
        }
        LoginRequest::Exchange {
            provider,
            code,
            client_id,
            uid,
        } => match exchange_and_resolve(state, provider, code, client_id, uid).await {
            Ok(outcome) => {
                tracing::info!(
                    target: "social_login.resolution",
                    provider = %provider,
                    outcome = outcome.label(),
                    linking = uid.is_some(),
                    "social login resolved",
                );
                SocialLoginResponse::from(outcome).into_response()
            }
            Err(error) => failure_response(&error).into_response(),
        },
    }
}

fn param(value: Option<&String>) -> Option<&str> {
    value.map(|value| value.trim()).filter(|value| !value.is_empty())
}

fn classify_request<'a>(
    config: &Config,
    query: &'a SocialLoginQuery,
) -> Result<LoginRequest<'a>, InputError> {
    let client_id = param(query.client_id.as_ref());
    let provider = param(query.provider.as_ref());
    let code = param(query.code.as_ref());

    match (provider, client_id) {
        (None, Some(client_id)) => {
            let redirect_uri = param(query.redirect_uri.as_ref());
            let configured = config.redirect_url.trim();
            if configured.is_empty() || redirect_uri != Some(configured) {
                return Err(InputError::RedirectMismatch);
            }
            Ok(LoginRequest::TwitterHandshake { client_id })
        }
        (Some(provider), _) => {
            let provider = provider.parse::<Provider>()?;
            let code = code.ok_or(InputError::NoMatchingFlow)?;
            Ok(LoginRequest::Exchange {
                provider,
                code,
                client_id,
                uid: param(query.uid.as_ref()),
            })
        }
        (None, None) => Err(InputError::NoMatchingFlow),
    }
}

/// Starts the OAuth1 dance. Every failure lands back on the configured redirect.
async fn begin_twitter_handshake(state: &AppState, client_id: &str) -> Response {
    let destination = match start_twitter_handshake(state, client_id).await {
        Ok(authenticate_url) => authenticate_url,
        Err(error) => {
            tracing::warn!(
                target: "social_login.twitter",
                error = %error,
                "twitter handshake failed; redirecting back to client",
            );
            state.config.redirect_url.clone()
        }
    };

    (StatusCode::FOUND, [(LOCATION, destination)]).into_response()
}

async fn start_twitter_handshake(state: &AppState, client_id: &str) -> Result<String, LoginError> {
    let client_id = store_key(client_id)?;
    let twitter = state.providers.twitter();
    let request_token = twitter.request_token().await?;
    state
        .identities
        .save_twitter_request_secret(client_id, &request_token.secret)
        .await?;

    tracing::info!(
        target: "social_login.twitter",
        "twitter request token issued",
    );
    Ok(twitter.authenticate_url(&request_token.token))
}

async fn exchange_and_resolve(
    state: &AppState,
    provider: Provider,
    code: &str,
    client_id: Option<&str>,
    uid: Option<&str>,
) -> Result<Outcome, LoginError> {
    let oauth1_code = if provider == Provider::Twitter {
        let parsed = serde_json::from_str::<OAuth1CallbackCode>(code)
            .map_err(|_| InputError::MalformedOAuth1Code)?;
        let client_id = client_id.ok_or(InputError::MissingClientId)?;
        Some((store_key(client_id)?, parsed))
    } else {
        None
    };

    let link_target = match uid {
        Some(local_user_id) => Some(state.resolver.load_link_target(local_user_id).await?),
        None => None,
    };

    let grant = match oauth1_code {
        Some((client_id, parsed)) => {
            // Consumed before the verifier is checked so it can never be replayed.
            let request_secret = state
                .identities
                .take_twitter_request_secret(client_id)
                .await?
                .ok_or(InputError::MissingRequestSecret)?;
            let oauth_token = param(parsed.oauth_token.as_ref());
            let oauth_verifier = param(parsed.oauth_verifier.as_ref());
            let (Some(oauth_token), Some(oauth_verifier)) = (oauth_token, oauth_verifier) else {
                return Err(InputError::IncompleteOAuth1Code.into());
            };
            Grant::OAuth1Verifier {
                oauth_token: oauth_token.to_string(),
                oauth_verifier: oauth_verifier.to_string(),
                request_secret,
            }
        }
        None => Grant::AuthorizationCode(code.to_string()),
    };

    let profile = state
        .providers
        .adapter(provider)
        .exchange(&grant, &state.config.redirect_url)
        .await?;

    Ok(state.resolver.resolve_for(profile, link_target).await?)
}

/// Maps a failed request onto its response body and logs it server-side.
fn failure_response(error: &LoginError) -> SocialLoginResponse {
    match error {
        LoginError::Provider(provider_error) => {
            tracing::warn!(
                target: "social_login.provider",
                provider = %provider_error.provider,
                transient = provider_error.transient,
                error = %provider_error,
                "provider exchange failed",
            );
            match provider_error.provider_message.as_deref() {
                Some(message) => SocialLoginResponse::message(message),
                None => SocialLoginResponse::error(),
            }
        }
        LoginError::Input(_)
        | LoginError::Store(StoreError::InvalidKey { .. })
        | LoginError::Resolve(ResolveError::LinkTargetNotFound { .. }) => {
            tracing::warn!(
                target: "social_login.request",
                error = %error,
                "rejected social login request",
            );
            SocialLoginResponse::error()
        }
        LoginError::Resolve(ResolveError::Directory(DirectoryError::Token(token_error))) => {
            tracing::error!(
                target: "social_login.resolution",
                error = %token_error,
                "failed to issue sign-in token",
            );
            SocialLoginResponse::error()
        }
        LoginError::Store(_) | LoginError::Resolve(_) => {
            tracing::error!(
                target: "social_login.resolution",
                error = %error,
                "social login failed on an internal write",
            );
            SocialLoginResponse::error()
        }
    }
}

use async_trait::async_trait;
use serde_json::Value;

use crate::config::OAuth2ProviderConfig;
use crate::provider::{
    ExternalProfile, Grant, Provider, ProviderAdapter, ProviderError, json_id, json_string,
    read_json_body,
};

/// Authorization-code exchange shared by Facebook, Google and Instagram.
#[derive(Debug, Clone)]
pub struct OAuth2Adapter {
    provider: Provider,
    credentials: Option<ClientCredentials>,
    grant_type: String,
    token_url: String,
    profile_url: String,
    http: reqwest::Client,
}

#[derive(Debug, Clone)]
struct ClientCredentials {
    client_id: String,
    client_secret: String,
}

#[derive(Debug, Clone)]
struct TokenResponse {
    access_token: String,
    body: Value,
}

impl OAuth2Adapter {
    pub fn from_config(
        provider: Provider,
        config: &OAuth2ProviderConfig,
        grant_type: &str,
        http: reqwest::Client,
    ) -> Self {
        let credentials = config
            .credentials()
            .map(|(client_id, client_secret)| ClientCredentials {
                client_id: client_id.to_string(),
                client_secret: client_secret.to_string(),
            });

        Self {
            provider,
            credentials,
            grant_type: grant_type.to_string(),
            token_url: config.oauth_url.clone(),
            profile_url: config.profile_url.clone(),
            http,
        }
    }

    async fn exchange_code(
        &self,
        credentials: &ClientCredentials,
        code: &str,
        redirect_target: &str,
    ) -> Result<TokenResponse, ProviderError> {
        let form = [
            ("client_id", credentials.client_id.as_str()),
            ("client_secret", credentials.client_secret.as_str()),
            ("grant_type", self.grant_type.as_str()),
            ("redirect_uri", redirect_target),
            ("code", code),
        ];

        let response = self
            .http
            .post(&self.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|error| ProviderError::network(self.provider, &error))?;

        let (status, body) = read_json_body(self.provider, response).await?;
        if !status.is_success() {
            return Err(ProviderError::status(self.provider, status, &body));
        }

        match json_string(body.get("access_token")) {
            Some(access_token) => Ok(TokenResponse { access_token, body }),
            None => Err(
                ProviderError::malformed(self.provider, "token response has no access_token")
                    .with_provider_message(&body),
            ),
        }
    }

    async fn fetch_profile(&self, access_token: &str) -> Result<Value, ProviderError> {
        let mut request = self
            .http
            .get(&self.profile_url)
            .query(&[("access_token", access_token)]);
        if self.provider == Provider::Facebook {
            request = request.query(&[("fields", "id,email,name,picture")]);
        }

        let response = request
            .send()
            .await
            .map_err(|error| ProviderError::network(self.provider, &error))?;

        let (status, body) = read_json_body(self.provider, response).await?;
        if !status.is_success() {
            return Err(ProviderError::status(self.provider, status, &body));
        }

        Ok(body)
    }
}

#[async_trait]
impl ProviderAdapter for OAuth2Adapter {
    fn provider(&self) -> Provider {
        self.provider
    }

    async fn exchange(
        &self,
        grant: &Grant,
        redirect_target: &str,
    ) -> Result<ExternalProfile, ProviderError> {
        let Grant::AuthorizationCode(code) = grant else {
            return Err(ProviderError::malformed(
                self.provider,
                "expected an authorization code grant",
            ));
        };
        let Some(credentials) = self.credentials.as_ref() else {
            return Err(ProviderError::unavailable(self.provider));
        };

        let token = self
            .exchange_code(credentials, code, redirect_target)
            .await?;
        let profile = self.fetch_profile(&token.access_token).await?;

        normalize_profile(self.provider, &profile, &token.body)
            .map(|fields| fields.into_profile(self.provider, token.access_token))
            .ok_or_else(|| {
                ProviderError::malformed(self.provider, "profile response has no user id")
            })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct ProfileFields {
    id: String,
    email: Option<String>,
    name: Option<String>,
    avatar_url: Option<String>,
}

impl ProfileFields {
    fn into_profile(self, provider: Provider, access_token: String) -> ExternalProfile {
        ExternalProfile {
            provider,
            external_id: self.id,
            email: self.email,
            display_name: self.name,
            avatar_url: self.avatar_url,
            access_token,
            access_secret: None,
        }
    }
}

/// Maps each provider's profile JSON onto the common fields.
fn normalize_profile(provider: Provider, profile: &Value, token: &Value) -> Option<ProfileFields> {
    match provider {
        Provider::Facebook => Some(ProfileFields {
            id: json_id(profile.get("id"))?,
            email: json_string(profile.get("email")),
            name: json_string(profile.get("name")),
            avatar_url: json_string(
                profile
                    .get("picture")
                    .and_then(|picture| picture.get("data"))
                    .and_then(|data| data.get("url")),
            ),
        }),
        Provider::Google => Some(ProfileFields {
            id: json_id(profile.get("id"))?,
            email: json_string(profile.get("email")),
            name: json_string(profile.get("name")),
            avatar_url: json_string(profile.get("picture")),
        }),
        // Instagram never shares an email address. Older token responses embed the
        // user object directly, which covers profile calls that come back empty.
        Provider::Instagram => [profile.get("data"), token.get("user")]
            .into_iter()
            .flatten()
            .find_map(|user| {
                Some(ProfileFields {
                    id: json_id(user.get("id"))?,
                    email: None,
                    name: json_string(user.get("full_name")),
                    avatar_url: json_string(user.get("profile_picture")),
                })
            }),
        Provider::Twitter => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{ProfileFields, normalize_profile};
    use crate::provider::Provider;

    #[test]
    fn facebook_profile_reads_nested_picture_url() {
        let profile = json!({
            "id": "10154",
            "email": "ada@example.test",
            "name": "Ada Lovelace",
            "picture": { "data": { "url": "https://cdn.example.test/ada.png" } },
        });

        assert_eq!(
            normalize_profile(Provider::Facebook, &profile, &json!({})),
            Some(ProfileFields {
                id: "10154".to_string(),
                email: Some("ada@example.test".to_string()),
                name: Some("Ada Lovelace".to_string()),
                avatar_url: Some("https://cdn.example.test/ada.png".to_string()),
            })
        );
    }

    #[test]
    fn google_profile_without_id_is_rejected() {
        let profile = json!({ "email": "grace@example.test", "name": "Grace" });
        assert_eq!(normalize_profile(Provider::Google, &profile, &json!({})), None);
    }

    #[test]
    fn google_profile_treats_blank_fields_as_missing() {
        let profile = json!({ "id": "g-1", "email": "", "name": "  ", "picture": "https://p" });
        let fields = normalize_profile(Provider::Google, &profile, &json!({}))
            .expect("google profile should normalize");
        assert_eq!(fields.email, None);
        assert_eq!(fields.name, None);
        assert_eq!(fields.avatar_url.as_deref(), Some("https://p"));
    }

    #[test]
    fn instagram_profile_is_nested_under_data_and_has_no_email() {
        let profile = json!({
            "data": {
                "id": "1574083",
                "full_name": "Snoop Dogg",
                "profile_picture": "https://cdn.example.test/snoop.jpg",
                "email": "ignored@example.test",
            }
        });

        let fields = normalize_profile(Provider::Instagram, &profile, &json!({}))
            .expect("instagram profile should normalize");
        assert_eq!(fields.id, "1574083");
        assert_eq!(fields.email, None);
        assert_eq!(fields.name.as_deref(), Some("Snoop Dogg"));
    }

    #[test]
    fn instagram_falls_back_to_token_user_object() {
        let token = json!({
            "access_token": "ig-token",
            "user": { "id": "42", "full_name": "Token User" },
        });

        let fields = normalize_profile(Provider::Instagram, &json!({ "meta": {} }), &token)
            .expect("instagram token user should normalize");
        assert_eq!(fields.id, "42");
        assert_eq!(fields.name.as_deref(), Some("Token User"));
    }
}

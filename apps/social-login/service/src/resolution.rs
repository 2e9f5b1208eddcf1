//! Decides what a verified external profile means for the local account set.
//!
//! A profile either signs in as the user its identity is already linked to,
//! creates a new user keyed deterministically on the external id, links onto
//! the user named by the caller, or stops at a conflict without writing.

use std::sync::Arc;

use crate::identity_store::{IdentityStore, ProviderIdentityRecord, StoreError};
use crate::provider::{ExternalProfile, Provider};
use crate::user_directory::{DirectoryError, LocalUserRecord, UserDirectory, UserPatch};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    SignedIn {
        local_user_id: String,
        token: String,
    },
    Linked {
        local_user_id: String,
    },
    /// The external identity already belongs to a local user.
    AlreadyLinkedElsewhere,
    /// A local user owns the profile's email but not this identity.
    EmailCollision {
        email: String,
        social_providers: Vec<String>,
        profile: ExternalProfile,
    },
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::SignedIn { .. } => "signed_in",
            Self::Linked { .. } => "linked",
            Self::AlreadyLinkedElsewhere => "already_linked_elsewhere",
            Self::EmailCollision { .. } => "email_collision",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("link target '{local_user_id}' does not exist")]
    LinkTargetNotFound { local_user_id: String },
    #[error("identity store failure: {0}")]
    Store(#[from] StoreError),
    #[error("user directory failure: {0}")]
    Directory(#[from] DirectoryError),
}

/// Local user id minted for an external identity with no prior link.
pub fn synthetic_local_user_id(provider: Provider, external_id: &str) -> String {
    format!("{}UserId::{external_id}", provider.as_str())
}

#[derive(Clone)]
pub struct ResolutionEngine {
    identities: IdentityStore,
    users: Arc<dyn UserDirectory>,
}

/// Who the profile resolved to before any write happens.
struct ResolvedTarget {
    local_user_id: String,
    current: Option<LocalUserRecord>,
    new_account: bool,
}

impl ResolutionEngine {
    pub fn new(identities: IdentityStore, users: Arc<dyn UserDirectory>) -> Self {
        Self { identities, users }
    }

    pub async fn load_link_target(
        &self,
        local_user_id: &str,
    ) -> Result<LocalUserRecord, ResolveError> {
        self.users
            .get_user(local_user_id)
            .await?
            .ok_or_else(|| ResolveError::LinkTargetNotFound {
                local_user_id: local_user_id.to_string(),
            })
    }

    pub async fn resolve(
        &self,
        profile: ExternalProfile,
        linking_user_id: Option<&str>,
    ) -> Result<Outcome, ResolveError> {
        let link_target = match linking_user_id {
            Some(local_user_id) => Some(self.load_link_target(local_user_id).await?),
            None => None,
        };
        self.resolve_for(profile, link_target).await
    }

    /// Resolves against a link target the caller has already loaded.
    pub async fn resolve_for(
        &self,
        profile: ExternalProfile,
        link_target: Option<LocalUserRecord>,
    ) -> Result<Outcome, ResolveError> {
        let linking = link_target.is_some();
        let existing = self
            .identities
            .provider_identity(profile.provider, &profile.external_id)
            .await?;

        let target = match (link_target, existing) {
            (Some(_), Some(_)) => return Ok(Outcome::AlreadyLinkedElsewhere),
            (Some(target), None) => ResolvedTarget {
                local_user_id: target.local_user_id.clone(),
                current: Some(target),
                new_account: false,
            },
            (None, Some(existing)) => ResolvedTarget {
                current: self.users.get_user(&existing.local_user_id).await?,
                local_user_id: existing.local_user_id,
                new_account: false,
            },
            (None, None) => {
                if let Some(email) = profile.email.as_deref()
                    && let Some(owner) = self.users.get_user_by_email(email).await?
                {
                    let social_providers =
                        self.identities.linked_providers(&owner.local_user_id).await?;
                    return Ok(Outcome::EmailCollision {
                        email: email.to_string(),
                        social_providers,
                        profile,
                    });
                }

                let local_user_id =
                    synthetic_local_user_id(profile.provider, &profile.external_id);
                ResolvedTarget {
                    current: self.users.get_user(&local_user_id).await?,
                    local_user_id,
                    new_account: true,
                }
            }
        };

        self.identities
            .link_identity(&ProviderIdentityRecord {
                provider: profile.provider,
                external_id: profile.external_id.clone(),
                access_token: profile.access_token.clone(),
                access_secret: profile.access_secret.clone(),
                local_user_id: target.local_user_id.clone(),
            })
            .await?;

        let patch = reconcile_patch(&profile, target.current.as_ref(), target.new_account);
        self.write_user(&target.local_user_id, target.current.is_some(), patch)
            .await?;

        if linking {
            return Ok(Outcome::Linked {
                local_user_id: target.local_user_id,
            });
        }

        let token = self
            .users
            .create_sign_in_token(&target.local_user_id)
            .await?;
        Ok(Outcome::SignedIn {
            local_user_id: target.local_user_id,
            token,
        })
    }

    /// Applies the patch, creating the user when it does not exist yet.
    async fn write_user(
        &self,
        local_user_id: &str,
        exists: bool,
        patch: UserPatch,
    ) -> Result<(), ResolveError> {
        if exists {
            if patch.is_empty() {
                return Ok(());
            }
            return match self.users.update_user(local_user_id, patch.clone()).await {
                Ok(_) => Ok(()),
                Err(DirectoryError::UserNotFound { .. }) => {
                    self.users.create_user(local_user_id, patch).await?;
                    Ok(())
                }
                Err(error) => Err(error.into()),
            };
        }

        match self.users.create_user(local_user_id, patch.clone()).await {
            Ok(_) => Ok(()),
            Err(DirectoryError::UserAlreadyExists { .. }) if patch.is_empty() => Ok(()),
            Err(DirectoryError::UserAlreadyExists { .. }) => {
                self.users.update_user(local_user_id, patch).await?;
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }
}

/// Profile fields that may be copied onto the local user.
///
/// Name and avatar only fill gaps. Email is only set on an account this
/// resolution created, and only when it has none yet.
fn reconcile_patch(
    profile: &ExternalProfile,
    current: Option<&LocalUserRecord>,
    new_account: bool,
) -> UserPatch {
    let is_empty = |value: Option<&String>| value.is_none_or(|value| value.trim().is_empty());

    UserPatch {
        email: profile
            .email
            .clone()
            .filter(|_| new_account && is_empty(current.and_then(|user| user.email.as_ref()))),
        display_name: profile
            .display_name
            .clone()
            .filter(|_| is_empty(current.and_then(|user| user.display_name.as_ref()))),
        avatar_url: profile
            .avatar_url
            .clone()
            .filter(|_| is_empty(current.and_then(|user| user.avatar_url.as_ref()))),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::config::Config;
    use crate::identity_store::JsonTreeStore;
    use crate::user_directory::LocalUserDirectory;

    struct Harness {
        engine: ResolutionEngine,
        identities: IdentityStore,
        users: Arc<LocalUserDirectory>,
    }

    fn harness() -> Harness {
        let identities = IdentityStore::new(Arc::new(JsonTreeStore::in_memory()));
        let users = Arc::new(LocalUserDirectory::from_config(&Config::for_tests(
            "http://127.0.0.1:9",
        )));
        Harness {
            engine: ResolutionEngine::new(identities.clone(), users.clone()),
            identities,
            users,
        }
    }

    fn profile(provider: Provider, external_id: &str, email: Option<&str>) -> ExternalProfile {
        ExternalProfile {
            provider,
            external_id: external_id.to_string(),
            email: email.map(ToString::to_string),
            display_name: Some("Provider Name".to_string()),
            avatar_url: Some("https://cdn.example.test/provider.png".to_string()),
            access_token: format!("token-{external_id}"),
            access_secret: None,
        }
    }

    #[test]
    fn synthetic_id_is_deterministic() {
        assert_eq!(
            synthetic_local_user_id(Provider::Facebook, "10154"),
            "facebookUserId::10154"
        );
    }

    #[tokio::test]
    async fn unseen_identity_creates_user_and_signs_in() {
        let h = harness();
        let outcome = h
            .engine
            .resolve(profile(Provider::Google, "g-1", Some("g1@example.test")), None)
            .await
            .expect("resolve");

        let Outcome::SignedIn { local_user_id, token } = outcome else {
            panic!("expected sign-in, got {outcome:?}");
        };
        assert_eq!(local_user_id, "googleUserId::g-1");
        assert!(!token.is_empty());

        let user = h
            .users
            .get_user("googleUserId::g-1")
            .await
            .expect("get user")
            .expect("user created");
        assert_eq!(user.email.as_deref(), Some("g1@example.test"));
        assert_eq!(user.display_name.as_deref(), Some("Provider Name"));
        assert_eq!(
            h.identities.linked_providers("googleUserId::g-1").await.expect("providers"),
            vec!["google".to_string()]
        );
    }

    #[tokio::test]
    async fn repeated_sign_in_reuses_the_same_user() {
        let h = harness();
        for _ in 0..2 {
            let outcome = h
                .engine
                .resolve(profile(Provider::Facebook, "fb-1", Some("fb@example.test")), None)
                .await
                .expect("resolve");
            assert!(matches!(
                outcome,
                Outcome::SignedIn { ref local_user_id, .. } if local_user_id == "facebookUserId::fb-1"
            ));
        }
        assert_eq!(h.users.user_count().await, 1);
    }

    #[tokio::test]
    async fn existing_link_wins_over_email_match() {
        let h = harness();
        h.users
            .create_user(
                "someone-else",
                UserPatch {
                    email: Some("shared@example.test".to_string()),
                    ..UserPatch::default()
                },
            )
            .await
            .expect("create user");
        h.identities
            .link_identity(&ProviderIdentityRecord {
                provider: Provider::Google,
                external_id: "g-9".to_string(),
                access_token: "old".to_string(),
                access_secret: None,
                local_user_id: "linked-user".to_string(),
            })
            .await
            .expect("seed link");

        let outcome = h
            .engine
            .resolve(profile(Provider::Google, "g-9", Some("shared@example.test")), None)
            .await
            .expect("resolve");

        assert!(matches!(
            outcome,
            Outcome::SignedIn { ref local_user_id, .. } if local_user_id == "linked-user"
        ));
        let refreshed = h
            .identities
            .provider_identity(Provider::Google, "g-9")
            .await
            .expect("lookup")
            .expect("record");
        assert_eq!(refreshed.access_token, "token-g-9");
        // A linked user missing from the directory is recreated, without the email.
        let user = h
            .users
            .get_user("linked-user")
            .await
            .expect("get user")
            .expect("user recreated");
        assert_eq!(user.email, None);
    }

    #[tokio::test]
    async fn email_collision_reports_linked_providers_without_writing() {
        let h = harness();
        h.engine
            .resolve(profile(Provider::Google, "g-2", Some("dup@example.test")), None)
            .await
            .expect("seed google sign-in");
        let before = h.identities.snapshot().await;

        let incoming = profile(Provider::Facebook, "fb-2", Some("dup@example.test"));
        let outcome = h
            .engine
            .resolve(incoming.clone(), None)
            .await
            .expect("resolve");

        assert_eq!(
            outcome,
            Outcome::EmailCollision {
                email: "dup@example.test".to_string(),
                social_providers: vec!["google".to_string()],
                profile: incoming,
            }
        );
        assert_eq!(h.identities.snapshot().await, before);
        assert_eq!(h.users.user_count().await, 1);
    }

    #[tokio::test]
    async fn linking_attaches_identity_to_target_user() {
        let h = harness();
        h.users
            .create_user("local-7", UserPatch::default())
            .await
            .expect("create target");

        let outcome = h
            .engine
            .resolve(
                profile(Provider::Instagram, "ig-7", Some("ig@example.test")),
                Some("local-7"),
            )
            .await
            .expect("resolve");

        assert_eq!(
            outcome,
            Outcome::Linked {
                local_user_id: "local-7".to_string()
            }
        );
        let user = h
            .users
            .get_user("local-7")
            .await
            .expect("get user")
            .expect("target");
        assert_eq!(user.display_name.as_deref(), Some("Provider Name"));
        assert_eq!(user.email, None);
        assert_eq!(
            h.identities.snapshot().await["socialIdentities"]["instagram"]["ig-7"]["localUserId"],
            json!("local-7")
        );
    }

    #[tokio::test]
    async fn linking_an_already_linked_identity_writes_nothing() {
        let h = harness();
        h.engine
            .resolve(profile(Provider::Twitter, "tw-1", None), None)
            .await
            .expect("seed sign-in");
        h.users
            .create_user("local-8", UserPatch::default())
            .await
            .expect("create target");
        let before = h.identities.snapshot().await;

        let outcome = h
            .engine
            .resolve(profile(Provider::Twitter, "tw-1", None), Some("local-8"))
            .await
            .expect("resolve");

        assert_eq!(outcome, Outcome::AlreadyLinkedElsewhere);
        assert_eq!(h.identities.snapshot().await, before);
    }

    #[tokio::test]
    async fn missing_link_target_fails_before_any_write() {
        let h = harness();
        let result = h
            .engine
            .resolve(profile(Provider::Google, "g-3", None), Some("ghost"))
            .await;

        assert!(matches!(
            result,
            Err(ResolveError::LinkTargetNotFound { ref local_user_id }) if local_user_id == "ghost"
        ));
        assert_eq!(h.identities.snapshot().await, json!({}));
    }

    #[tokio::test]
    async fn reconciliation_never_overwrites_existing_fields() {
        let h = harness();
        h.users
            .create_user(
                "local-9",
                UserPatch {
                    email: Some("keep@example.test".to_string()),
                    display_name: Some("Kept Name".to_string()),
                    avatar_url: None,
                },
            )
            .await
            .expect("create target");

        h.engine
            .resolve(
                profile(Provider::Facebook, "fb-9", Some("other@example.test")),
                Some("local-9"),
            )
            .await
            .expect("link");
        h.engine
            .resolve(profile(Provider::Facebook, "fb-9", Some("other@example.test")), None)
            .await
            .expect("sign in");

        let user = h
            .users
            .get_user("local-9")
            .await
            .expect("get user")
            .expect("user");
        assert_eq!(user.email.as_deref(), Some("keep@example.test"));
        assert_eq!(user.display_name.as_deref(), Some("Kept Name"));
        assert_eq!(
            user.avatar_url.as_deref(),
            Some("https://cdn.example.test/provider.png")
        );
    }

    #[test]
    fn patch_sets_email_only_for_new_accounts() {
        let incoming = profile(Provider::Google, "g-4", Some("new@example.test"));
        assert_eq!(
            reconcile_patch(&incoming, None, true).email.as_deref(),
            Some("new@example.test")
        );
        assert_eq!(reconcile_patch(&incoming, None, false).email, None);

        let blank = LocalUserRecord {
            local_user_id: "u".to_string(),
            email: Some(" ".to_string()),
            display_name: None,
            avatar_url: None,
        };
        assert_eq!(
            reconcile_patch(&incoming, Some(&blank), true).email.as_deref(),
            Some("new@example.test")
        );
    }
}

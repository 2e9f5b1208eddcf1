use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::config::Config;
use crate::persistence::{JsonSnapshotFile, SnapshotError};
use crate::sign_in_token::{SignInTokenError, SignInTokenIssuer};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalUserRecord {
    pub local_user_id: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

/// Fields to set on a user; `None` leaves the stored value untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserPatch {
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

impl UserPatch {
    pub fn is_empty(&self) -> bool {
        self.email.is_none() && self.display_name.is_none() && self.avatar_url.is_none()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("user '{local_user_id}' does not exist")]
    UserNotFound { local_user_id: String },
    #[error("user '{local_user_id}' already exists")]
    UserAlreadyExists { local_user_id: String },
    #[error("email is already registered to another user")]
    EmailAlreadyExists,
    #[error(transparent)]
    Store(#[from] SnapshotError),
    #[error(transparent)]
    Token(#[from] SignInTokenError),
}

/// Account service that owns local users and mints their sign-in tokens.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn get_user(&self, local_user_id: &str)
    -> Result<Option<LocalUserRecord>, DirectoryError>;

    async fn get_user_by_email(&self, email: &str)
    -> Result<Option<LocalUserRecord>, DirectoryError>;

    async fn create_user(
        &self,
        local_user_id: &str,
        patch: UserPatch,
    ) -> Result<LocalUserRecord, DirectoryError>;

    async fn update_user(
        &self,
        local_user_id: &str,
        patch: UserPatch,
    ) -> Result<LocalUserRecord, DirectoryError>;

    async fn create_sign_in_token(&self, local_user_id: &str) -> Result<String, DirectoryError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct DirectoryState {
    users_by_id: HashMap<String, LocalUserRecord>,
    users_by_email: HashMap<String, String>,
}

impl DirectoryState {
    fn email_owner(&self, email: &str) -> Option<&String> {
        self.users_by_email.get(&normalize_email(email))
    }
}

#[derive(Debug, Clone)]
pub struct LocalUserDirectory {
    state: Arc<RwLock<DirectoryState>>,
    file: JsonSnapshotFile,
    tokens: SignInTokenIssuer,
}

impl LocalUserDirectory {
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.user_store_path.clone(),
            SignInTokenIssuer::from_config(config),
        )
    }

    pub fn new(path: Option<PathBuf>, tokens: SignInTokenIssuer) -> Self {
        let file = JsonSnapshotFile::new(path);
        let state = file.load::<DirectoryState>("users");

        Self {
            state: Arc::new(RwLock::new(state)),
            file,
            tokens,
        }
    }

    #[cfg(test)]
    pub(crate) async fn user_count(&self) -> usize {
        self.state.read().await.users_by_id.len()
    }
}

#[async_trait]
impl UserDirectory for LocalUserDirectory {
    async fn get_user(
        &self,
        local_user_id: &str,
    ) -> Result<Option<LocalUserRecord>, DirectoryError> {
        let state = self.state.read().await;
        Ok(state.users_by_id.get(local_user_id).cloned())
    }

    async fn get_user_by_email(
        &self,
        email: &str,
    ) -> Result<Option<LocalUserRecord>, DirectoryError> {
        let state = self.state.read().await;
        Ok(state
            .email_owner(email)
            .and_then(|local_user_id| state.users_by_id.get(local_user_id))
            .cloned())
    }

    async fn create_user(
        &self,
        local_user_id: &str,
        patch: UserPatch,
    ) -> Result<LocalUserRecord, DirectoryError> {
        // Held through persistence so snapshots land in commit order.
        let mut state = self.state.write().await;
        let record = {
            if state.users_by_id.contains_key(local_user_id) {
                return Err(DirectoryError::UserAlreadyExists {
                    local_user_id: local_user_id.to_string(),
                });
            }
            if let Some(email) = patch.email.as_deref()
                && state.email_owner(email).is_some()
            {
                return Err(DirectoryError::EmailAlreadyExists);
            }

            let record = LocalUserRecord {
                local_user_id: local_user_id.to_string(),
                email: patch.email,
                display_name: patch.display_name,
                avatar_url: patch.avatar_url,
            };
            if let Some(email) = record.email.as_deref() {
                state
                    .users_by_email
                    .insert(normalize_email(email), local_user_id.to_string());
            }
            state
                .users_by_id
                .insert(local_user_id.to_string(), record.clone());
            record
        };

        self.file.persist(&*state).await?;
        Ok(record)
    }

    async fn update_user(
        &self,
        local_user_id: &str,
        patch: UserPatch,
    ) -> Result<LocalUserRecord, DirectoryError> {
        let mut state = self.state.write().await;
        let record = {
            let Some(existing) = state.users_by_id.get(local_user_id).cloned() else {
                return Err(DirectoryError::UserNotFound {
                    local_user_id: local_user_id.to_string(),
                });
            };

            if let Some(email) = patch.email.as_deref()
                && state
                    .email_owner(email)
                    .is_some_and(|owner| owner != local_user_id)
            {
                return Err(DirectoryError::EmailAlreadyExists);
            }

            let mut record = existing;
            if let Some(email) = patch.email {
                if let Some(previous) = record.email.as_deref() {
                    state.users_by_email.remove(&normalize_email(previous));
                }
                state
                    .users_by_email
                    .insert(normalize_email(&email), local_user_id.to_string());
                record.email = Some(email);
            }
            if let Some(display_name) = patch.display_name {
                record.display_name = Some(display_name);
            }
            if let Some(avatar_url) = patch.avatar_url {
                record.avatar_url = Some(avatar_url);
            }

            state
                .users_by_id
                .insert(local_user_id.to_string(), record.clone());
            record
        };

        self.file.persist(&*state).await?;
        Ok(record)
    }

    async fn create_sign_in_token(&self, local_user_id: &str) -> Result<String, DirectoryError> {
        if !self.state.read().await.users_by_id.contains_key(local_user_id) {
            return Err(DirectoryError::UserNotFound {
                local_user_id: local_user_id.to_string(),
            });
        }
        Ok(self.tokens.issue(local_user_id)?)
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory(path: Option<PathBuf>) -> LocalUserDirectory {
        let config = Config::for_tests("http://127.0.0.1:9");
        LocalUserDirectory::new(path, SignInTokenIssuer::from_config(&config))
    }

    fn patch(email: Option<&str>, name: Option<&str>) -> UserPatch {
        UserPatch {
            email: email.map(ToString::to_string),
            display_name: name.map(ToString::to_string),
            avatar_url: None,
        }
    }

    #[tokio::test]
    async fn email_lookup_is_case_insensitive() {
        let users = directory(None);
        users
            .create_user("user-1", patch(Some("Ada@Example.test"), Some("Ada")))
            .await
            .expect("create user");

        let found = users
            .get_user_by_email(" ada@example.TEST ")
            .await
            .expect("lookup")
            .expect("user by email");
        assert_eq!(found.local_user_id, "user-1");
        assert_eq!(found.email.as_deref(), Some("Ada@Example.test"));
    }

    #[tokio::test]
    async fn create_rejects_duplicate_ids_and_emails() {
        let users = directory(None);
        users
            .create_user("user-1", patch(Some("ada@example.test"), None))
            .await
            .expect("create user");

        assert!(matches!(
            users.create_user("user-1", UserPatch::default()).await,
            Err(DirectoryError::UserAlreadyExists { .. })
        ));
        assert!(matches!(
            users
                .create_user("user-2", patch(Some("ADA@example.test"), None))
                .await,
            Err(DirectoryError::EmailAlreadyExists)
        ));
    }

    #[tokio::test]
    async fn update_only_touches_patched_fields() {
        let users = directory(None);
        users
            .create_user("user-1", patch(Some("old@example.test"), Some("Ada")))
            .await
            .expect("create user");

        let updated = users
            .update_user(
                "user-1",
                UserPatch {
                    avatar_url: Some("https://cdn.example.test/a.png".to_string()),
                    email: Some("new@example.test".to_string()),
                    ..UserPatch::default()
                },
            )
            .await
            .expect("update user");

        assert_eq!(updated.display_name.as_deref(), Some("Ada"));
        assert_eq!(updated.email.as_deref(), Some("new@example.test"));
        assert!(
            users
                .get_user_by_email("old@example.test")
                .await
                .expect("lookup")
                .is_none()
        );
        assert!(matches!(
            users.update_user("missing", UserPatch::default()).await,
            Err(DirectoryError::UserNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn sign_in_token_requires_existing_user() {
        let users = directory(None);
        assert!(matches!(
            users.create_sign_in_token("ghost").await,
            Err(DirectoryError::UserNotFound { .. })
        ));

        users
            .create_user("user-1", UserPatch::default())
            .await
            .expect("create user");
        let token = users
            .create_sign_in_token("user-1")
            .await
            .expect("sign-in token");
        assert_eq!(token.split('.').count(), 3);
    }

    #[tokio::test]
    async fn users_survive_restart() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("users.json");

        directory(Some(path.clone()))
            .create_user("user-1", patch(Some("ada@example.test"), Some("Ada")))
            .await
            .expect("create user");

        let restored = directory(Some(path));
        assert_eq!(restored.user_count().await, 1);
        assert!(
            restored
                .get_user_by_email("ada@example.test")
                .await
                .expect("lookup")
                .is_some()
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_creates_leave_disk_matching_memory() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("users.json");
        let users = directory(Some(path.clone()));

        let tasks = (0..32)
            .map(|index| {
                let users = users.clone();
                tokio::spawn(async move {
                    users
                        .create_user(&format!("user-{index}"), UserPatch::default())
                        .await
                        .expect("create user");
                })
            })
            .collect::<Vec<_>>();
        for task in tasks {
            task.await.expect("join create");
        }

        assert_eq!(users.user_count().await, 32);
        assert_eq!(directory(Some(path)).user_count().await, 32);
    }
}

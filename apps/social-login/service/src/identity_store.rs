use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use crate::persistence::{JsonSnapshotFile, SnapshotError};
use crate::provider::Provider;

const SOCIAL_IDENTITIES: &str = "socialIdentities";
const USER_SOCIAL_IDENTITIES: &str = "userSocialIdentities";
const TWITTER_REQUEST_TOKEN_SECRETS: &str = "twitterRequestTokenSecrets";
const FORBIDDEN_KEY_CHARS: [char; 6] = ['/', '.', '#', '$', '[', ']'];

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid store key '{key}'")]
    InvalidKey { key: String },
    #[error("stored value at {path} is malformed: {message}")]
    Malformed { path: String, message: String },
    #[error(transparent)]
    Persist(#[from] SnapshotError),
}

/// Hierarchical JSON key-value tree addressed by `/`-separated paths.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError>;

    /// Applies every entry together; `None` deletes the path.
    async fn update(&self, patch: Vec<(String, Option<Value>)>) -> Result<(), StoreError>;

    /// Reads and deletes `path` in one step.
    async fn take(&self, path: &str) -> Result<Option<Value>, StoreError>;

    async fn snapshot(&self) -> Value;
}

/// In-memory tree, optionally mirrored to a JSON file after each write.
#[derive(Debug, Clone)]
pub struct JsonTreeStore {
    root: Arc<RwLock<Value>>,
    file: JsonSnapshotFile,
}

impl JsonTreeStore {
    pub fn new(path: Option<PathBuf>) -> Self {
        let file = JsonSnapshotFile::new(path);
        let loaded = file.load::<Value>("identity");
        let root = if loaded.is_object() {
            loaded
        } else {
            Value::Object(Map::new())
        };

        Self {
            root: Arc::new(RwLock::new(root)),
            file,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(None)
    }
}

#[async_trait]
impl KeyValueStore for JsonTreeStore {
    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError> {
        let segments = split_path(path)?;
        let root = self.root.read().await;
        Ok(lookup(&root, &segments).cloned())
    }

    async fn update(&self, patch: Vec<(String, Option<Value>)>) -> Result<(), StoreError> {
        let mut resolved = Vec::with_capacity(patch.len());
        for (path, value) in patch {
            resolved.push((split_path(&path)?, value));
        }

        // The write guard is held through persistence so snapshots land in commit order.
        let mut root = self.root.write().await;
        for (segments, value) in resolved {
            match value {
                Some(value) if !value.is_null() => insert(&mut root, &segments, value),
                _ => {
                    remove(&mut root, &segments);
                }
            }
        }

        self.file.persist(&*root).await?;
        Ok(())
    }

    async fn take(&self, path: &str) -> Result<Option<Value>, StoreError> {
        let segments = split_path(path)?;
        let mut root = self.root.write().await;
        let taken = remove(&mut root, &segments);
        if taken.is_some() {
            self.file.persist(&*root).await?;
        }
        Ok(taken)
    }

    async fn snapshot(&self) -> Value {
        self.root.read().await.clone()
    }
}

fn split_path(path: &str) -> Result<Vec<String>, StoreError> {
    let segments = path
        .split('/')
        .filter(|segment| !segment.is_empty())
        .map(ToString::to_string)
        .collect::<Vec<_>>();

    if segments.is_empty() {
        return Err(StoreError::InvalidKey {
            key: path.to_string(),
        });
    }
    Ok(segments)
}

fn lookup<'a>(root: &'a Value, segments: &[String]) -> Option<&'a Value> {
    segments
        .iter()
        .try_fold(root, |node, segment| node.get(segment.as_str()))
}

fn insert(root: &mut Value, segments: &[String], value: Value) {
    let mut node = root;
    for segment in segments {
        // Scalars on the way down are replaced by objects.
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        node = &mut node[segment.as_str()];
    }
    *node = value;
}

/// Removes the value at `segments`, pruning parents left empty.
fn remove(node: &mut Value, segments: &[String]) -> Option<Value> {
    let (first, rest) = segments.split_first()?;
    let Value::Object(map) = node else {
        return None;
    };

    if rest.is_empty() {
        return map.remove(first.as_str());
    }

    let child = map.get_mut(first.as_str())?;
    let removed = remove(child, rest);
    if child.as_object().is_some_and(Map::is_empty) {
        map.remove(first.as_str());
    }
    removed
}

/// Rejects request-supplied values that would escape or reshape a store path.
pub fn store_key(raw: &str) -> Result<&str, StoreError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.len() > 768 || trimmed.contains(&FORBIDDEN_KEY_CHARS[..]) {
        return Err(StoreError::InvalidKey {
            key: raw.to_string(),
        });
    }
    Ok(trimmed)
}

/// Link between one external account and the local user it signs in as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderIdentityRecord {
    pub provider: Provider,
    pub external_id: String,
    pub access_token: String,
    pub access_secret: Option<String>,
    pub local_user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredProviderIdentity {
    access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    access_secret: Option<String>,
    local_user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredUserIdentity {
    user_id: String,
}

/// Typed tables over the key-value tree:
/// `/socialIdentities/{provider}/{externalId}`,
/// `/userSocialIdentities/{localUserId}/{provider}` and
/// `/twitterRequestTokenSecrets/{clientId}`.
#[derive(Clone)]
pub struct IdentityStore {
    tree: Arc<dyn KeyValueStore>,
}

impl IdentityStore {
    pub fn new(tree: Arc<dyn KeyValueStore>) -> Self {
        Self { tree }
    }

    pub async fn provider_identity(
        &self,
        provider: Provider,
        external_id: &str,
    ) -> Result<Option<ProviderIdentityRecord>, StoreError> {
        let path = provider_identity_path(provider, external_id)?;
        let Some(value) = self.tree.get(&path).await? else {
            return Ok(None);
        };

        let stored = serde_json::from_value::<StoredProviderIdentity>(value).map_err(|error| {
            StoreError::Malformed {
                path: path.clone(),
                message: error.to_string(),
            }
        })?;

        Ok(Some(ProviderIdentityRecord {
            provider,
            external_id: external_id.to_string(),
            access_token: stored.access_token,
            access_secret: stored.access_secret,
            local_user_id: stored.local_user_id,
        }))
    }

    /// Provider names already linked to a local user, in stored order.
    pub async fn linked_providers(&self, local_user_id: &str) -> Result<Vec<String>, StoreError> {
        let path = format!("/{USER_SOCIAL_IDENTITIES}/{}", store_key(local_user_id)?);
        let providers = match self.tree.get(&path).await? {
            Some(Value::Object(map)) => map.keys().cloned().collect(),
            _ => Vec::new(),
        };
        Ok(providers)
    }

    /// Writes the identity record and its inverse index entry as one update.
    pub async fn link_identity(&self, record: &ProviderIdentityRecord) -> Result<(), StoreError> {
        let identity_path = provider_identity_path(record.provider, &record.external_id)?;
        let index_path = format!(
            "/{USER_SOCIAL_IDENTITIES}/{}/{}",
            store_key(&record.local_user_id)?,
            record.provider.as_str()
        );

        let identity = serde_json::to_value(StoredProviderIdentity {
            access_token: record.access_token.clone(),
            access_secret: record.access_secret.clone(),
            local_user_id: record.local_user_id.clone(),
        })
        .map_err(|error| StoreError::Malformed {
            path: identity_path.clone(),
            message: error.to_string(),
        })?;
        let index = serde_json::to_value(StoredUserIdentity {
            user_id: record.external_id.clone(),
        })
        .map_err(|error| StoreError::Malformed {
            path: index_path.clone(),
            message: error.to_string(),
        })?;

        self.tree
            .update(vec![
                (identity_path, Some(identity)),
                (index_path, Some(index)),
            ])
            .await
    }

    pub async fn save_twitter_request_secret(
        &self,
        client_id: &str,
        secret: &str,
    ) -> Result<(), StoreError> {
        let path = format!("/{TWITTER_REQUEST_TOKEN_SECRETS}/{}", store_key(client_id)?);
        self.tree
            .update(vec![(path, Some(Value::String(secret.to_string())))])
            .await
    }

    /// Consumes the pending handshake secret so it can only be used once.
    pub async fn take_twitter_request_secret(
        &self,
        client_id: &str,
    ) -> Result<Option<String>, StoreError> {
        let path = format!("/{TWITTER_REQUEST_TOKEN_SECRETS}/{}", store_key(client_id)?);
        let taken = self.tree.take(&path).await?;
        Ok(taken
            .as_ref()
            .and_then(Value::as_str)
            .filter(|secret| !secret.is_empty())
            .map(ToString::to_string))
    }

    pub async fn snapshot(&self) -> Value {
        self.tree.snapshot().await
    }
}

fn provider_identity_path(provider: Provider, external_id: &str) -> Result<String, StoreError> {
    Ok(format!(
        "/{SOCIAL_IDENTITIES}/{}/{}",
        provider.as_str(),
        store_key(external_id)?
    ))
}

//! Application records and the store they live in.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::StoreError;

/// Defaults applied when a run request leaves a field empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptDefaults {
    #[serde(default)]
    pub file_path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Exposed to scripts as environment variables.
    #[serde(default)]
    pub secrets: BTreeMap<String, String>,
    #[serde(default)]
    pub script: ScriptDefaults,
}

impl AppConfig {
    /// Secrets rendered as `KEY=VALUE` pairs.
    pub fn env_pairs(&self) -> Vec<String> {
        self.secrets
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppRecord {
    pub id: String,
    pub owner: String,
    pub name: String,
    #[serde(default)]
    pub config: AppConfig,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl AppRecord {
    pub fn new(id: impl Into<String>, owner: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            owner: owner.into(),
            name: name.into(),
            config: AppConfig::default(),
            created: now,
            updated: now,
        }
    }

    pub fn with_secret(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.secrets.insert(key.into(), value.into());
        self
    }
}

/// CRUD over application records.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_app(&self, id: &str) -> Result<AppRecord, StoreError>;

    /// Apps belonging to `owner`, or all apps when `owner` is `None`.
    async fn list_apps(&self, owner: Option<&str>) -> Result<Vec<AppRecord>, StoreError>;

    async fn create_app(&self, app: AppRecord) -> Result<AppRecord, StoreError>;

    async fn update_app(&self, app: AppRecord) -> Result<AppRecord, StoreError>;

    async fn delete_app(&self, id: &str) -> Result<(), StoreError>;
}

/// In-memory [`Store`].
#[derive(Default)]
pub struct MemoryStore {
    apps: RwLock<HashMap<String, AppRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_app(&self, id: &str) -> Result<AppRecord, StoreError> {
        self.apps
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })
    }

    async fn list_apps(&self, owner: Option<&str>) -> Result<Vec<AppRecord>, StoreError> {
        let apps = self.apps.read().await;
        let mut list: Vec<_> = apps
            .values()
            .filter(|app| owner.is_none_or(|o| app.owner == o))
            .cloned()
            .collect();
        list.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)));
        Ok(list)
    }

    async fn create_app(&self, app: AppRecord) -> Result<AppRecord, StoreError> {
        let mut apps = self.apps.write().await;
        if apps.contains_key(&app.id) {
            return Err(StoreError::AlreadyExists { id: app.id });
        }
        apps.insert(app.id.clone(), app.clone());
        Ok(app)
    }

    async fn update_app(&self, mut app: AppRecord) -> Result<AppRecord, StoreError> {
        let mut apps = self.apps.write().await;
        let existing = apps
            .get_mut(&app.id)
            .ok_or_else(|| StoreError::NotFound { id: app.id.clone() })?;
        app.created = existing.created;
        app.updated = Utc::now();
        *existing = app.clone();
        Ok(app)
    }

    async fn delete_app(&self, id: &str) -> Result<(), StoreError> {
        self.apps
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })
    }
}

//! Configuration Store
//!
//! The durable, human-editable record of backend definitions and routing
//! rules. The router reads it at startup and before every administrative
//! mutation, and writes mutations back before swapping the registry.
//!
//! # File Layout
//!
//! ```toml
//! [backends.fast]
//! display_name = "Fast local model"
//! kind = "local"
//! capabilities = ["text_generation"]
//! max_tokens = 4000
//! cost_per_token = 0.0
//! priority = 1
//!
//! [routing_rules]
//! default_backend = "fast"
//!
//! [routing_rules.capability_map]
//! text_generation = ["fast", "big"]
//!
//! [routing_rules.token_thresholds]
//! fast = 4000
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::registry::{BackendDefinition, CallerPreferences, RegistryError, RoutingRules};

// =============================================================================
// Error Types
// =============================================================================

/// Failures reading or writing the store
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing file could not be read
    #[error("failed to read store at {path}: {source}")]
    Read {
        /// Store location
        path: PathBuf,
        /// Underlying IO error
        source: std::io::Error,
    },

    /// The backing file could not be written
    #[error("failed to write store at {path}: {source}")]
    Write {
        /// Store location
        path: PathBuf,
        /// Underlying IO error
        source: std::io::Error,
    },

    /// The document is not valid TOML for this schema
    #[error("failed to parse store document: {0}")]
    Parse(#[from] toml::de::Error),

    /// The document could not be serialized
    #[error("failed to serialize store document: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// The store refused the operation
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

// =============================================================================
// Store Document
// =============================================================================

/// The persisted document: backend definitions plus routing rules
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreDocument {
    /// Backend id -> definition
    pub backends: BTreeMap<String, BackendDefinition>,
    /// Rules consumed by the selection policy
    pub routing_rules: RoutingRules,
}

impl StoreDocument {
    /// Parse a TOML document
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Parse`] for malformed input.
    pub fn from_toml(content: &str) -> Result<Self, StoreError> {
        let mut document: Self = toml::from_str(content)?;
        document.normalize();
        Ok(document)
    }

    /// Serialize to TOML
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Serialize`] if a value cannot be represented.
    pub fn to_toml(&self) -> Result<String, StoreError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Table keys are authoritative for backend ids
    fn normalize(&mut self) {
        for (id, definition) in &mut self.backends {
            if definition.id != *id {
                definition.id.clone_from(id);
            }
            if definition.display_name.is_empty() {
                definition.display_name.clone_from(id);
            }
        }
    }

    /// Insert or overwrite a definition without validation
    pub fn insert(&mut self, definition: BackendDefinition) {
        self.backends.insert(definition.id.clone(), definition);
    }

    /// Add a new backend
    ///
    /// # Errors
    ///
    /// Rejects invalid definitions and duplicate ids.
    pub fn add_backend(&mut self, definition: BackendDefinition) -> Result<(), RegistryError> {
        definition.validate()?;
        if self.backends.contains_key(&definition.id) {
            return Err(RegistryError::DuplicateBackend(definition.id));
        }
        self.insert(definition);
        Ok(())
    }

    /// Replace an existing backend's definition
    ///
    /// # Errors
    ///
    /// Rejects unknown ids, mismatched ids and invalid definitions.
    pub fn update_backend(
        &mut self,
        backend_id: &str,
        mut definition: BackendDefinition,
    ) -> Result<(), RegistryError> {
        if !self.backends.contains_key(backend_id) {
            return Err(RegistryError::UnknownBackend(backend_id.to_string()));
        }
        if definition.id.is_empty() {
            definition.id = backend_id.to_string();
        }
        if definition.id != backend_id {
            return Err(RegistryError::InvalidDefinition {
                id: definition.id,
                reason: format!("id cannot be changed from '{backend_id}'"),
            });
        }
        definition.validate()?;
        self.insert(definition);
        Ok(())
    }

    /// Remove a disabled backend
    ///
    /// # Errors
    ///
    /// Rejects unknown ids and enabled backends.
    pub fn remove_backend(&mut self, backend_id: &str) -> Result<BackendDefinition, RegistryError> {
        match self.backends.get(backend_id) {
            None => Err(RegistryError::UnknownBackend(backend_id.to_string())),
            Some(definition) if definition.enabled => {
                Err(RegistryError::BackendStillEnabled(backend_id.to_string()))
            }
            Some(_) => self
                .backends
                .remove(backend_id)
                .ok_or_else(|| RegistryError::UnknownBackend(backend_id.to_string())),
        }
    }

    /// Toggle a backend's `enabled` flag
    ///
    /// # Errors
    ///
    /// Rejects unknown ids.
    pub fn set_enabled(&mut self, backend_id: &str, enabled: bool) -> Result<(), RegistryError> {
        let definition = self
            .backends
            .get_mut(backend_id)
            .ok_or_else(|| RegistryError::UnknownBackend(backend_id.to_string()))?;
        definition.enabled = enabled;
        Ok(())
    }

    /// Replace one caller's preferences
    pub fn set_caller_preferences(&mut self, caller_id: &str, preferences: CallerPreferences) {
        self.routing_rules
            .caller_preferences
            .insert(caller_id.to_string(), preferences);
    }
}

// =============================================================================
// Store Trait
// =============================================================================

/// Durable home of the [`StoreDocument`]
///
/// Implementations must be safe to call from any thread; the router
/// serializes mutations itself.
pub trait ConfigStore: Send + Sync {
    /// Human-readable location, for logs
    fn describe(&self) -> String;

    /// Read the current document
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the document is unreadable or malformed.
    fn load(&self) -> Result<StoreDocument, StoreError>;

    /// Persist a document
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the write fails; nothing is applied.
    fn save(&self, document: &StoreDocument) -> Result<(), StoreError>;
}

// =============================================================================
// File Store
// =============================================================================

/// TOML file store
///
/// A missing file reads as an empty document. Writes go to a sibling
/// temporary file that is renamed over the original.
#[derive(Clone, Debug)]
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    /// Store backed by the given path
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the store file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl ConfigStore for FileConfigStore {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn load(&self) -> Result<StoreDocument, StoreError> {
        if !self.path.exists() {
            tracing::debug!(
                path = %self.path.display(),
                "Store file not found, using empty document"
            );
            return Ok(StoreDocument::default());
        }

        let content = std::fs::read_to_string(&self.path).map_err(|source| StoreError::Read {
            path: self.path.clone(),
            source,
        })?;
        StoreDocument::from_toml(&content)
    }

    fn save(&self, document: &StoreDocument) -> Result<(), StoreError> {
        let content = document.to_toml()?;
        let write_error = |source: std::io::Error| StoreError::Write {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(write_error)?;
            }
        }

        let temp = self.temp_path();
        std::fs::write(&temp, content).map_err(write_error)?;
        std::fs::rename(&temp, &self.path).map_err(write_error)?;

        tracing::debug!(
            path = %self.path.display(),
            backends = document.backends.len(),
            "Store saved"
        );
        Ok(())
    }
}

// =============================================================================
// Memory Store
// =============================================================================

/// In-process store for embedding and tests
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    document: Mutex<StoreDocument>,
}

impl MemoryConfigStore {
    /// Store seeded with a document
    #[must_use]
    pub fn new(document: StoreDocument) -> Self {
        Self {
            document: Mutex::new(document),
        }
    }

    /// Copy of the stored document
    #[must_use]
    pub fn document(&self) -> StoreDocument {
        self.document.lock().clone()
    }
}

impl ConfigStore for MemoryConfigStore {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    fn load(&self) -> Result<StoreDocument, StoreError> {
        Ok(self.document.lock().clone())
    }

    fn save(&self, document: &StoreDocument) -> Result<(), StoreError> {
        *self.document.lock() = document.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::registry::BackendKind;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    fn sample() -> StoreDocument {
        let mut doc = StoreDocument::default();
        doc.insert(
            BackendDefinition::new("fast", BackendKind::Local)
                .with_capabilities(["text_generation"])
                .with_max_tokens(4000)
                .with_priority(1),
        );
        doc.insert(
            BackendDefinition::new("big", BackendKind::Cloud)
                .with_capabilities(["text_generation", "code_generation"])
                .with_max_tokens(16000)
                .with_cost_per_token(0.000_02)
                .with_priority(2),
        );
        doc.routing_rules.default_backend = Some("fast".to_string());
        doc.routing_rules.capability_map.insert(
            "text_generation".to_string(),
            vec!["fast".to_string(), "big".to_string()],
        );
        doc.set_caller_preferences("alice", CallerPreferences::preferring("big"));
        doc
    }

    #[test]
    fn test_parse_hand_written_document() {
        let content = r#"
[backends.fast]
kind = "local"
capabilities = ["text_generation"]
max_tokens = 4000
priority = 1

[backends.big]
display_name = "Big cloud model"
kind = "cloud"
capabilities = ["text_generation"]
max_tokens = 16000
cost_per_token = 0.00002
priority = 2
enabled = false

[routing_rules]
default_backend = "fast"

[routing_rules.capability_map]
text_generation = ["fast", "big"]

[routing_rules.caller_preferences.alice]
preferred_backend = "big"
excluded_backends = ["fast"]
"#;

        let doc = StoreDocument::from_toml(content).unwrap();

        let fast = &doc.backends["fast"];
        assert_eq!(fast.id, "fast");
        assert_eq!(fast.display_name, "fast");
        assert!(fast.enabled);
        assert!(!doc.backends["big"].enabled);
        assert_eq!(doc.backends["big"].kind, BackendKind::Cloud);

        let alice = doc.routing_rules.preferences_for("alice").unwrap();
        assert_eq!(alice.preferred_backend.as_deref(), Some("big"));
        assert!(alice.excludes("fast"));
    }

    #[test]
    fn test_file_store_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = FileConfigStore::new(dir.path().join("nested").join("backends.toml"));

        store.save(&sample()).unwrap();
        let loaded = store.load().unwrap();

        assert_eq!(loaded, sample());
    }

    #[test]
    fn test_missing_file_is_empty_document() {
        let dir = TempDir::new().unwrap();
        let store = FileConfigStore::new(dir.path().join("absent.toml"));

        assert_eq!(store.load().unwrap(), StoreDocument::default());
    }

    #[test]
    fn test_malformed_file_is_parse_error() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"[backends.fast\nmax_tokens = 'x'").unwrap();

        let store = FileConfigStore::new(file.path());
        assert!(matches!(store.load(), Err(StoreError::Parse(_))));
    }

    #[test]
    fn test_add_rejects_duplicate() {
        let mut doc = sample();
        let result = doc.add_backend(BackendDefinition::new("fast", BackendKind::Local));

        assert_eq!(
            result,
            Err(RegistryError::DuplicateBackend("fast".to_string()))
        );
    }

    #[test]
    fn test_remove_requires_disabled() {
        let mut doc = sample();

        assert_eq!(
            doc.remove_backend("fast").unwrap_err(),
            RegistryError::BackendStillEnabled("fast".to_string())
        );
        assert_eq!(
            doc.remove_backend("ghost").unwrap_err(),
            RegistryError::UnknownBackend("ghost".to_string())
        );

        doc.set_enabled("fast", false).unwrap();
        let removed = doc.remove_backend("fast").unwrap();
        assert_eq!(removed.id, "fast");
        assert!(!doc.backends.contains_key("fast"));
    }

    #[test]
    fn test_update_cannot_rename() {
        let mut doc = sample();
        let renamed = BackendDefinition::new("other", BackendKind::Local);

        assert!(matches!(
            doc.update_backend("fast", renamed),
            Err(RegistryError::InvalidDefinition { .. })
        ));

        let mut unnamed = doc.backends["fast"].clone().with_max_tokens(8000);
        unnamed.id = String::new();
        doc.update_backend("fast", unnamed).unwrap();
        assert_eq!(doc.backends["fast"].max_tokens, 8000);
    }

    #[test]
    fn test_memory_store_keeps_last_save() {
        let store = MemoryConfigStore::default();
        store.save(&sample()).unwrap();

        assert_eq!(store.load().unwrap(), sample());
        assert_eq!(store.describe(), "memory");
    }
}

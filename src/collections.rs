//! Scope and collection manifest of a bucket.

use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;

/// Name of the scope and collection every bucket starts with.
pub const DEFAULT_NAME: &str = "_default";

/// Errors raised by manifest changes and lookups.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ManifestError {
    #[error("Scope already exists: {0}")]
    ScopeExists(String),

    #[error("Scope not found: {0}")]
    ScopeNotFound(String),

    #[error("Collection already exists: {0}.{1}")]
    CollectionExists(String, String),

    #[error("Collection not found: {0}.{1}")]
    CollectionNotFound(String, String),

    #[error("The default scope cannot be dropped")]
    DefaultScope,
}

#[derive(Debug, Clone)]
struct ScopeEntry {
    name: String,
}

#[derive(Debug, Clone)]
struct CollectionEntry {
    name: String,
    scope_uid: u32,
    max_ttl: u32,
}

#[derive(Debug)]
struct ManifestState {
    rev: u64,
    // Indexed by uid; dropped entries stay as `None` so uids are never reused
    scopes: Vec<Option<ScopeEntry>>,
    collections: Vec<Option<CollectionEntry>>,
}

impl ManifestState {
    fn scope_uid(&self, name: &str) -> Option<u32> {
        self.scopes.iter().enumerate().find_map(|(uid, entry)| {
            entry
                .as_ref()
                .filter(|s| s.name == name)
                .and_then(|_| u32::try_from(uid).ok())
        })
    }

    fn collection_uid(&self, scope_uid: u32, name: &str) -> Option<u32> {
        self.collections.iter().enumerate().find_map(|(uid, entry)| {
            entry
                .as_ref()
                .filter(|c| c.scope_uid == scope_uid && c.name == name)
                .and_then(|_| u32::try_from(uid).ok())
        })
    }
}

/// A collection as listed in a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionInfo {
    pub uid: u32,
    pub name: String,
    pub max_ttl: u32,
}

/// A scope and its collections as listed in a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeInfo {
    pub uid: u32,
    pub name: String,
    pub collections: Vec<CollectionInfo>,
}

/// Point-in-time copy of a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestSnapshot {
    pub rev: u64,
    pub scopes: Vec<ScopeInfo>,
}

#[derive(Serialize)]
struct JsonManifest<'a> {
    uid: String,
    scopes: Vec<JsonScope<'a>>,
}

#[derive(Serialize)]
struct JsonScope<'a> {
    uid: String,
    name: &'a str,
    collections: Vec<JsonCollection<'a>>,
}

#[derive(Serialize)]
struct JsonCollection<'a> {
    uid: String,
    name: &'a str,
    #[serde(rename = "maxTTL", skip_serializing_if = "is_zero")]
    max_ttl: u32,
}

fn is_zero(v: &u32) -> bool {
    *v == 0
}

impl ManifestSnapshot {
    /// Manifest in the wire format shared by the KV and REST interfaces.
    /// Uids are lowercase hex strings.
    pub fn to_json(&self) -> serde_json::Value {
        let manifest = JsonManifest {
            uid: format!("{:x}", self.rev),
            scopes: self
                .scopes
                .iter()
                .map(|scope| JsonScope {
                    uid: format!("{:x}", scope.uid),
                    name: &scope.name,
                    collections: scope
                        .collections
                        .iter()
                        .map(|c| JsonCollection {
                            uid: format!("{:x}", c.uid),
                            name: &c.name,
                            max_ttl: c.max_ttl,
                        })
                        .collect(),
                })
                .collect(),
        };
        serde_json::to_value(manifest).unwrap_or_default()
    }
}

/// Thread-safe, versioned scope/collection manifest.
#[derive(Debug)]
pub struct CollectionManifest {
    state: RwLock<ManifestState>,
}

impl Default for CollectionManifest {
    fn default() -> Self {
        Self::new()
    }
}

impl CollectionManifest {
    /// Manifest holding only the default scope and collection (both uid 0).
    pub fn new() -> Self {
        Self {
            state: RwLock::new(ManifestState {
                rev: 0,
                scopes: vec![Some(ScopeEntry {
                    name: DEFAULT_NAME.to_string(),
                })],
                collections: vec![Some(CollectionEntry {
                    name: DEFAULT_NAME.to_string(),
                    scope_uid: 0,
                    max_ttl: 0,
                })],
            }),
        }
    }

    pub fn rev(&self) -> u64 {
        self.state.read().rev
    }

    /// Add a scope. Returns the new manifest revision.
    pub fn add_scope(&self, name: &str) -> Result<u64, ManifestError> {
        let mut state = self.state.write();
        if state.scope_uid(name).is_some() {
            return Err(ManifestError::ScopeExists(name.to_string()));
        }
        state.scopes.push(Some(ScopeEntry {
            name: name.to_string(),
        }));
        state.rev += 1;
        Ok(state.rev)
    }

    /// Drop a scope and every collection in it. Returns the new revision.
    pub fn drop_scope(&self, name: &str) -> Result<u64, ManifestError> {
        if name == DEFAULT_NAME {
            return Err(ManifestError::DefaultScope);
        }
        let mut state = self.state.write();
        let uid = state
            .scope_uid(name)
            .ok_or_else(|| ManifestError::ScopeNotFound(name.to_string()))?;
        if let Some(slot) = state.scopes.get_mut(uid as usize) {
            *slot = None;
        }
        for slot in state.collections.iter_mut() {
            if slot.as_ref().is_some_and(|c| c.scope_uid == uid) {
                *slot = None;
            }
        }
        state.rev += 1;
        Ok(state.rev)
    }

    /// Add a collection to a scope. Returns the new revision.
    pub fn add_collection(&self, scope: &str, name: &str, max_ttl: u32) -> Result<u64, ManifestError> {
        let mut state = self.state.write();
        let scope_uid = state
            .scope_uid(scope)
            .ok_or_else(|| ManifestError::ScopeNotFound(scope.to_string()))?;
        if state.collection_uid(scope_uid, name).is_some() {
            return Err(ManifestError::CollectionExists(scope.to_string(), name.to_string()));
        }
        state.collections.push(Some(CollectionEntry {
            name: name.to_string(),
            scope_uid,
            max_ttl,
        }));
        state.rev += 1;
        Ok(state.rev)
    }

    /// Drop a collection. Returns the new revision.
    pub fn drop_collection(&self, scope: &str, name: &str) -> Result<u64, ManifestError> {
        let mut state = self.state.write();
        let scope_uid = state
            .scope_uid(scope)
            .ok_or_else(|| ManifestError::ScopeNotFound(scope.to_string()))?;
        let uid = state
            .collection_uid(scope_uid, name)
            .ok_or_else(|| ManifestError::CollectionNotFound(scope.to_string(), name.to_string()))?;
        if let Some(slot) = state.collections.get_mut(uid as usize) {
            *slot = None;
        }
        state.rev += 1;
        Ok(state.rev)
    }

    /// Scope and collection names for a collection id.
    pub fn get_by_id(&self, collection_id: u32) -> Option<(String, String)> {
        let state = self.state.read();
        let collection = state.collections.get(collection_id as usize)?.as_ref()?;
        let scope = state.scopes.get(collection.scope_uid as usize)?.as_ref()?;
        Some((scope.name.clone(), collection.name.clone()))
    }

    pub fn has_collection_id(&self, collection_id: u32) -> bool {
        self.get_by_id(collection_id).is_some()
    }

    /// Resolve a collection id by name. Returns the manifest revision and the id.
    pub fn get_collection_id(&self, scope: &str, name: &str) -> Result<(u64, u32), ManifestError> {
        let state = self.state.read();
        let scope_uid = state
            .scope_uid(scope)
            .ok_or_else(|| ManifestError::ScopeNotFound(scope.to_string()))?;
        let uid = state
            .collection_uid(scope_uid, name)
            .ok_or_else(|| ManifestError::CollectionNotFound(scope.to_string(), name.to_string()))?;
        Ok((state.rev, uid))
    }

    pub fn snapshot(&self) -> ManifestSnapshot {
        let state = self.state.read();
        let scopes = state
            .scopes
            .iter()
            .enumerate()
            .filter_map(|(uid, entry)| {
                let entry = entry.as_ref()?;
                let uid = u32::try_from(uid).ok()?;
                let collections = state
                    .collections
                    .iter()
                    .enumerate()
                    .filter_map(|(cid, c)| {
                        let c = c.as_ref().filter(|c| c.scope_uid == uid)?;
                        Some(CollectionInfo {
                            uid: u32::try_from(cid).ok()?,
                            name: c.name.clone(),
                            max_ttl: c.max_ttl,
                        })
                    })
                    .collect();
                Some(ScopeInfo {
                    uid,
                    name: entry.name.clone(),
                    collections,
                })
            })
            .collect();
        ManifestSnapshot {
            rev: state.rev,
            scopes,
        }
    }
}

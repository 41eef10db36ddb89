//! Error map served by GET_ERROR_MAP, generated from the status table.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::status::STATUSES;

/// Highest error map format version the server understands.
pub const MAX_ERRMAP_VERSION: u16 = 2;

/// One entry of the error map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMapEntry {
    pub name: String,
    pub desc: String,
    pub attrs: Vec<String>,
}

/// Error map document: status codes (lowercase hex, no prefix) to entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMap {
    pub version: u16,
    pub revision: u32,
    pub errors: BTreeMap<String, ErrorMapEntry>,
}

impl ErrorMap {
    /// Build the error map for a requested format version.
    pub fn generate(requested_version: u16) -> Self {
        let errors = STATUSES
            .iter()
            .map(|info| {
                (
                    format!("{:x}", info.status.0),
                    ErrorMapEntry {
                        name: info.name.to_string(),
                        desc: info.desc.to_string(),
                        attrs: info.attrs.iter().map(|a| a.to_string()).collect(),
                    },
                )
            })
            .collect();
        Self {
            version: requested_version.clamp(1, MAX_ERRMAP_VERSION),
            revision: 1,
            errors,
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_map_covers_statuses() {
        let map = ErrorMap::generate(2);
        assert_eq!(map.version, 2);
        assert_eq!(map.errors.len(), STATUSES.len());

        let locked = map.errors.get("9").unwrap();
        assert_eq!(locked.name, "LOCKED");
        assert!(locked.attrs.contains(&"retry-now".to_string()));
        assert!(map.errors.contains_key("cc"));
    }

    #[test]
    fn version_is_clamped() {
        assert_eq!(ErrorMap::generate(0).version, 1);
        assert_eq!(ErrorMap::generate(9).version, MAX_ERRMAP_VERSION);
    }

    #[test]
    fn serializes_to_json() {
        let bytes = ErrorMap::generate(1).to_json().unwrap();
        let parsed: ErrorMap = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed.revision, 1);
    }
}

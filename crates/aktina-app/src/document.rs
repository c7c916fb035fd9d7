//! Denormalized search documents built from the archive's three-level
//! study / series / instance hierarchy.

use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

/// Top-level search document, indexed under the archive-assigned study UID.
/// Transient: built for a single upsert, after which the search engine is
/// the system of record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StudyDocument {
    pub uid: String,
    pub metadata: JsonMap<String, JsonValue>,
    pub series: Vec<SeriesDocument>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeriesDocument {
    pub uid: String,
    pub metadata: JsonMap<String, JsonValue>,
    pub instances: Vec<InstanceDocument>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceDocument {
    pub uid: String,
    pub metadata: JsonMap<String, JsonValue>,
    /// Per-instance technical record from the archive's metadata endpoint,
    /// kept separate from the query-level attribute set.
    pub descriptor: JsonMap<String, JsonValue>,
}

impl StudyDocument {
    pub fn new(uid: impl Into<String>, metadata: JsonMap<String, JsonValue>) -> Self {
        let uid = uid.into();
        debug_assert!(!uid.is_empty());
        Self {
            uid,
            metadata,
            series: Vec::new(),
        }
    }

    pub fn instance_count(&self) -> usize {
        self.series.iter().map(|series| series.instances.len()).sum()
    }
}

impl SeriesDocument {
    pub fn new(uid: impl Into<String>, metadata: JsonMap<String, JsonValue>) -> Self {
        Self {
            uid: uid.into(),
            metadata,
            instances: Vec::new(),
        }
    }
}

//! Discovery manifest returned by the built-in self-service.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::envelope::OperationId;

/// Service ID of the built-in self-describing service.
pub const SELF_SERVICE_ID: &str = "service-wrapper";

/// Operation path of the discovery probe.
pub const GET_IDS_PATH: &str = "get-ids";

/// Current manifest schema version.
pub const MANIFEST_VERSION: u32 = 1;

/// The discovery probe's address.
#[must_use]
pub fn probe_operation() -> OperationId {
    OperationId::new(SELF_SERVICE_ID, GET_IDS_PATH)
}

/// `{"version": 1, "ids": [...]}`: the service IDs a process hosts, the
/// self-service excluded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceManifest {
    pub version: u32,
    pub ids: Vec<String>,
}

impl ServiceManifest {
    /// Builds a manifest, sorting and deduplicating the IDs and dropping the
    /// self-service.
    #[must_use]
    pub fn new(ids: impl IntoIterator<Item = String>) -> Self {
        let mut ids: Vec<String> = ids
            .into_iter()
            .filter(|id| id != SELF_SERVICE_ID)
            .collect();
        ids.sort();
        ids.dedup();
        Self {
            version: MANIFEST_VERSION,
            ids,
        }
    }

    /// Reads a manifest from a reply object.
    ///
    /// A reply without `version` is read as version 1. Unknown later
    /// versions are accepted as long as `ids` is still a string list.
    #[must_use]
    pub fn from_content(content: &Map<String, Value>) -> Option<Self> {
        let version = match content.get("version") {
            None => MANIFEST_VERSION,
            Some(v) => u32::try_from(v.as_u64()?).ok()?,
        };
        let ids = content
            .get("ids")?
            .as_array()?
            .iter()
            .map(|v| v.as_str().map(str::to_string))
            .collect::<Option<Vec<_>>>()?;
        Some(Self { version, ids })
    }

    #[must_use]
    pub fn to_content(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("version".to_string(), Value::from(self.version));
        map.insert(
            "ids".to_string(),
            Value::Array(self.ids.iter().cloned().map(Value::String).collect()),
        );
        map
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn excludes_self_and_sorts() {
        let manifest = ServiceManifest::new(vec![
            "guess-counter".to_string(),
            SELF_SERVICE_ID.to_string(),
            "bible-reader".to_string(),
            "guess-counter".to_string(),
        ]);
        assert_eq!(manifest.ids, vec!["bible-reader", "guess-counter"]);
        assert_eq!(
            Value::Object(manifest.to_content()),
            json!({"version": 1, "ids": ["bible-reader", "guess-counter"]})
        );
    }

    #[test]
    fn reads_reply_content() {
        let Value::Object(content) = json!({"uuid": "x", "ids": ["a"]}) else {
            unreachable!()
        };
        let manifest = ServiceManifest::from_content(&content).unwrap();
        assert_eq!(manifest.version, 1);
        assert_eq!(manifest.ids, vec!["a"]);
    }

    #[test]
    fn rejects_malformed_ids() {
        let Value::Object(content) = json!({"version": 1, "ids": [1, 2]}) else {
            unreachable!()
        };
        assert!(ServiceManifest::from_content(&content).is_none());
        assert!(ServiceManifest::from_content(&Map::new()).is_none());
    }
}

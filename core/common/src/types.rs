//! Common types used throughout Larder.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Field map of a domain record (`ingredients`, `recipes`, ...).
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Name of a record collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Collection(String);

impl Collection {
    /// Create a new collection name.
    ///
    /// # Preconditions
    /// - `name` must be non-empty
    /// - `name` may only contain ASCII letters, digits, `_` and `-`
    ///
    /// # Errors
    /// - Returns error if the name is empty or contains other characters
    pub fn new(name: impl Into<String>) -> crate::Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(crate::Error::InvalidInput(
                "Collection name cannot be empty".to_string(),
            ));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(crate::Error::InvalidInput(format!(
                "Collection name contains invalid characters: {}",
                name
            )));
        }
        Ok(Self(name))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Collection {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::new(value)
    }
}

impl From<Collection> for String {
    fn from(value: Collection) -> Self {
        value.0
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a single record: `(collection, id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub collection: Collection,
    pub id: String,
}

impl RecordKey {
    /// Create a record key.
    pub fn new(collection: Collection, id: impl Into<String>) -> Self {
        Self {
            collection,
            id: id.into(),
        }
    }

    /// Same collection, different id.
    pub fn with_id(&self, id: impl Into<String>) -> Self {
        Self {
            collection: self.collection.clone(),
            id: id.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

/// Canonical record as returned by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    /// Server-assigned identifier.
    pub id: String,
    /// Monotonic per-record version used for optimistic concurrency.
    pub server_version: u64,
    /// Full field map.
    pub payload: Payload,
}

/// Fields of `incoming` whose value differs from (or is missing in) `current`.
pub fn diff_fields(current: &Payload, incoming: &Payload) -> Payload {
    incoming
        .iter()
        .filter(|(field, value)| current.get(*field) != Some(*value))
        .map(|(field, value)| (field.clone(), value.clone()))
        .collect()
}

/// Overwrite `target` with every field in `changes`.
pub fn merge_fields(target: &mut Payload, changes: &Payload) {
    for (field, value) in changes {
        target.insert(field.clone(), value.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn payload(value: serde_json::Value) -> Payload {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_collection_creation() {
        let collection = Collection::new("ingredients").unwrap();
        assert_eq!(collection.as_str(), "ingredients");
    }

    #[test]
    fn test_collection_rejects_bad_names() {
        assert!(Collection::new("").is_err());
        assert!(Collection::new("stock items").is_err());
        assert!(Collection::new("../etc").is_err());
    }

    #[test]
    fn test_collection_serde_validates() {
        let parsed: std::result::Result<Collection, _> = serde_json::from_str("\"recipes\"");
        assert!(parsed.is_ok());
        let rejected: std::result::Result<Collection, _> = serde_json::from_str("\"a/b\"");
        assert!(rejected.is_err());
    }

    #[test]
    fn test_record_key_display() {
        let key = RecordKey::new(Collection::new("ingredients").unwrap(), "42");
        assert_eq!(key.to_string(), "ingredients/42");
        assert_eq!(key.with_id("43").id, "43");
    }

    #[test]
    fn test_diff_skips_unchanged_fields() {
        let current = payload(json!({"name": "Flour", "price": 10, "unit": "kg"}));
        let incoming = payload(json!({"name": "Flour", "price": 12, "supplier": "Acme"}));

        let diff = diff_fields(&current, &incoming);
        assert_eq!(diff, payload(json!({"price": 12, "supplier": "Acme"})));
    }

    #[test]
    fn test_merge_overwrites_and_adds() {
        let mut target = payload(json!({"name": "Flour", "price": 10}));
        merge_fields(&mut target, &payload(json!({"price": 12, "stockQty": 5})));
        assert_eq!(target, payload(json!({"name": "Flour", "price": 12, "stockQty": 5})));
    }

    fn arb_payload() -> impl Strategy<Value = Payload> {
        proptest::collection::btree_map("[a-e]", 0i64..4, 0..5).prop_map(|fields| {
            fields
                .into_iter()
                .map(|(k, v)| (k, serde_json::Value::from(v)))
                .collect()
        })
    }

    proptest! {
        #[test]
        fn prop_merging_diff_matches_merging_everything(
            current in arb_payload(),
            incoming in arb_payload(),
        ) {
            let mut via_diff = current.clone();
            merge_fields(&mut via_diff, &diff_fields(&current, &incoming));

            let mut via_full = current.clone();
            merge_fields(&mut via_full, &incoming);

            prop_assert_eq!(via_diff, via_full);
        }

        #[test]
        fn prop_diff_against_self_is_empty(current in arb_payload()) {
            prop_assert!(diff_fields(&current, &current).is_empty());
        }
    }
}

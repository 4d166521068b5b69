//! Record change notifications and temp-id aliases.

use std::collections::HashMap;
use std::sync::RwLock;

use larder_common::{Collection, RecordKey};

/// Broadcast to read subscribers on every local write, independent of the
/// sync outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordEvent {
    /// Record written or updated.
    Changed(RecordKey),
    /// Record removed (tombstoned or purged).
    Removed(RecordKey),
    /// A locally created record received its server id.
    IdRemapped {
        collection: Collection,
        temp_id: String,
        server_id: String,
    },
}

/// Map from temp ids to the server ids that replaced them.
///
/// Lets callers that still hold a `tmp-` id keep using it after the create
/// is confirmed. Kept in memory only.
#[derive(Debug, Default)]
pub struct IdAliases {
    map: RwLock<HashMap<RecordKey, String>>,
}

impl IdAliases {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, temp: &RecordKey, server_id: &str) {
        if let Ok(mut map) = self.map.write() {
            map.insert(temp.clone(), server_id.to_string());
        }
    }

    /// The key a caller-supplied key currently refers to.
    pub fn resolve(&self, key: &RecordKey) -> RecordKey {
        self.map
            .read()
            .ok()
            .and_then(|map| map.get(key).map(|id| key.with_id(id.as_str())))
            .unwrap_or_else(|| key.clone())
    }

    pub fn clear(&self) {
        if let Ok(mut map) = self.map.write() {
            map.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alias_resolution() {
        let aliases = IdAliases::new();
        let temp = RecordKey::new(Collection::new("recipes").unwrap(), "tmp-1");
        let other = temp.with_id("5");

        assert_eq!(aliases.resolve(&temp), temp);

        aliases.insert(&temp, "99");
        assert_eq!(aliases.resolve(&temp).id, "99");
        assert_eq!(aliases.resolve(&other), other);

        aliases.clear();
        assert_eq!(aliases.resolve(&temp), temp);
    }
}

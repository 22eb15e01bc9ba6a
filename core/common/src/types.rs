//! Identifiers and keys used throughout Polyweave.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Generate a fresh random identifier.
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            /// Create an identifier from an existing string.
            ///
            /// # Errors
            /// - Returns error if id is empty
            pub fn new(id: impl Into<String>) -> crate::Result<Self> {
                let id = id.into();
                if id.is_empty() {
                    return Err(crate::Error::Validation(format!(
                        "{} cannot be empty",
                        stringify!($name)
                    )));
                }
                Ok(Self(id))
            }

            /// Get the inner string value.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

string_id!(
    /// Unique identifier of a submitted operation.
    OperationId
);
string_id!(
    /// Identifier of an optimistic update record.
    OptimisticId
);
string_id!(
    /// Identifier of a conflict record.
    ConflictId
);

/// Field used as the primary key of a record.
pub const PRIMARY_KEY_FIELD: &str = "id";

/// Identity of a single resource: collection plus primary filter.
///
/// Operations sharing a resource key are serialized for conflict resolution
/// and optimistic confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    collection: String,
    primary: String,
}

impl ResourceKey {
    /// Derive the resource key of an operation target.
    ///
    /// The primary part is the filter's `id` field when present, otherwise the
    /// canonical JSON of the whole filter (or of the payload's `id`).
    pub fn new(collection: &str, filter: Option<&Value>, data: Option<&Value>) -> Self {
        let primary = filter
            .and_then(|f| f.get(PRIMARY_KEY_FIELD))
            .or_else(|| data.and_then(|d| d.get(PRIMARY_KEY_FIELD)))
            .map(canonical_scalar)
            .or_else(|| filter.map(|f| f.to_string()))
            .unwrap_or_else(|| "*".to_string());

        Self {
            collection: collection.to_string(),
            primary,
        }
    }

    /// Collection part of the key.
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Primary filter part of the key.
    pub fn primary(&self) -> &str {
        &self.primary
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.primary)
    }
}

/// Top-level equality match of a document against a filter object.
///
/// A missing filter matches everything; a field absent from the document only
/// matches a `null` filter value. Numbers compare by value, so `1` matches `1.0`.
pub fn matches_filter(doc: &Value, filter: Option<&Value>) -> bool {
    let Some(Value::Object(filter)) = filter else {
        return true;
    };
    filter.iter().all(|(field, expected)| match doc.get(field) {
        Some(actual) => values_equal(actual, expected),
        None => expected.is_null(),
    })
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn canonical_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_operation_id_creation() {
        let id = OperationId::new("op-1").unwrap();
        assert_eq!(id.as_str(), "op-1");
        assert_ne!(OperationId::generate(), OperationId::generate());
    }

    #[test]
    fn test_operation_id_empty_fails() {
        assert!(OperationId::new("").is_err());
        assert!(ConflictId::new("").is_err());
    }

    #[test]
    fn test_resource_key_prefers_filter_id() {
        let key = ResourceKey::new("users", Some(&json!({"id": "u1", "age": 3})), None);
        assert_eq!(key.primary(), "u1");
        assert_eq!(key.to_string(), "users/u1");
    }

    #[test]
    fn test_resource_key_falls_back_to_payload_id() {
        let key = ResourceKey::new("users", None, Some(&json!({"id": 7})));
        assert_eq!(key.primary(), "7");
    }

    #[test]
    fn test_matches_filter() {
        let doc = json!({"id": "u1", "age": 3, "tags": ["a"]});
        assert!(matches_filter(&doc, None));
        assert!(matches_filter(&doc, Some(&json!({}))));
        assert!(matches_filter(&doc, Some(&json!({"age": 3.0}))));
        assert!(matches_filter(&doc, Some(&json!({"missing": null}))));
        assert!(!matches_filter(&doc, Some(&json!({"age": 4}))));
        assert!(!matches_filter(&doc, Some(&json!({"missing": 1}))));
    }

    #[test]
    fn test_resource_key_uses_canonical_filter() {
        let a = ResourceKey::new("users", Some(&json!({"b": 1, "a": 2})), None);
        let b = ResourceKey::new("users", Some(&json!({"a": 2, "b": 1})), None);
        assert_eq!(a, b);
    }
}

//! Row keys.
//!
//! Every row in a collection is addressed by a [`Key`]. Base collections derive
//! keys from their rows with a [`KeyFn`]; live queries over joins produce
//! [`Key::Composite`] keys with one component per joined source.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::rc::Rc;

/// A comparable row key.
///
/// Variants are totally ordered (`Null < Int < Str < Composite`) so keys can
/// serve as the deterministic tie-break for ordered live queries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Key {
    /// Placeholder for the missing side of an outer join
    Null,
    Int(i64),
    Str(String),
    Composite(Vec<Key>),
}

impl Key {
    /// Derive a key from a JSON value.
    ///
    /// Strings and integers map directly, arrays become composite keys.
    /// Anything else has no key.
    pub fn from_value(value: &serde_json::Value) -> Option<Key> {
        match value {
            serde_json::Value::String(s) => Some(Key::Str(s.clone())),
            serde_json::Value::Number(n) => n.as_i64().map(Key::Int),
            serde_json::Value::Array(items) => items
                .iter()
                .map(Key::from_value)
                .collect::<Option<Vec<_>>>()
                .map(Key::Composite),
            _ => None,
        }
    }

    /// Convert the key back into a JSON value.
    pub fn to_value(&self) -> serde_json::Value {
        match self {
            Key::Null => serde_json::Value::Null,
            Key::Int(i) => serde_json::Value::from(*i),
            Key::Str(s) => serde_json::Value::String(s.clone()),
            Key::Composite(parts) => {
                serde_json::Value::Array(parts.iter().map(Key::to_value).collect())
            }
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Key::Null)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Null => write!(f, "null"),
            Key::Int(i) => write!(f, "{}", i),
            Key::Str(s) => write!(f, "{}", s),
            Key::Composite(parts) => {
                write!(f, "[")?;
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", part)?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::Str(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::Str(s)
    }
}

impl From<i64> for Key {
    fn from(i: i64) -> Self {
        Key::Int(i)
    }
}

impl From<i32> for Key {
    fn from(i: i32) -> Self {
        Key::Int(i64::from(i))
    }
}

impl From<u32> for Key {
    fn from(i: u32) -> Self {
        Key::Int(i64::from(i))
    }
}

/// Function deriving a row's key from its value.
pub type KeyFn = Rc<dyn Fn(&serde_json::Value) -> Option<Key>>;

/// Key rows by a top-level field, e.g. `"id"`.
pub fn field_key(field: impl Into<String>) -> KeyFn {
    let field = field.into();
    Rc::new(move |row| row.get(&field).and_then(Key::from_value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_from_value() {
        assert_eq!(Key::from_value(&json!("a")), Some(Key::from("a")));
        assert_eq!(Key::from_value(&json!(7)), Some(Key::Int(7)));
        assert_eq!(
            Key::from_value(&json!(["a", 1])),
            Some(Key::Composite(vec![Key::from("a"), Key::Int(1)]))
        );
        assert_eq!(Key::from_value(&json!(1.5)), None);
        assert_eq!(Key::from_value(&json!({"id": 1})), None);
        assert_eq!(Key::from_value(&json!(null)), None);
    }

    #[test]
    fn key_ordering_is_total() {
        assert!(Key::Null < Key::Int(0));
        assert!(Key::Int(100) < Key::from("0"));
        assert!(Key::from("a") < Key::from("b"));
        assert!(Key::from("z") < Key::Composite(vec![]));
    }

    #[test]
    fn field_key_extracts() {
        let key_fn = field_key("id");
        assert_eq!(key_fn(&json!({"id": "1", "text": "a"})), Some(Key::from("1")));
        assert_eq!(key_fn(&json!({"text": "a"})), None);
    }

    #[test]
    fn display_composite() {
        let key = Key::Composite(vec![Key::from("m1"), Key::Null]);
        assert_eq!(key.to_string(), "[m1,null]");
    }

    #[test]
    fn serialization_untagged() {
        let key = Key::Composite(vec![Key::from("a"), Key::Int(2)]);
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, r#"["a",2]"#);
        let parsed: Key = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, key);
    }
}

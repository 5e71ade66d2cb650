//! Row schemas and validation.
//!
//! A collection may carry a [`CollectionSchema`]; optimistic inserts and
//! updates are validated against it before they touch the visible state.

use crate::{error::Result, Error, Mutation, MutationType};
use serde::{Deserialize, Serialize};

/// Field types supported in schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    Timestamp,
    /// Arbitrary nested JSON
    Json,
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldType::String => write!(f, "String"),
            FieldType::Int => write!(f, "Int"),
            FieldType::Float => write!(f, "Float"),
            FieldType::Bool => write!(f, "Bool"),
            FieldType::Timestamp => write!(f, "Timestamp"),
            FieldType::Json => write!(f, "Json"),
        }
    }
}

/// Definition of a field in a row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
    pub required: bool,
}

impl FieldDef {
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
        }
    }

    /// Validate a JSON value against this field definition.
    pub fn validate(&self, value: Option<&serde_json::Value>) -> Result<()> {
        match value {
            None | Some(serde_json::Value::Null) if self.required => {
                Err(Error::MissingRequiredField(self.name.clone()))
            }
            None | Some(serde_json::Value::Null) => Ok(()),
            Some(v) => self.validate_type(v),
        }
    }

    fn validate_type(&self, value: &serde_json::Value) -> Result<()> {
        let valid = match self.field_type {
            FieldType::String => value.is_string(),
            FieldType::Int => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_number(),
            FieldType::Bool => value.is_boolean(),
            // Epoch milliseconds or an RFC 3339 string
            FieldType::Timestamp => {
                value.is_u64()
                    || value.is_i64()
                    || value
                        .as_str()
                        .is_some_and(|s| chrono::DateTime::parse_from_rfc3339(s).is_ok())
            }
            FieldType::Json => true,
        };

        if valid {
            Ok(())
        } else {
            Err(Error::TypeMismatch {
                field: self.name.clone(),
                expected: self.field_type.to_string(),
                got: json_type_name(value).to_string(),
            })
        }
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "Null",
        serde_json::Value::Bool(_) => "Bool",
        serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => "Int",
        serde_json::Value::Number(_) => "Float",
        serde_json::Value::String(_) => "String",
        serde_json::Value::Array(_) => "Array",
        serde_json::Value::Object(_) => "Object",
    }
}

/// Schema for the rows of one collection.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSchema {
    pub fields: Vec<FieldDef>,
}

impl CollectionSchema {
    pub fn new(fields: Vec<FieldDef>) -> Self {
        Self { fields }
    }

    /// Builder-style method to add a field.
    pub fn with_field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    /// Validate a full row against this schema.
    pub fn validate_row(&self, row: &serde_json::Value) -> Result<()> {
        let obj = row
            .as_object()
            .ok_or_else(|| Error::InvalidRow("row must be an object".into()))?;

        for field in &self.fields {
            field.validate(obj.get(&field.name))?;
        }

        Ok(())
    }

    /// Validate the row a mutation produces. Deletes are always valid.
    pub fn validate_mutation(&self, mutation: &Mutation) -> Result<()> {
        match (mutation.mutation_type, &mutation.modified) {
            (MutationType::Delete, _) | (_, None) => Ok(()),
            (_, Some(row)) => self.validate_row(row),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CollectionId, Key};
    use serde_json::json;

    fn todo_schema() -> CollectionSchema {
        CollectionSchema::new(vec![
            FieldDef::required("id", FieldType::String),
            FieldDef::required("text", FieldType::String),
            FieldDef::optional("done", FieldType::Bool),
            FieldDef::optional("createdAt", FieldType::Timestamp),
        ])
    }

    #[test]
    fn validate_valid_row() {
        let schema = todo_schema();
        assert!(schema.validate_row(&json!({"id": "1", "text": "a"})).is_ok());
        assert!(schema
            .validate_row(&json!({"id": "1", "text": "a", "done": true, "createdAt": 1000}))
            .is_ok());
        assert!(schema
            .validate_row(&json!({"id": "1", "text": "a", "createdAt": "2024-02-01T10:00:00Z"}))
            .is_ok());
    }

    #[test]
    fn validate_missing_required_field() {
        let result = todo_schema().validate_row(&json!({"id": "1"}));
        assert!(matches!(result, Err(Error::MissingRequiredField(f)) if f == "text"));
    }

    #[test]
    fn validate_null_required_field() {
        let result = todo_schema().validate_row(&json!({"id": "1", "text": null}));
        assert!(matches!(result, Err(Error::MissingRequiredField(f)) if f == "text"));
    }

    #[test]
    fn validate_wrong_type() {
        let result = todo_schema().validate_row(&json!({"id": "1", "text": "a", "done": "yes"}));
        assert!(matches!(result, Err(Error::TypeMismatch { field, .. }) if field == "done"));

        let result = todo_schema()
            .validate_row(&json!({"id": "1", "text": "a", "createdAt": "yesterday"}));
        assert!(matches!(result, Err(Error::TypeMismatch { field, .. }) if field == "createdAt"));
    }

    #[test]
    fn validate_non_object_row() {
        let result = todo_schema().validate_row(&json!([1, 2]));
        assert!(matches!(result, Err(Error::InvalidRow(_))));
    }

    #[test]
    fn delete_mutation_skips_validation() {
        let schema = todo_schema();
        let delete = Mutation::delete(CollectionId(1), Key::from("1"), json!({"id": "1"}));
        assert!(schema.validate_mutation(&delete).is_ok());

        let insert = Mutation::insert(CollectionId(1), Key::from("1"), json!({"id": "1"}));
        assert!(schema.validate_mutation(&insert).is_err());
    }

    #[test]
    fn json_field_accepts_any() {
        let schema =
            CollectionSchema::default().with_field(FieldDef::required("data", FieldType::Json));

        assert!(schema.validate_row(&json!({"data": "string"})).is_ok());
        assert!(schema.validate_row(&json!({"data": [1, 2, 3]})).is_ok());
        assert!(schema.validate_row(&json!({"data": {"nested": "object"}})).is_ok());
    }

    #[test]
    fn field_type_display() {
        assert_eq!(FieldType::String.to_string(), "String");
        assert_eq!(FieldType::Timestamp.to_string(), "Timestamp");
    }
}

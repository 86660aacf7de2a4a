//! JSON Schema Synthesis
//!
//! Derives JSON-Schema documents from [`Describe`] type descriptions. Used
//! for tool parameter declarations and for structured-output enforcement.
//!
//! Recursive structures are emitted once under `$defs` and referenced with
//! `$ref`; the root type is always inlined. Results are cached per type for
//! the lifetime of the process.

mod shape;
mod synth;

use std::any::TypeId;
use std::sync::{Arc, LazyLock};

use dashmap::DashMap;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use shape::{Describe, FieldShape, ShapeFn, StructShape, TypeRef, TypeShape};
pub use synth::synthesize;

/// Schema generation failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    /// Enum directive value does not parse as the field's type
    #[error("enum value '{value}' on field '{field}' is not a valid {expected}")]
    InvalidEnumValue {
        field: String,
        value: String,
        expected: &'static str,
    },

    /// Enum directive on a field that is not a primitive
    #[error("field '{field}' of type {type_name} cannot carry enum values")]
    UnsupportedEnumType { field: String, type_name: String },

    /// Two fields with the same name in one structure
    #[error("structure '{structure}' declares field '{field}' twice")]
    DuplicateField { structure: String, field: String },
}

/// A JSON-Schema-like document
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub schema_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,

    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub properties: IndexMap<String, Schema>,

    /// Element schema of arrays
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<Schema>>,

    /// Value schema of maps
    #[serde(rename = "additionalProperties", default, skip_serializing_if = "Option::is_none")]
    pub additional_properties: Option<Box<Schema>>,

    #[serde(rename = "enum", default, skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,

    #[serde(rename = "$ref", default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,

    #[serde(rename = "$defs", default, skip_serializing_if = "IndexMap::is_empty")]
    pub defs: IndexMap<String, Schema>,
}

impl Schema {
    fn typed(name: &str) -> Self {
        Self {
            schema_type: Some(name.to_owned()),
            ..Default::default()
        }
    }

    pub fn string() -> Self {
        Self::typed("string")
    }

    pub fn integer() -> Self {
        Self::typed("integer")
    }

    pub fn number() -> Self {
        Self::typed("number")
    }

    pub fn boolean() -> Self {
        Self::typed("boolean")
    }

    pub fn object() -> Self {
        Self::typed("object")
    }

    pub fn array(items: Self) -> Self {
        Self {
            items: Some(Box::new(items)),
            ..Self::typed("array")
        }
    }

    pub fn map(values: Self) -> Self {
        Self {
            additional_properties: Some(Box::new(values)),
            ..Self::typed("object")
        }
    }

    pub fn reference(pointer: impl Into<String>) -> Self {
        Self {
            reference: Some(pointer.into()),
            ..Default::default()
        }
    }

    /// Add a property to an object schema
    #[must_use]
    pub fn property(mut self, name: impl Into<String>, schema: Self, required: bool) -> Self {
        let name = name.into();
        if required {
            self.required.push(name.clone());
        }
        self.properties.insert(name, schema);
        self
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Schema as a JSON value
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

static SCHEMA_CACHE: LazyLock<DashMap<TypeId, Arc<Schema>>> = LazyLock::new(DashMap::new);

/// Cached schema of `T`
///
/// The first call for a type synthesizes while holding that type's cache
/// entry, so concurrent first use generates exactly once.
pub fn schema_for<T: Describe>() -> Result<Arc<Schema>, SchemaError> {
    let root = T::type_ref();
    if let Some(cached) = SCHEMA_CACHE.get(&root.id()) {
        return Ok(Arc::clone(cached.value()));
    }

    let entry = SCHEMA_CACHE
        .entry(root.id())
        .or_try_insert_with(|| synthesize(root).map(Arc::new))?;
    Ok(Arc::clone(entry.value()))
}

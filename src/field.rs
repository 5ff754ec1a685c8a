//! Field schema types
//!
//! Includes FieldType, FieldDefinition (what schema authors write), and
//! FieldSchema (the normalized form a model holds for each field).

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{OrmError, Result, ValidationError};
use crate::instance::Instance;

/// Canonical field type for a model field.
///
/// Declarations are normalized to lowercase from any casing, so `"String"`,
/// `"string"`, and `"STRING"` all resolve to [`FieldType::String`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    /// Text value
    String,
    /// Integer or floating point value
    Number,
    /// True/false value
    Boolean,
    /// Timestamp, stored as an RFC 3339 string
    Date,
    /// Nested JSON object
    Object,
    /// JSON array
    Array,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::Date => "date",
            FieldType::Object => "object",
            FieldType::Array => "array",
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FieldType {
    type Err = OrmError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "string" => Ok(FieldType::String),
            "number" => Ok(FieldType::Number),
            "boolean" => Ok(FieldType::Boolean),
            "date" => Ok(FieldType::Date),
            "object" => Ok(FieldType::Object),
            "array" => Ok(FieldType::Array),
            other => Err(OrmError::invalid_argument(format!(
                "unknown field type: {}",
                other
            ))),
        }
    }
}

/// Custom validator function: returns an error message to reject the value.
pub type ValidatorFn = Arc<dyn Fn(&Value) -> Option<String> + Send + Sync>;

/// Value transform applied on field read (`get`) or write (`set`).
///
/// Receives the raw value, the logical field name, and the owning instance.
pub type FieldTransform = Arc<dyn Fn(Value, &str, &Instance) -> Value + Send + Sync>;

/// Field validator: a pattern tested against the string form of the value,
/// or a function returning an error message to reject it.
#[derive(Clone)]
pub enum Validator {
    Pattern(Regex),
    Function(ValidatorFn),
}

impl Validator {
    /// Build a pattern validator from a regex string.
    pub fn pattern(pattern: &str) -> Result<Self> {
        let re = Regex::new(pattern)
            .map_err(|e| OrmError::invalid_argument(format!("invalid validator pattern: {}", e)))?;
        Ok(Validator::Pattern(re))
    }

    /// Build a function validator.
    pub fn function<F>(f: F) -> Self
    where
        F: Fn(&Value) -> Option<String> + Send + Sync + 'static,
    {
        Validator::Function(Arc::new(f))
    }
}

impl fmt::Debug for Validator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Validator::Pattern(re) => f.debug_tuple("Pattern").field(&re.as_str()).finish(),
            Validator::Function(_) => f.debug_tuple("Function").field(&"<fn>").finish(),
        }
    }
}

/// Get/set transform pair, usable both per-field and in model-level mappings.
#[derive(Clone, Default)]
pub struct FieldMapping {
    pub get: Option<FieldTransform>,
    pub set: Option<FieldTransform>,
}

impl FieldMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get<F>(mut self, f: F) -> Self
    where
        F: Fn(Value, &str, &Instance) -> Value + Send + Sync + 'static,
    {
        self.get = Some(Arc::new(f));
        self
    }

    pub fn set<F>(mut self, f: F) -> Self
    where
        F: Fn(Value, &str, &Instance) -> Value + Send + Sync + 'static,
    {
        self.set = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for FieldMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldMapping")
            .field("get", &self.get.as_ref().map(|_| "<fn>"))
            .field("set", &self.set.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

/// Field declaration as written by a schema author.
///
/// Every member is optional; unset members inherit from a parent field on
/// extend/reduce or fall back to defaults on normalization. An omitted type
/// defaults to string.
#[derive(Clone, Default)]
pub struct FieldDefinition {
    pub field_type: Option<FieldType>,
    pub required: Option<bool>,
    pub optional: Option<bool>,
    pub default: Option<Value>,
    pub validator: Option<Validator>,
    pub minlength: Option<usize>,
    pub maxlength: Option<usize>,
    pub length: Option<usize>,
    pub readonly: Option<bool>,
    pub custom: Option<bool>,
    pub name: Option<String>,
    pub get: Option<FieldTransform>,
    pub set: Option<FieldTransform>,
    pub model: Option<String>,
    pub description: Option<String>,
}

impl FieldDefinition {
    /// Create a field declaration with an explicit type.
    pub fn new(field_type: FieldType) -> Self {
        Self {
            field_type: Some(field_type),
            ..Self::default()
        }
    }

    /// Create a field declaration from a type name in any casing.
    pub fn typed(type_name: &str) -> Result<Self> {
        Ok(Self::new(type_name.parse()?))
    }

    /// Mark the field required.
    pub fn required(mut self) -> Self {
        self.required = Some(true);
        self
    }

    /// Mark the field optional.
    pub fn optional(mut self) -> Self {
        self.optional = Some(true);
        self
    }

    /// Set the default value substituted when the field is absent.
    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Attach a validator.
    pub fn validator(mut self, validator: Validator) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Minimum string/array length.
    pub fn minlength(mut self, n: usize) -> Self {
        self.minlength = Some(n);
        self
    }

    /// Maximum string/array length.
    pub fn maxlength(mut self, n: usize) -> Self {
        self.maxlength = Some(n);
        self
    }

    /// Exact string/array length.
    pub fn length(mut self, n: usize) -> Self {
        self.length = Some(n);
        self
    }

    /// Reject external writes to this field.
    pub fn readonly(mut self) -> Self {
        self.readonly = Some(true);
        self
    }

    /// Mark as a computed field, excluded from the storage payload.
    pub fn custom(mut self) -> Self {
        self.custom = Some(true);
        self
    }

    /// Alternate wire/storage key the field serializes under.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Transform applied when the field is read.
    pub fn get<F>(mut self, f: F) -> Self
    where
        F: Fn(Value, &str, &Instance) -> Value + Send + Sync + 'static,
    {
        self.get = Some(Arc::new(f));
        self
    }

    /// Transform applied when the field is written.
    pub fn set<F>(mut self, f: F) -> Self
    where
        F: Fn(Value, &str, &Instance) -> Value + Send + Sync + 'static,
    {
        self.set = Some(Arc::new(f));
        self
    }

    /// Link the field to another model by name.
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Human-readable field description.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

impl fmt::Debug for FieldDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldDefinition")
            .field("field_type", &self.field_type)
            .field("required", &self.required)
            .field("optional", &self.optional)
            .field("default", &self.default)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Normalized description of one model field.
///
/// Invariant: exactly one canonical type; `required` and `optional` are
/// always mutually consistent.
#[derive(Clone)]
pub struct FieldSchema {
    pub field_type: FieldType,
    pub required: bool,
    pub optional: bool,
    pub default: Option<Value>,
    pub validator: Option<Validator>,
    pub minlength: Option<usize>,
    pub maxlength: Option<usize>,
    pub length: Option<usize>,
    pub readonly: bool,
    pub custom: bool,
    pub name: Option<String>,
    pub get: Option<FieldTransform>,
    pub set: Option<FieldTransform>,
    pub model: Option<String>,
    pub description: Option<String>,
}

impl FieldSchema {
    /// Normalize a declaration into a schema.
    pub fn from_definition(key: &str, def: &FieldDefinition) -> Result<Self> {
        if key.is_empty() {
            return Err(ValidationError::new(key, "field name must not be empty").into());
        }
        let (required, optional) = resolve_optionality(def.required, def.optional);
        Ok(Self {
            field_type: def.field_type.unwrap_or(FieldType::String),
            required,
            optional,
            default: def.default.clone(),
            validator: def.validator.clone(),
            minlength: def.minlength,
            maxlength: def.maxlength,
            length: def.length,
            readonly: def.readonly.unwrap_or(false),
            custom: def.custom.unwrap_or(false),
            name: def.name.clone(),
            get: def.get.clone(),
            set: def.set.clone(),
            model: def.model.clone(),
            description: def.description.clone(),
        })
    }

    /// Merge a child declaration onto this schema: every member the child
    /// sets explicitly overrides the inherited member.
    pub fn apply(&self, def: &FieldDefinition) -> Self {
        let mut out = self.clone();
        if let Some(t) = def.field_type {
            out.field_type = t;
        }
        if def.required.is_some() || def.optional.is_some() {
            let (required, optional) = resolve_optionality(def.required, def.optional);
            out.required = required;
            out.optional = optional;
        }
        if let Some(v) = &def.default {
            out.default = Some(v.clone());
        }
        if let Some(v) = &def.validator {
            out.validator = Some(v.clone());
        }
        if let Some(n) = def.minlength {
            out.minlength = Some(n);
        }
        if let Some(n) = def.maxlength {
            out.maxlength = Some(n);
        }
        if let Some(n) = def.length {
            out.length = Some(n);
        }
        if let Some(b) = def.readonly {
            out.readonly = b;
        }
        if let Some(b) = def.custom {
            out.custom = b;
        }
        if let Some(n) = &def.name {
            out.name = Some(n.clone());
        }
        if let Some(f) = &def.get {
            out.get = Some(f.clone());
        }
        if let Some(f) = &def.set {
            out.set = Some(f.clone());
        }
        if let Some(m) = &def.model {
            out.model = Some(m.clone());
        }
        if let Some(d) = &def.description {
            out.description = Some(d.clone());
        }
        out
    }

    /// The key this field serializes under in storage payloads.
    pub fn wire_name<'a>(&'a self, key: &'a str) -> &'a str {
        self.name.as_deref().unwrap_or(key)
    }
}

impl fmt::Debug for FieldSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldSchema")
            .field("field_type", &self.field_type)
            .field("required", &self.required)
            .field("optional", &self.optional)
            .field("default", &self.default)
            .field("readonly", &self.readonly)
            .field("custom", &self.custom)
            .field("name", &self.name)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

// Required wins when a declaration sets both flags.
fn resolve_optionality(required: Option<bool>, optional: Option<bool>) -> (bool, bool) {
    match (required, optional) {
        (Some(req), _) => (req, !req),
        (None, Some(opt)) => (!opt, opt),
        (None, None) => (false, true),
    }
}

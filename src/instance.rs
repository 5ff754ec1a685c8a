//! Model instances
//!
//! An [`Instance`] is a live, validated, change-tracked record bound to a
//! model's field schemas. Values are coerced to their declared types on
//! write, reads go through optional get-transforms, and every accepted
//! change is recorded for dirty tracking and observer notification.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::{Map, Value};

use crate::error::{OrmError, Result};
use crate::field::{FieldSchema, FieldType, Validator};
use crate::model::Model;
use crate::query::value_string;

/// Metadata key the primary key is stored under.
pub const PRIMARY_KEY: &str = "primarykey";

// Bookkeeping keys a hydration payload may carry; silently ignored by set.
const INTERNAL_KEYS: [&str; 9] = [
    "_values",
    "_model",
    "_dirty",
    "_deleted",
    "_metadata",
    "_dirtyfields",
    "_fieldmap",
    "_selected",
    "_events",
];

/// Typed observer for instance lifecycle notifications.
pub trait InstanceObserver: Send + Sync {
    /// A field changed to a new value.
    fn on_change(&self, _field: &str, _new_value: &Value, _old_value: &Value) {}
    /// The instance was persisted.
    fn on_save(&self, _instance: &Instance) {}
    /// The instance was deleted.
    fn on_delete(&self, _instance: &Instance) {}
}

/// A live record bound to exactly one model.
pub struct Instance {
    model: Arc<Model>,
    values: BTreeMap<String, Value>,
    dirty: bool,
    deleted: bool,
    dirty_fields: BTreeMap<String, Value>,
    metadata: BTreeMap<String, Value>,
    selected: Option<BTreeSet<String>>,
    observers: Vec<Arc<dyn InstanceObserver>>,
}

impl Instance {
    /// Construct an instance, seeding defaults, applying `values`, and
    /// validating all fields unless `skip_unknown` marks the values as
    /// trusted connector data.
    pub(crate) fn new(model: Arc<Model>, values: Value, skip_unknown: bool) -> Result<Self> {
        let mut instance = Self {
            model: model.clone(),
            values: BTreeMap::new(),
            dirty: false,
            deleted: false,
            dirty_fields: BTreeMap::new(),
            metadata: BTreeMap::new(),
            selected: None,
            observers: Vec::new(),
        };

        for (key, field) in model.fields() {
            instance
                .values
                .insert(key.clone(), field.default.clone().unwrap_or(Value::Null));
        }

        match values {
            Value::Null => {}
            values @ Value::Object(_) => {
                instance.set_values(values, skip_unknown)?;
            }
            other => {
                return Err(OrmError::invalid_argument(format!(
                    "instance values must be an object, got: {}",
                    other
                )));
            }
        }

        // Construction-time assignment is not a change.
        instance.dirty = false;
        instance.dirty_fields.clear();

        if !skip_unknown {
            instance.validate_all()?;
        }
        Ok(instance)
    }

    /// The model this instance is bound to.
    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    /// True when there are changes not yet persisted.
    pub fn is_unsaved(&self) -> bool {
        self.dirty
    }

    /// True once the instance has been removed.
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Register an observer for change/save/delete notifications.
    pub fn subscribe(&mut self, observer: Arc<dyn InstanceObserver>) {
        self.observers.push(observer);
    }

    // =========================================================================
    // Field Access
    // =========================================================================

    /// Read a field, applying its get-transform. The returned value is an
    /// owned copy: mutating it never touches internal state.
    pub fn get(&self, name: &str) -> Result<Value> {
        match self.values.get(name) {
            Some(raw) => Ok(self.model.apply_get(name, raw.clone(), self)),
            None => Err(OrmError::FieldNotFound(name.to_string())),
        }
    }

    /// Write a field with full validation.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> Result<()> {
        self.set_with(name, value.into(), false)
    }

    /// Write a field. `skip_unknown` marks the write as trusted hydration:
    /// unknown fields are dropped instead of rejected, read-only fields may
    /// be written, and transforms/validation are bypassed.
    pub fn set_with(&mut self, name: &str, value: Value, skip_unknown: bool) -> Result<()> {
        if name.starts_with('_') && INTERNAL_KEYS.contains(&name) {
            return Ok(());
        }

        let model = self.model.clone();
        let name = model
            .field_remap()
            .get(name)
            .map(String::as_str)
            .unwrap_or(name);

        // The primary key lives out-of-band, never in values.
        if name == "id" {
            return Ok(());
        }

        let Some(field) = model.fields().get(name) else {
            if skip_unknown {
                return Ok(());
            }
            return Err(OrmError::validation(name, format!("invalid field: {}", name)));
        };

        if field.readonly && !skip_unknown {
            return Err(OrmError::validation(
                name,
                format!("cannot set read-only field: {}", name),
            ));
        }

        let mut value = if value.is_null() {
            field.default.clone().unwrap_or(Value::Null)
        } else {
            value
        };

        if !skip_unknown {
            value = model.apply_set(name, value, self);
        }

        if field.field_type == FieldType::Date {
            if let Value::String(s) = &value {
                value = match parse_date(s) {
                    Some(dt) => Value::String(dt.to_rfc3339()),
                    None => Value::Null,
                };
            }
        }

        if !skip_unknown {
            validate_field_value(field, name, &mut value)?;
        }

        let current = self.values.get(name).cloned().unwrap_or(Value::Null);
        if current != value {
            self.values.insert(name.to_string(), value.clone());
            self.dirty = true;
            self.dirty_fields.insert(name.to_string(), value.clone());
            for observer in &self.observers {
                observer.on_change(name, &value, &current);
            }
        }
        Ok(())
    }

    /// Apply a map of field/value pairs, each through [`Instance::set_with`].
    ///
    /// When `skip_unknown` is set the incoming key set is recorded as the
    /// partial selection this instance was hydrated from; `to_json` then
    /// omits fields outside that selection.
    pub fn set_values(&mut self, values: Value, skip_unknown: bool) -> Result<()> {
        let Value::Object(map) = values else {
            return Err(OrmError::invalid_argument("values must be an object"));
        };

        if skip_unknown {
            let mut selection = BTreeSet::new();
            for key in map.keys() {
                let logical = self
                    .model
                    .field_remap()
                    .get(key)
                    .cloned()
                    .unwrap_or_else(|| key.clone());
                if self.model.fields().contains_key(&logical) {
                    selection.insert(logical);
                }
            }
            self.selected = Some(selection);
        }

        for (key, value) in map {
            self.set_with(&key, value, skip_unknown)?;
        }
        Ok(())
    }

    /// Force-mark a field dirty with a new value, even when the value is
    /// unchanged.
    pub fn change(&mut self, name: &str, value: impl Into<Value>) -> Result<()> {
        if !self.values.contains_key(name) {
            return Err(OrmError::FieldNotFound(name.to_string()));
        }
        let value = value.into();
        self.values.insert(name.to_string(), value.clone());
        self.dirty = true;
        self.dirty_fields.insert(name.to_string(), value);
        Ok(())
    }

    /// Fields changed since the last save.
    pub fn changed_fields(&self) -> &BTreeMap<String, Value> {
        &self.dirty_fields
    }

    /// Current values, excluding read-only fields unless they appear in the
    /// dirty set (a connector-initiated read-only update is still reported).
    pub fn values(&self, dirty_only: bool) -> BTreeMap<String, Value> {
        self.values
            .iter()
            .filter(|(key, _)| {
                let readonly = self
                    .model
                    .fields()
                    .get(*key)
                    .map(|f| f.readonly)
                    .unwrap_or(false);
                let is_dirty = self.dirty_fields.contains_key(*key);
                if readonly {
                    dirty_only && is_dirty
                } else {
                    !dirty_only || is_dirty
                }
            })
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    /// Every stored value, including read-only fields. Connector use.
    pub(crate) fn raw_values(&self) -> BTreeMap<String, Value> {
        self.values.clone()
    }

    /// The model's logical field names.
    pub fn keys(&self) -> Vec<String> {
        self.model.keys()
    }

    // =========================================================================
    // Primary Key & Metadata
    // =========================================================================

    /// The out-of-band primary key, if assigned.
    pub fn primary_key(&self) -> Option<Value> {
        self.metadata.get(PRIMARY_KEY).cloned()
    }

    /// Alias of [`Instance::primary_key`].
    pub fn id(&self) -> Option<Value> {
        self.primary_key()
    }

    /// Assign the out-of-band primary key.
    pub fn set_primary_key(&mut self, value: impl Into<Value>) {
        self.metadata.insert(PRIMARY_KEY.to_string(), value.into());
    }

    /// Set a metadata entry.
    pub fn set_meta(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Read a metadata entry.
    pub fn meta(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    // =========================================================================
    // Validation
    // =========================================================================

    /// Validate one field against its schema, coercing in place.
    pub fn validate_field(&mut self, name: &str) -> Result<()> {
        let model = self.model.clone();
        let field = model
            .fields()
            .get(name)
            .ok_or_else(|| OrmError::FieldNotFound(name.to_string()))?;
        let mut value = self.values.get(name).cloned().unwrap_or(Value::Null);
        validate_field_value(field, name, &mut value)?;
        self.values.insert(name.to_string(), value);
        Ok(())
    }

    /// Validate every field against its schema.
    pub fn validate_all(&mut self) -> Result<()> {
        let model = self.model.clone();
        for (key, field) in model.fields() {
            let mut value = self.values.get(key).cloned().unwrap_or(Value::Null);
            validate_field_value(field, key, &mut value)?;
            self.values.insert(key.clone(), value);
        }
        Ok(())
    }

    // =========================================================================
    // Projections
    // =========================================================================

    /// The externally-visible projection: primary key injected as `id`,
    /// get-transforms applied, renamed fields serialized under their wire
    /// name, and fields outside a partial selection omitted unless
    /// computed.
    pub fn to_json(&self) -> Value {
        let mut obj = Map::new();
        if let Some(pk) = self.primary_key() {
            obj.insert("id".to_string(), pk);
        }
        for (key, raw) in &self.values {
            let field = self.model.fields().get(key);
            if let Some(selection) = &self.selected {
                let custom = field.map(|f| f.custom).unwrap_or(false);
                if !selection.contains(key) && !custom {
                    continue;
                }
            }
            let out_key = field.map(|f| f.wire_name(key)).unwrap_or(key.as_str());
            obj.insert(
                out_key.to_string(),
                self.model.apply_get(key, raw.clone(), self),
            );
        }
        let mut out = Value::Object(obj);
        if let Some(hook) = self.model.serialize_hook() {
            out = hook(out, self);
        }
        out
    }

    /// The storage-facing projection: set-transforms applied, wire names
    /// used as keys, computed fields excluded, and read-only fields
    /// excluded unless dirty.
    pub fn to_payload(&self) -> Value {
        let mut obj = Map::new();
        for (key, field) in self.model.fields() {
            if field.custom {
                continue;
            }
            if field.readonly && !self.dirty_fields.contains_key(key) {
                continue;
            }
            let raw = self.values.get(key).cloned().unwrap_or(Value::Null);
            obj.insert(
                field.wire_name(key).to_string(),
                self.model.apply_set(key, raw, self),
            );
        }
        let mut out = Value::Object(obj);
        if let Some(hook) = self.model.deserialize_hook() {
            out = hook(out, self);
        }
        out
    }

    // =========================================================================
    // Lifecycle (model/connector use)
    // =========================================================================

    pub(crate) fn clear_dirty(&mut self) {
        self.dirty = false;
        self.dirty_fields.clear();
    }

    pub(crate) fn mark_deleted(&mut self) {
        self.deleted = true;
    }

    pub(crate) fn notify_save(&self) {
        for observer in &self.observers {
            observer.on_save(self);
        }
    }

    pub(crate) fn notify_delete(&self) {
        for observer in &self.observers {
            observer.on_delete(self);
        }
    }

    /// Invoke a custom model method bound to this instance.
    pub fn call_method(&self, name: &str, args: Value) -> Result<Value> {
        self.model.invoke_method(name, Some(self), args)
    }

    /// Persist pending changes through the bound connector.
    pub async fn save(&mut self) -> Result<()> {
        let model = self.model.clone();
        model.save(self).await
    }

    /// Delete this record through the bound connector.
    pub async fn remove(&mut self) -> Result<()> {
        let model = self.model.clone();
        model.remove(self).await
    }
}

impl Clone for Instance {
    // Observers are intentionally not carried over to the copy.
    fn clone(&self) -> Self {
        Self {
            model: self.model.clone(),
            values: self.values.clone(),
            dirty: self.dirty,
            deleted: self.deleted,
            dirty_fields: self.dirty_fields.clone(),
            metadata: self.metadata.clone(),
            selected: self.selected.clone(),
            observers: Vec::new(),
        }
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("model", &self.model.name())
            .field("primary_key", &self.primary_key())
            .field("values", &self.values)
            .field("dirty", &self.dirty)
            .field("deleted", &self.deleted)
            .finish()
    }
}

// Accept RFC 3339 first, then common date-only forms.
pub(crate) fn parse_date(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return d.and_hms_opt(0, 0, 0).map(|ndt| ndt.and_utc());
    }
    None
}

/// Validate a value against a field schema, attempting type coercion when
/// the runtime representation does not match the declared type. Coercion
/// rewrites the value in place; it never changes the declared type.
pub(crate) fn validate_field_value(
    field: &FieldSchema,
    name: &str,
    value: &mut Value,
) -> Result<()> {
    let has_value = !value.is_null();

    if (field.required || !field.optional) && !has_value {
        return Err(OrmError::validation(
            name,
            format!("required field value missing: {}", name),
        ));
    }

    if has_value && !runtime_type_matches(field.field_type, value) && !coerce(field.field_type, value)
    {
        return Err(OrmError::validation(
            name,
            format!(
                "invalid type ({}) for field: {}. Should be {}. Value was: {}",
                runtime_type_name(value),
                name,
                field.field_type,
                value
            ),
        ));
    }

    let observed_len = match value {
        Value::String(s) => Some(s.chars().count()),
        Value::Array(items) => Some(items.len()),
        _ => None,
    };
    if let Some(len) = observed_len {
        if let Some(min) = field.minlength {
            if len < min {
                return Err(OrmError::validation(
                    name,
                    format!("field value must be at least {} characters long: {}", min, name),
                ));
            }
        }
        if let Some(max) = field.maxlength {
            if len > max {
                return Err(OrmError::validation(
                    name,
                    format!("field value must be at most {} characters long: {}", max, name),
                ));
            }
        }
        if let Some(exact) = field.length {
            if len != exact {
                return Err(OrmError::validation(
                    name,
                    format!(
                        "field value must be exactly {} characters long: {}",
                        exact, name
                    ),
                ));
            }
        }
    }

    // Validators only run when the field is required or a value is present.
    if let Some(validator) = &field.validator {
        if field.required || has_value {
            match validator {
                Validator::Pattern(re) => {
                    if !re.is_match(&value_string(value)) {
                        return Err(OrmError::validation(
                            name,
                            format!(
                                "field \"{}\" failed validation using expression \"{}\" and value: {}",
                                name,
                                re.as_str(),
                                value_string(value)
                            ),
                        ));
                    }
                }
                Validator::Function(f) => {
                    if let Some(message) = f(value) {
                        return Err(OrmError::validation(name, message));
                    }
                }
            }
        }
    }

    Ok(())
}

fn runtime_type_matches(field_type: FieldType, value: &Value) -> bool {
    match field_type {
        FieldType::String => value.is_string(),
        FieldType::Number => value.is_number(),
        FieldType::Boolean => value.is_boolean(),
        FieldType::Object => value.is_object(),
        FieldType::Array => value.is_array(),
        FieldType::Date => value.as_str().is_some_and(|s| parse_date(s).is_some()),
    }
}

fn coerce(field_type: FieldType, value: &mut Value) -> bool {
    match field_type {
        FieldType::Boolean => match &*value {
            Value::Number(n) => {
                *value = Value::Bool(n.as_f64().is_some_and(|f| f >= 1.0));
                true
            }
            Value::String(s) => match s.trim().to_lowercase().as_str() {
                "false" | "no" | "0" => {
                    *value = Value::Bool(false);
                    true
                }
                "true" | "yes" | "1" => {
                    *value = Value::Bool(true);
                    true
                }
                _ => false,
            },
            _ => false,
        },
        FieldType::Number => match &*value {
            Value::String(s) => {
                let s = s.trim();
                if let Ok(i) = s.parse::<i64>() {
                    *value = Value::Number(i.into());
                    true
                } else if let Some(n) = s
                    .parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite())
                    .and_then(serde_json::Number::from_f64)
                {
                    *value = Value::Number(n);
                    true
                } else {
                    false
                }
            }
            _ => false,
        },
        FieldType::Date => match &*value {
            Value::Number(n) => match n.as_i64().and_then(DateTime::<Utc>::from_timestamp_millis) {
                Some(dt) => {
                    *value = Value::String(dt.to_rfc3339());
                    true
                }
                None => false,
            },
            _ => false,
        },
        FieldType::Object => match &*value {
            Value::String(s) if s.is_empty() => {
                *value = Value::Object(Map::new());
                true
            }
            _ => false,
        },
        FieldType::Array | FieldType::String => false,
    }
}

fn runtime_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::FieldDefinition;
    use serde_json::json;

    fn number_field() -> FieldSchema {
        FieldSchema::from_definition("n", &FieldDefinition::new(FieldType::Number)).unwrap()
    }

    #[test]
    fn test_coerce_numeric_string() {
        let field = number_field();
        let mut value = json!("10");
        validate_field_value(&field, "n", &mut value).unwrap();
        assert_eq!(value, json!(10));
    }

    #[test]
    fn test_coerce_float_string() {
        let field = number_field();
        let mut value = json!("10.5");
        validate_field_value(&field, "n", &mut value).unwrap();
        assert_eq!(value, json!(10.5));
    }

    #[test]
    fn test_reject_non_numeric_string() {
        let field = number_field();
        let mut value = json!("ten");
        let err = validate_field_value(&field, "n", &mut value).unwrap_err();
        assert_eq!(err.field(), Some("n"));
    }

    #[test]
    fn test_coerce_boolean_forms() {
        let field =
            FieldSchema::from_definition("b", &FieldDefinition::new(FieldType::Boolean)).unwrap();
        for (input, expected) in [
            (json!("yes"), true),
            (json!("TRUE"), true),
            (json!("1"), true),
            (json!(2), true),
            (json!("no"), false),
            (json!("false"), false),
            (json!("0"), false),
            (json!(0), false),
        ] {
            let mut value = input;
            validate_field_value(&field, "b", &mut value).unwrap();
            assert_eq!(value, json!(expected));
        }
        let mut bad = json!("maybe");
        assert!(validate_field_value(&field, "b", &mut bad).is_err());
    }

    #[test]
    fn test_coerce_epoch_to_date() {
        let field =
            FieldSchema::from_definition("d", &FieldDefinition::new(FieldType::Date)).unwrap();
        let mut value = json!(0_i64);
        validate_field_value(&field, "d", &mut value).unwrap();
        assert!(value.as_str().unwrap().starts_with("1970-01-01"));
    }

    #[test]
    fn test_empty_string_coerces_to_object() {
        let field =
            FieldSchema::from_definition("o", &FieldDefinition::new(FieldType::Object)).unwrap();
        let mut value = json!("");
        validate_field_value(&field, "o", &mut value).unwrap();
        assert_eq!(value, json!({}));
    }

    #[test]
    fn test_array_requires_array() {
        let field =
            FieldSchema::from_definition("a", &FieldDefinition::new(FieldType::Array)).unwrap();
        let mut ok = json!([1, 2]);
        assert!(validate_field_value(&field, "a", &mut ok).is_ok());
        let mut bad = json!("1,2");
        assert!(validate_field_value(&field, "a", &mut bad).is_err());
    }

    #[test]
    fn test_required_missing() {
        let field = FieldSchema::from_definition(
            "name",
            &FieldDefinition::new(FieldType::String).required(),
        )
        .unwrap();
        let mut value = Value::Null;
        let err = validate_field_value(&field, "name", &mut value).unwrap_err();
        assert_eq!(
            err.to_string(),
            "required field value missing: name"
        );
    }

    #[test]
    fn test_length_constraints() {
        let field = FieldSchema::from_definition(
            "code",
            &FieldDefinition::new(FieldType::String)
                .minlength(2)
                .maxlength(4),
        )
        .unwrap();

        let mut short = json!("a");
        let err = validate_field_value(&field, "code", &mut short).unwrap_err();
        assert_eq!(
            err.to_string(),
            "field value must be at least 2 characters long: code"
        );

        let mut long = json!("abcde");
        let err = validate_field_value(&field, "code", &mut long).unwrap_err();
        assert_eq!(
            err.to_string(),
            "field value must be at most 4 characters long: code"
        );

        let exact = FieldSchema::from_definition(
            "code",
            &FieldDefinition::new(FieldType::String).length(3),
        )
        .unwrap();
        let mut wrong = json!("ab");
        let err = validate_field_value(&exact, "code", &mut wrong).unwrap_err();
        assert_eq!(
            err.to_string(),
            "field value must be exactly 3 characters long: code"
        );
    }

    #[test]
    fn test_pattern_validator() {
        let field = FieldSchema::from_definition(
            "slug",
            &FieldDefinition::new(FieldType::String)
                .validator(Validator::pattern("^[a-z-]+$").unwrap()),
        )
        .unwrap();
        let mut ok = json!("a-slug");
        assert!(validate_field_value(&field, "slug", &mut ok).is_ok());
        let mut bad = json!("Not A Slug");
        assert!(validate_field_value(&field, "slug", &mut bad).is_err());
    }

    #[test]
    fn test_function_validator() {
        let field = FieldSchema::from_definition(
            "age",
            &FieldDefinition::new(FieldType::Number).validator(Validator::function(|v| {
                match v.as_i64() {
                    Some(age) if age >= 0 => None,
                    _ => Some("age must not be negative".to_string()),
                }
            })),
        )
        .unwrap();
        let mut ok = json!(5);
        assert!(validate_field_value(&field, "age", &mut ok).is_ok());
        let mut bad = json!(-5);
        let err = validate_field_value(&field, "age", &mut bad).unwrap_err();
        assert_eq!(err.to_string(), "age must not be negative");
    }

    #[test]
    fn test_validator_skipped_without_value() {
        // Optional field with no value: the validator must not run.
        let field = FieldSchema::from_definition(
            "nick",
            &FieldDefinition::new(FieldType::String)
                .validator(Validator::pattern("^[a-z]+$").unwrap()),
        )
        .unwrap();
        let mut value = Value::Null;
        assert!(validate_field_value(&field, "nick", &mut value).is_ok());
    }

    #[test]
    fn test_parse_date_forms() {
        assert!(parse_date("2024-01-15T10:30:00Z").is_some());
        assert!(parse_date("2024-01-15").is_some());
        assert!(parse_date("not a date").is_none());
    }
}

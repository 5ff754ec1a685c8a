//! Connector contract and lifecycle
//!
//! A [`ConnectorBackend`] is the interface a storage adapter implements.
//! The required minimum is `query`, `create`, `save`, `delete`, and
//! `delete_all`; everything else has a generic fallback built on those.
//! A [`Connector`] wraps a backend with the connect lifecycle: every
//! operation transparently connects on first use, and `connect` runs the
//! metadata/config/schema pipeline exactly once.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::collection::Collection;
use crate::error::{OrmError, Result};
use crate::instance::Instance;
use crate::merge::{deep_merge, merged};
use crate::model::Model;
use crate::query::{QueryOptions, value_string};
use crate::registry::Registry;
use crate::scope::RequestContext;

/// Operations a connector can be asked to perform. A backend opts out of
/// an operation by returning `false` from [`ConnectorBackend::supports`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    CreateMany,
    Save,
    Delete,
    DeleteAll,
    Query,
    FindAll,
    FindOne,
    FindAndModify,
    Distinct,
    Count,
    Upsert,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::CreateMany => "createMany",
            Operation::Save => "save",
            Operation::Delete => "delete",
            Operation::DeleteAll => "deleteAll",
            Operation::Query => "query",
            Operation::FindAll => "findAll",
            Operation::FindOne => "findOne",
            Operation::FindAndModify => "findAndModify",
            Operation::Distinct => "distinct",
            Operation::Count => "count",
            Operation::Upsert => "upsert",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Behavior switches for `find_and_modify`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModifyArgs {
    /// Return the post-update record instead of the pre-update snapshot.
    pub new: bool,
    /// Create the record when the query matches nothing.
    pub upsert: bool,
}

impl ModifyArgs {
    pub fn returning_new(mut self) -> Self {
        self.new = true;
        self
    }

    pub fn upsert(mut self) -> Self {
        self.upsert = true;
        self
    }
}

/// Pattern check applied to a config value: a regex source plus optional
/// inline flags (`i`, `m`, `s`, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigValidator {
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flags: Option<String>,
}

impl ConfigValidator {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            flags: None,
        }
    }

    pub fn with_flags(mut self, flags: impl Into<String>) -> Self {
        self.flags = Some(flags.into());
        self
    }

    fn compile(&self, connector: &str, field: &str) -> Result<regex::Regex> {
        let pattern = match self.flags.as_deref().filter(|f| !f.is_empty()) {
            Some(flags) => format!("(?{}){}", flags, self.value),
            None => self.value.clone(),
        };
        regex::Regex::new(&pattern).map_err(|_| {
            OrmError::config(format!(
                "the {} connector has an invalid validator for {}",
                connector, field
            ))
        })
    }
}

/// One config property a connector declares in its metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigField {
    pub name: String,
    #[serde(default)]
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validator: Option<ConfigValidator>,
}

impl ConfigField {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: false,
            default: None,
            validator: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn validator(mut self, validator: ConfigValidator) -> Self {
        self.validator = Some(validator);
        self
    }
}

/// Connector metadata: declared config fields plus lifecycle-discovered
/// schema and free-form extras.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorMetadata {
    #[serde(default)]
    pub fields: Vec<ConfigField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
    #[serde(default = "default_extra")]
    pub extra: Value,
}

fn default_extra() -> Value {
    Value::Null
}

impl Default for ConnectorMetadata {
    fn default() -> Self {
        Self {
            fields: Vec::new(),
            schema: None,
            extra: Value::Null,
        }
    }
}

impl ConnectorMetadata {
    /// Layer fetched metadata on top of this metadata.
    fn merge(&mut self, other: ConnectorMetadata) {
        if !other.fields.is_empty() {
            self.fields = other.fields;
        }
        if other.schema.is_some() {
            self.schema = other.schema;
        }
        if !other.extra.is_null() {
            deep_merge(&mut self.extra, other.extra);
        }
    }
}

/// The interface a storage adapter implements.
///
/// Lifecycle hooks (`fetch_metadata`, `fetch_config`, `connect`,
/// `fetch_schema`) drive the connect pipeline; request hooks
/// (`start_request`, `login_required`, `login`, `end_request`) run inside
/// a request scope; the CRUD surface does the actual work.
#[async_trait]
pub trait ConnectorBackend: Send + Sync {
    /// Unique-ish connector name. Required.
    fn name(&self) -> &str;

    fn description(&self) -> Option<&str> {
        None
    }

    fn version(&self) -> Option<&str> {
        None
    }

    fn author(&self) -> Option<&str> {
        None
    }

    /// Declared metadata, notably the config fields validated at connect.
    fn metadata(&self) -> ConnectorMetadata {
        ConnectorMetadata::default()
    }

    /// Recommended configuration block shown to operators when a required
    /// config property is missing.
    fn default_config(&self) -> Option<&str> {
        None
    }

    /// Opt in to `$like`/`$notLike` where-clause translation.
    fn translate_where_regex(&self) -> bool {
        false
    }

    /// Capability check; an unsupported operation is rejected at dispatch.
    fn supports(&self, _operation: Operation) -> bool {
        true
    }

    /// Storage column used as the primary key.
    fn primary_key_column(&self, _model: &Model) -> String {
        "id".to_string()
    }

    /// Primary key of a raw record.
    fn primary_key_of(&self, model: &Model, record: &Value) -> Option<Value> {
        record.get(self.primary_key_column(model).as_str()).cloned()
    }

    // -------------------------------------------------------------------------
    // Lifecycle hooks
    // -------------------------------------------------------------------------

    async fn fetch_metadata(&self) -> Result<Option<ConnectorMetadata>> {
        Ok(None)
    }

    async fn fetch_config(&self) -> Result<Option<Value>> {
        Ok(None)
    }

    async fn fetch_schema(&self) -> Result<Option<Value>> {
        Ok(None)
    }

    /// Implementation's own connect step, run with the validated config.
    async fn connect(&self, _config: &Value) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Request hooks
    // -------------------------------------------------------------------------

    async fn start_request(&self, _method: &str, _ctx: &RequestContext) -> Result<()> {
        Ok(())
    }

    async fn end_request(&self, _method: &str, _ctx: &RequestContext) -> Result<()> {
        Ok(())
    }

    async fn login_required(&self, _ctx: &RequestContext) -> Result<bool> {
        Ok(false)
    }

    /// Whether a login implementation exists. A backend overriding
    /// [`ConnectorBackend::login`] must also return `true` here.
    fn has_login(&self) -> bool {
        false
    }

    async fn login(&self, _ctx: &RequestContext) -> Result<()> {
        Ok(())
    }

    // -------------------------------------------------------------------------
    // CRUD surface
    // -------------------------------------------------------------------------

    async fn create(&self, _model: &Model, _payload: Value) -> Result<Instance> {
        Err(OrmError::NotImplemented("create"))
    }

    async fn create_many(&self, model: &Model, payloads: Vec<Value>) -> Result<Collection> {
        let mut out = Collection::new(model.name(), Vec::new());
        for payload in payloads {
            out.add(self.create(model, payload).await?);
        }
        Ok(out)
    }

    async fn save(&self, _model: &Model, _instance: &Instance) -> Result<()> {
        Err(OrmError::NotImplemented("save"))
    }

    async fn delete(&self, _model: &Model, _instance: &Instance) -> Result<()> {
        Err(OrmError::NotImplemented("delete"))
    }

    async fn delete_all(&self, _model: &Model) -> Result<u64> {
        Err(OrmError::NotImplemented("deleteAll"))
    }

    async fn query(&self, _model: &Model, _options: &QueryOptions) -> Result<Collection> {
        Err(OrmError::NotImplemented("query"))
    }

    async fn find_all(&self, model: &Model) -> Result<Collection> {
        self.query(model, &QueryOptions::with_limit(1000)).await
    }

    async fn find_one(&self, model: &Model, id: &Value) -> Result<Option<Instance>> {
        let mut where_clause = Map::new();
        where_clause.insert(self.primary_key_column(model), id.clone());
        let mut options = QueryOptions::with_limit(1);
        options.where_clause = Some(Value::Object(where_clause));
        Ok(self.query(model, &options).await?.into_iter().next())
    }

    /// Find one record and modify it in the same logical operation.
    async fn find_and_modify(
        &self,
        model: &Model,
        options: &QueryOptions,
        doc: Value,
        args: &ModifyArgs,
    ) -> Result<Option<Instance>> {
        let options = options.limited(1);
        let results = self.query(model, &options).await?;
        match results.into_iter().next() {
            Some(mut record) => {
                let snapshot = record.clone();
                record.set_values(doc, false)?;
                self.save(model, &record).await?;
                record.clear_dirty();
                Ok(Some(if args.new { record } else { snapshot }))
            }
            None if args.upsert => {
                let record = self.create(model, doc).await?;
                Ok(if args.new { Some(record) } else { None })
            }
            None => Ok(None),
        }
    }

    /// Deduplicate query results by the value(s) of one or more
    /// comma-separated fields, preserving first-seen order.
    async fn distinct(
        &self,
        model: &Model,
        field: &str,
        options: &QueryOptions,
    ) -> Result<Collection> {
        let results = self.query(model, options).await?;
        let keys: Vec<&str> = field.split(',').map(str::trim).collect();
        let mut seen = HashSet::new();
        let mut out = Collection::new(model.name(), Vec::new());
        for row in results {
            let key = keys
                .iter()
                .map(|k| row.get(k).map(|v| value_string(&v)).unwrap_or_default())
                .collect::<Vec<_>>()
                .join(",");
            if seen.insert(key) {
                out.add(row);
            }
        }
        Ok(out)
    }

    /// Count query results, or unique values of `options.distinct`.
    async fn count(&self, model: &Model, options: &QueryOptions) -> Result<u64> {
        let results = self.query(model, options).await?;
        match &options.distinct {
            Some(field) => {
                let mut seen = HashSet::new();
                for row in &results {
                    seen.insert(row.get(field).map(|v| value_string(&v)).unwrap_or_default());
                }
                Ok(seen.len() as u64)
            }
            None => Ok(results.len() as u64),
        }
    }

    /// Update the record with the given id, or create it when absent.
    async fn upsert(&self, model: &Model, id: Value, document: Value) -> Result<Instance> {
        match self.find_one(model, &id).await? {
            Some(mut record) => {
                record.set_values(document, false)?;
                self.save(model, &record).await?;
                record.clear_dirty();
                Ok(record)
            }
            None => {
                let mut document = document;
                if let Value::Object(map) = &mut document {
                    map.insert(self.primary_key_column(model), id);
                }
                self.create(model, document).await
            }
        }
    }
}

struct ConnectorState {
    connected: bool,
    config: Value,
    metadata: ConnectorMetadata,
}

/// A registered backend plus its connect-lifecycle state.
///
/// Every operation checks `connected` and transparently runs the connect
/// pipeline first, so callers never connect explicitly.
pub struct Connector {
    backend: Arc<dyn ConnectorBackend>,
    state: RwLock<ConnectorState>,
    connect_lock: tokio::sync::Mutex<()>,
}

impl Connector {
    /// Register a backend. The backend must declare a name.
    pub fn new(backend: Arc<dyn ConnectorBackend>, config: Value) -> Result<Arc<Self>> {
        if backend.name().trim().is_empty() {
            return Err(OrmError::message("connector is required to have a name"));
        }
        let metadata = backend.metadata();
        let connector = Arc::new(Self {
            backend,
            state: RwLock::new(ConnectorState {
                connected: false,
                config,
                metadata,
            }),
            connect_lock: tokio::sync::Mutex::new(()),
        });
        Registry::global().register_connector(&connector);
        Ok(connector)
    }

    pub fn name(&self) -> &str {
        self.backend.name()
    }

    pub fn backend(&self) -> &Arc<dyn ConnectorBackend> {
        &self.backend
    }

    pub fn is_connected(&self) -> bool {
        self.read_state(|s| s.connected)
    }

    /// Current (possibly merged and defaulted) configuration.
    pub fn config(&self) -> Value {
        self.read_state(|s| s.config.clone())
    }

    /// Current metadata, including any lifecycle-discovered schema.
    pub fn metadata(&self) -> ConnectorMetadata {
        self.read_state(|s| s.metadata.clone())
    }

    pub fn translate_where_regex(&self) -> bool {
        self.backend.translate_where_regex()
    }

    pub fn supports(&self, operation: Operation) -> bool {
        self.backend.supports(operation)
    }

    pub fn primary_key_column(&self, model: &Model) -> String {
        self.backend.primary_key_column(model)
    }

    fn read_state<T>(&self, f: impl FnOnce(&ConnectorState) -> T) -> T {
        f(&self.state.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Run the connect lifecycle. Idempotent after success; concurrent
    /// first calls connect exactly once.
    ///
    /// Pipeline, aborting on the first error:
    /// 1. `fetch_metadata`, merged into declared metadata
    /// 2. `fetch_config` (constructor config overrides fetched values),
    ///    then config validation
    /// 3. the backend's own `connect` hook
    /// 4. `fetch_schema`, merged into `metadata.schema`
    pub async fn connect(&self) -> Result<()> {
        let _guard = self.connect_lock.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        let mut metadata = self.metadata();
        if let Some(fetched) = self.backend.fetch_metadata().await? {
            metadata.merge(fetched);
        }

        let constructor_config = self.config();
        let mut config = match self.backend.fetch_config().await? {
            Some(fetched) => merged(&fetched, &constructor_config),
            None => constructor_config,
        };
        self.validate_config_against(&mut config, &metadata)?;

        self.backend.connect(&config).await?;

        if let Some(schema) = self.backend.fetch_schema().await? {
            metadata.schema = Some(match metadata.schema.take() {
                Some(mut existing) => {
                    deep_merge(&mut existing, schema);
                    existing
                }
                None => schema,
            });
        }

        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.config = config;
        state.metadata = metadata;
        state.connected = true;
        tracing::debug!(connector = self.name(), "connected");
        Ok(())
    }

    /// Disconnect the backend and drop the connected flag.
    pub async fn disconnect(&self) -> Result<()> {
        self.backend.disconnect().await?;
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.connected = false;
        Ok(())
    }

    /// Validate the current config against the declared metadata fields,
    /// populating optional defaults.
    pub fn validate_config(&self) -> Result<()> {
        let metadata = self.metadata();
        let mut config = self.config();
        self.validate_config_against(&mut config, &metadata)?;
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.config = config;
        Ok(())
    }

    fn validate_config_against(
        &self,
        config: &mut Value,
        metadata: &ConnectorMetadata,
    ) -> Result<()> {
        if metadata.fields.is_empty() {
            return Ok(());
        }
        if config.is_null() {
            *config = Value::Object(Map::new());
        }
        for field in &metadata.fields {
            let current = config.get(&field.name);
            let missing = match current {
                None | Some(Value::Null) => true,
                Some(Value::String(s)) => s.is_empty(),
                Some(_) => false,
            };
            if missing {
                if field.required {
                    self.log_default_config();
                    return Err(OrmError::config(format!(
                        "{} is a required config property for the {} connector",
                        field.name,
                        self.name()
                    )));
                }
                if let Some(default) = &field.default {
                    if let Value::Object(map) = config {
                        map.insert(field.name.clone(), default.clone());
                    }
                }
            } else if let Some(validator) = &field.validator {
                let re = validator.compile(self.name(), &field.name)?;
                let value = value_string(current.unwrap_or(&Value::Null));
                if !re.is_match(&value) {
                    self.log_default_config();
                    return Err(OrmError::config(format!(
                        "the value \"{}\" for {} is invalid for the {} connector",
                        value,
                        field.name,
                        self.name()
                    )));
                }
            }
        }
        Ok(())
    }

    fn log_default_config(&self) {
        if let Some(default_config) = self.backend.default_config() {
            tracing::info!(
                connector = self.name(),
                "recommended configuration:\n{}",
                default_config
            );
        }
    }

    async fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        self.connect().await
    }

    // -------------------------------------------------------------------------
    // Delegated operations, connect-on-demand
    // -------------------------------------------------------------------------

    pub async fn create(&self, model: &Model, payload: Value) -> Result<Instance> {
        self.ensure_connected().await?;
        self.backend.create(model, payload).await
    }

    pub async fn create_many(&self, model: &Model, payloads: Vec<Value>) -> Result<Collection> {
        self.ensure_connected().await?;
        self.backend.create_many(model, payloads).await
    }

    pub async fn save(&self, model: &Model, instance: &Instance) -> Result<()> {
        self.ensure_connected().await?;
        self.backend.save(model, instance).await
    }

    pub async fn delete(&self, model: &Model, instance: &Instance) -> Result<()> {
        self.ensure_connected().await?;
        self.backend.delete(model, instance).await
    }

    pub async fn delete_all(&self, model: &Model) -> Result<u64> {
        self.ensure_connected().await?;
        self.backend.delete_all(model).await
    }

    pub async fn query(&self, model: &Model, options: &QueryOptions) -> Result<Collection> {
        self.ensure_connected().await?;
        self.backend.query(model, options).await
    }

    pub async fn find_all(&self, model: &Model) -> Result<Collection> {
        self.ensure_connected().await?;
        self.backend.find_all(model).await
    }

    pub async fn find_one(&self, model: &Model, id: &Value) -> Result<Option<Instance>> {
        self.ensure_connected().await?;
        self.backend.find_one(model, id).await
    }

    pub async fn find_and_modify(
        &self,
        model: &Model,
        options: &QueryOptions,
        doc: Value,
        args: &ModifyArgs,
    ) -> Result<Option<Instance>> {
        self.ensure_connected().await?;
        self.backend.find_and_modify(model, options, doc, args).await
    }

    pub async fn distinct(
        &self,
        model: &Model,
        field: &str,
        options: &QueryOptions,
    ) -> Result<Collection> {
        self.ensure_connected().await?;
        self.backend.distinct(model, field, options).await
    }

    pub async fn count(&self, model: &Model, options: &QueryOptions) -> Result<u64> {
        self.ensure_connected().await?;
        self.backend.count(model, options).await
    }

    pub async fn upsert(&self, model: &Model, id: Value, document: Value) -> Result<Instance> {
        self.ensure_connected().await?;
        self.backend.upsert(model, id, document).await
    }
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("name", &self.name())
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Nameless;

    #[async_trait]
    impl ConnectorBackend for Nameless {
        fn name(&self) -> &str {
            ""
        }
    }

    struct ConfigOnly {
        fields: Vec<ConfigField>,
    }

    #[async_trait]
    impl ConnectorBackend for ConfigOnly {
        fn name(&self) -> &str {
            "config-only"
        }

        fn metadata(&self) -> ConnectorMetadata {
            ConnectorMetadata {
                fields: self.fields.clone(),
                schema: None,
                extra: Value::Null,
            }
        }
    }

    fn config_connector(fields: Vec<ConfigField>, config: Value) -> Arc<Connector> {
        Connector::new(Arc::new(ConfigOnly { fields }), config).unwrap()
    }

    #[test]
    fn test_connector_requires_name() {
        let err = Connector::new(Arc::new(Nameless), json!({})).unwrap_err();
        assert_eq!(err.to_string(), "connector is required to have a name");
    }

    #[test]
    fn test_required_config_missing_is_fatal() {
        let connector = config_connector(
            vec![ConfigField::new("url").required()],
            json!({}),
        );
        let err = connector.validate_config().unwrap_err();
        assert!(err.to_string().contains("url is a required config property"));
    }

    #[test]
    fn test_optional_config_default_is_populated() {
        let connector = config_connector(
            vec![ConfigField::new("timeout").default_value(30)],
            json!({}),
        );
        connector.validate_config().unwrap();
        assert_eq!(connector.config()["timeout"], json!(30));
    }

    #[test]
    fn test_config_validator_rejects_mismatch() {
        let connector = config_connector(
            vec![ConfigField::new("url").validator(ConfigValidator::new("^https://"))],
            json!({"url": "ftp://example.com"}),
        );
        let err = connector.validate_config().unwrap_err();
        assert!(err.to_string().contains("is invalid for the config-only connector"));
    }

    #[test]
    fn test_config_validator_accepts_match_with_flags() {
        let connector = config_connector(
            vec![ConfigField::new("region").validator(ConfigValidator::new("^eu-").with_flags("i"))],
            json!({"region": "EU-WEST-1"}),
        );
        connector.validate_config().unwrap();
    }

    #[test]
    fn test_empty_string_counts_as_missing() {
        let connector = config_connector(
            vec![ConfigField::new("token").required()],
            json!({"token": ""}),
        );
        assert!(connector.validate_config().is_err());
    }

    #[test]
    fn test_metadata_merge() {
        let mut base = ConnectorMetadata::default();
        base.fields.push(ConfigField::new("url"));
        base.merge(ConnectorMetadata {
            fields: Vec::new(),
            schema: Some(json!({"tables": ["a"]})),
            extra: json!({"note": 1}),
        });
        assert_eq!(base.fields.len(), 1);
        assert_eq!(base.schema, Some(json!({"tables": ["a"]})));
        assert_eq!(base.extra, json!({"note": 1}));
    }

    #[test]
    fn test_modify_args_builders() {
        let args = ModifyArgs::default().returning_new().upsert();
        assert!(args.new);
        assert!(args.upsert);
    }
}

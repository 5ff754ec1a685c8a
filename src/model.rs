//! Model definition and dispatch
//!
//! A [`Model`] owns a set of field schemas, optional custom members, and a
//! bound connector. It is the facade callers go through: arguments are
//! normalized, instances are constructed and validated, and the actual
//! persistence work is delegated to the connector (or to a request scope
//! wrapping it).

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock, Weak};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::collection::Collection;
use crate::connector::{Connector, ModifyArgs, Operation};
use crate::error::{OrmError, Result, ValidationError};
use crate::field::{FieldDefinition, FieldMapping, FieldSchema, FieldType};
use crate::instance::{Instance, parse_date};
use crate::merge::merged;
use crate::query::{self, QueryOptions, value_string};
use crate::registry::Registry;
use crate::scope::{RequestContext, RequestScope, ScopedModel};

/// Actions that can be enabled per model. An undefined action list enables
/// everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Action {
    Create,
    Upsert,
    Read,
    FindAll,
    FindOne,
    FindAndUpdate,
    Count,
    Query,
    Distinct,
    Update,
    Delete,
    DeleteAll,
}

impl Action {
    /// Every valid action.
    pub const ALL: [Action; 12] = [
        Action::Create,
        Action::Upsert,
        Action::Read,
        Action::FindAll,
        Action::FindOne,
        Action::FindAndUpdate,
        Action::Count,
        Action::Query,
        Action::Distinct,
        Action::Update,
        Action::Delete,
        Action::DeleteAll,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Upsert => "upsert",
            Action::Read => "read",
            Action::FindAll => "findAll",
            Action::FindOne => "findOne",
            Action::FindAndUpdate => "findAndUpdate",
            Action::Count => "count",
            Action::Query => "query",
            Action::Distinct => "distinct",
            Action::Update => "update",
            Action::Delete => "delete",
            Action::DeleteAll => "deleteAll",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = OrmError;

    fn from_str(s: &str) -> Result<Self> {
        Action::ALL
            .iter()
            .find(|a| a.as_str() == s)
            .copied()
            .ok_or_else(|| {
                OrmError::invalid_argument(format!(
                    "actions must include only: {}",
                    Action::ALL.map(|a| a.as_str()).join(", ")
                ))
            })
    }
}

/// Custom model method: receives the model, the instance it was invoked on
/// (when instance-bound), and caller arguments.
pub type ModelMethodFn =
    Arc<dyn Fn(&Model, Option<&Instance>, Value) -> Result<Value> + Send + Sync>;

/// Hook applied to a whole serialized object (`to_json`/`to_payload`).
pub type SerializeHook = Arc<dyn Fn(Value, &Instance) -> Value + Send + Sync>;

/// Extra member attached to a model definition: a plain value or a typed
/// method, both reachable from the model and its instances.
#[derive(Clone)]
pub enum CustomMember {
    Value(Value),
    Method(ModelMethodFn),
}

impl fmt::Debug for CustomMember {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CustomMember::Value(v) => f.debug_tuple("Value").field(v).finish(),
            CustomMember::Method(_) => f.debug_tuple("Method").field(&"<fn>").finish(),
        }
    }
}

/// Model definition written by a schema author.
#[derive(Default)]
pub struct ModelDefinition {
    pub(crate) fields: BTreeMap<String, FieldDefinition>,
    pub(crate) connector: Option<Arc<Connector>>,
    pub(crate) metadata: Option<Value>,
    pub(crate) mappings: BTreeMap<String, FieldMapping>,
    pub(crate) actions: Option<Vec<Action>>,
    pub(crate) singular: Option<String>,
    pub(crate) plural: Option<String>,
    pub(crate) autogen: Option<bool>,
    pub(crate) default_query_options: Option<Value>,
    pub(crate) serialize: Option<SerializeHook>,
    pub(crate) deserialize: Option<SerializeHook>,
    pub(crate) members: BTreeMap<String, CustomMember>,
}

impl std::fmt::Debug for ModelDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelDefinition")
            .field("fields", &self.fields)
            .field("connector", &self.connector.as_ref().map(|_| "<connector>"))
            .field("metadata", &self.metadata)
            .field("mappings", &self.mappings)
            .field("actions", &self.actions)
            .field("singular", &self.singular)
            .field("plural", &self.plural)
            .field("autogen", &self.autogen)
            .field("default_query_options", &self.default_query_options)
            .field("serialize", &self.serialize.as_ref().map(|_| "<hook>"))
            .field("deserialize", &self.deserialize.as_ref().map(|_| "<hook>"))
            .field("members", &self.members)
            .finish()
    }
}

impl ModelDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a field.
    pub fn field(mut self, name: impl Into<String>, definition: FieldDefinition) -> Self {
        self.fields.insert(name.into(), definition);
        self
    }

    /// Bind a connector.
    pub fn connector(mut self, connector: Arc<Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Free-form metadata, keyed by connector name for connector-specific
    /// settings.
    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Model-level get/set transform for a field.
    pub fn mapping(mut self, name: impl Into<String>, mapping: FieldMapping) -> Self {
        self.mappings.insert(name.into(), mapping);
        self
    }

    /// Restrict enabled actions.
    pub fn actions(mut self, actions: Vec<Action>) -> Self {
        self.actions = Some(actions);
        self
    }

    /// Restrict enabled actions from their wire names; an unknown name is
    /// an error.
    pub fn actions_from<I, S>(mut self, actions: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let parsed = actions
            .into_iter()
            .map(|s| s.as_ref().parse())
            .collect::<Result<Vec<Action>>>()?;
        self.actions = Some(parsed);
        Ok(self)
    }

    pub fn singular(mut self, singular: impl Into<String>) -> Self {
        self.singular = Some(singular.into());
        self
    }

    pub fn plural(mut self, plural: impl Into<String>) -> Self {
        self.plural = Some(plural.into());
        self
    }

    pub fn autogen(mut self, autogen: bool) -> Self {
        self.autogen = Some(autogen);
        self
    }

    /// Query options layered underneath every query.
    pub fn default_query_options(mut self, options: Value) -> Self {
        self.default_query_options = Some(options);
        self
    }

    /// Hook applied to the result of `to_json`.
    pub fn serialize<F>(mut self, f: F) -> Self
    where
        F: Fn(Value, &Instance) -> Value + Send + Sync + 'static,
    {
        self.serialize = Some(Arc::new(f));
        self
    }

    /// Hook applied to the result of `to_payload`.
    pub fn deserialize<F>(mut self, f: F) -> Self
    where
        F: Fn(Value, &Instance) -> Value + Send + Sync + 'static,
    {
        self.deserialize = Some(Arc::new(f));
        self
    }

    /// Attach a custom method, callable on the model and its instances.
    pub fn method<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Model, Option<&Instance>, Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.members
            .insert(name.into(), CustomMember::Method(Arc::new(f)));
        self
    }

    /// Attach a plain value member.
    pub fn member(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.members
            .insert(name.into(), CustomMember::Value(value.into()));
        self
    }
}

/// Argument to [`Model::find`]: nothing (find all), a primary key, or
/// query options.
#[derive(Debug, Clone)]
pub enum FindArg {
    All,
    Id(Value),
    Query(Value),
}

impl From<()> for FindArg {
    fn from(_: ()) -> Self {
        FindArg::All
    }
}

impl From<Value> for FindArg {
    fn from(value: Value) -> Self {
        if value.is_object() {
            FindArg::Query(value)
        } else {
            FindArg::Id(value)
        }
    }
}

impl From<&str> for FindArg {
    fn from(id: &str) -> Self {
        FindArg::Id(Value::String(id.to_string()))
    }
}

impl From<String> for FindArg {
    fn from(id: String) -> Self {
        FindArg::Id(Value::String(id))
    }
}

impl From<i64> for FindArg {
    fn from(id: i64) -> Self {
        FindArg::Id(id.into())
    }
}

impl From<u64> for FindArg {
    fn from(id: u64) -> Self {
        FindArg::Id(id.into())
    }
}

/// Result of a query: a collection, or a single optional instance when the
/// query was limited to one record.
#[derive(Debug)]
pub enum QueryResult {
    Many(Collection),
    One(Option<Instance>),
}

impl QueryResult {
    /// Flatten into a collection.
    pub fn into_collection(self) -> Collection {
        match self {
            QueryResult::Many(collection) => collection,
            QueryResult::One(Some(instance)) => Collection::from_instances(vec![instance]),
            QueryResult::One(None) => Collection::default(),
        }
    }

    /// The first (or only) instance.
    pub fn into_one(self) -> Option<Instance> {
        match self {
            QueryResult::One(instance) => instance,
            QueryResult::Many(collection) => collection.into_iter().next(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            QueryResult::Many(collection) => collection.len(),
            QueryResult::One(Some(_)) => 1,
            QueryResult::One(None) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// Dispatch target: the bound connector directly, or a request scope
// wrapping it.
pub(crate) enum Channel<'a> {
    Direct(&'a Arc<Connector>),
    Scoped(&'a RequestScope),
}

impl Channel<'_> {
    pub(crate) fn connector(&self) -> &Arc<Connector> {
        match self {
            Channel::Direct(connector) => connector,
            Channel::Scoped(scope) => scope.connector(),
        }
    }

    fn supports(&self, operation: Operation) -> bool {
        self.connector().supports(operation)
    }

    fn primary_key_column(&self, model: &Model) -> String {
        self.connector().primary_key_column(model)
    }

    async fn create(&self, model: &Model, payload: Value) -> Result<Instance> {
        match self {
            Channel::Direct(c) => c.create(model, payload).await,
            Channel::Scoped(s) => s.create(model, payload).await,
        }
    }

    async fn create_many(&self, model: &Model, payloads: Vec<Value>) -> Result<Collection> {
        match self {
            Channel::Direct(c) => c.create_many(model, payloads).await,
            Channel::Scoped(s) => s.create_many(model, payloads).await,
        }
    }

    async fn save(&self, model: &Model, instance: &Instance) -> Result<()> {
        match self {
            Channel::Direct(c) => c.save(model, instance).await,
            Channel::Scoped(s) => s.save(model, instance).await,
        }
    }

    async fn delete(&self, model: &Model, instance: &Instance) -> Result<()> {
        match self {
            Channel::Direct(c) => c.delete(model, instance).await,
            Channel::Scoped(s) => s.delete(model, instance).await,
        }
    }

    async fn delete_all(&self, model: &Model) -> Result<u64> {
        match self {
            Channel::Direct(c) => c.delete_all(model).await,
            Channel::Scoped(s) => s.delete_all(model).await,
        }
    }

    async fn query(&self, model: &Model, options: &QueryOptions) -> Result<Collection> {
        match self {
            Channel::Direct(c) => c.query(model, options).await,
            Channel::Scoped(s) => s.query(model, options).await,
        }
    }

    async fn find_all(&self, model: &Model) -> Result<Collection> {
        match self {
            Channel::Direct(c) => c.find_all(model).await,
            Channel::Scoped(s) => s.find_all(model).await,
        }
    }

    async fn find_one(&self, model: &Model, id: &Value) -> Result<Option<Instance>> {
        match self {
            Channel::Direct(c) => c.find_one(model, id).await,
            Channel::Scoped(s) => s.find_one(model, id).await,
        }
    }

    async fn find_and_modify(
        &self,
        model: &Model,
        options: &QueryOptions,
        doc: Value,
        args: &ModifyArgs,
    ) -> Result<Option<Instance>> {
        match self {
            Channel::Direct(c) => c.find_and_modify(model, options, doc, args).await,
            Channel::Scoped(s) => s.find_and_modify(model, options, doc, args).await,
        }
    }

    async fn distinct(
        &self,
        model: &Model,
        field: &str,
        options: &QueryOptions,
    ) -> Result<Collection> {
        match self {
            Channel::Direct(c) => c.distinct(model, field, options).await,
            Channel::Scoped(s) => s.distinct(model, field, options).await,
        }
    }

    async fn count(&self, model: &Model, options: &QueryOptions) -> Result<u64> {
        match self {
            Channel::Direct(c) => c.count(model, options).await,
            Channel::Scoped(s) => s.count(model, options).await,
        }
    }

    async fn upsert(&self, model: &Model, id: Value, document: Value) -> Result<Instance> {
        match self {
            Channel::Direct(c) => c.upsert(model, id, document).await,
            Channel::Scoped(s) => s.upsert(model, id, document).await,
        }
    }
}

/// A named schema with behavior, registered process-wide at definition.
pub struct Model {
    // Models always live behind an Arc; the weak self-reference lets
    // instances bind back to it.
    self_ref: Weak<Model>,
    name: String,
    singular: String,
    plural: String,
    autogen: bool,
    fields: BTreeMap<String, FieldSchema>,
    field_remap: HashMap<String, String>,
    mappings: BTreeMap<String, FieldMapping>,
    metadata: RwLock<Value>,
    actions: Vec<Action>,
    members: BTreeMap<String, CustomMember>,
    default_query_options: Option<Value>,
    serialize: Option<SerializeHook>,
    deserialize: Option<SerializeHook>,
    connector: RwLock<Option<Arc<Connector>>>,
    parent: Option<String>,
}

impl Model {
    /// Define and register a model.
    ///
    /// A field literally named `id` is rejected: that name is reserved for
    /// the generated primary key.
    pub fn define(name: impl Into<String>, definition: ModelDefinition) -> Result<Arc<Model>> {
        let name = name.into();
        if definition.fields.contains_key("id") {
            return Err(ValidationError::new(
                "id",
                "id is a reserved field name for the generated primary key",
            )
            .into());
        }
        let model = Self::build(name, definition, None)?;
        Registry::global().register_model(&model);
        Ok(model)
    }

    fn build(
        name: String,
        definition: ModelDefinition,
        parent: Option<&Model>,
    ) -> Result<Arc<Model>> {
        let ModelDefinition {
            fields: field_defs,
            connector,
            metadata,
            mappings,
            actions,
            singular,
            plural,
            autogen,
            default_query_options,
            serialize,
            deserialize,
            members,
        } = definition;

        let mut fields = BTreeMap::new();
        for (key, def) in &field_defs {
            fields.insert(key.clone(), FieldSchema::from_definition(key, def)?);
        }
        let field_remap = build_remap(&fields);

        let lower = name.to_lowercase();
        let singular = singular.unwrap_or_else(|| pluralizer::pluralize(&lower, 1, false));
        let plural = plural.unwrap_or_else(|| pluralizer::pluralize(&lower, 2, false));
        let autogen = autogen.or(parent.map(|p| p.autogen)).unwrap_or(true);
        let parent_name = parent.map(|p| p.name.clone());

        Ok(Arc::new_cyclic(|weak| Model {
            self_ref: weak.clone(),
            name,
            singular,
            plural,
            autogen,
            fields,
            field_remap,
            mappings,
            metadata: RwLock::new(metadata.unwrap_or_else(|| Value::Object(Map::new()))),
            actions: actions.unwrap_or_else(|| Action::ALL.to_vec()),
            members,
            default_query_options,
            serialize,
            deserialize,
            connector: RwLock::new(connector),
            parent: parent_name,
        }))
    }

    // Models are only ever constructed behind an Arc, so the upgrade
    // cannot fail while &self exists.
    pub(crate) fn arc(&self) -> Arc<Model> {
        self.self_ref.upgrade().expect("model is always behind an Arc")
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn singular(&self) -> &str {
        &self.singular
    }

    pub fn plural(&self) -> &str {
        &self.plural
    }

    pub fn autogen(&self) -> bool {
        self.autogen
    }

    /// The model this one was extended or reduced from, if any.
    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    pub fn fields(&self) -> &BTreeMap<String, FieldSchema> {
        &self.fields
    }

    /// Wire/storage key to logical field name remapping.
    pub fn field_remap(&self) -> &HashMap<String, String> {
        &self.field_remap
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    /// Logical field names.
    pub fn keys(&self) -> Vec<String> {
        self.fields.keys().cloned().collect()
    }

    /// Wire keys of non-computed fields, as a connector sees them.
    pub fn payload_keys(&self) -> Vec<String> {
        self.fields
            .iter()
            .filter(|(_, f)| !f.custom)
            .map(|(key, f)| f.wire_name(key).to_string())
            .collect()
    }

    pub fn member(&self, name: &str) -> Option<&CustomMember> {
        self.members.get(name)
    }

    /// Resolve a field's linked model by name through the registry.
    /// Resolution happens at lookup time, so mutually-referencing models
    /// can be defined in any order.
    pub fn related_model(&self, field: &str) -> Option<Arc<Model>> {
        let linked = self.fields.get(field)?.model.as_deref()?;
        Registry::global().model(linked)
    }

    pub(crate) fn serialize_hook(&self) -> Option<&SerializeHook> {
        self.serialize.as_ref()
    }

    pub(crate) fn deserialize_hook(&self) -> Option<&SerializeHook> {
        self.deserialize.as_ref()
    }

    // =========================================================================
    // Connector Binding
    // =========================================================================

    /// The bound connector; an error when none is bound.
    pub fn connector(&self) -> Result<Arc<Connector>> {
        self.connector_opt().ok_or(OrmError::MissingConnector)
    }

    pub fn connector_opt(&self) -> Option<Arc<Connector>> {
        self.connector
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_connector(&self, connector: Arc<Connector>) {
        *self.connector.write().unwrap_or_else(|e| e.into_inner()) = Some(connector);
    }

    // =========================================================================
    // Metadata
    // =========================================================================

    /// Read a metadata entry, preferring the section keyed by the bound
    /// connector's name.
    pub fn meta_get(&self, key: &str) -> Option<Value> {
        let metadata = self.metadata.read().unwrap_or_else(|e| e.into_inner());
        if let Some(connector) = self.connector_opt() {
            if let Some(value) = metadata.get(connector.name()).and_then(|m| m.get(key)) {
                return Some(value.clone());
            }
        }
        metadata.get(key).cloned()
    }

    /// Write a metadata entry into the bound connector's section.
    pub fn meta_set(&self, key: impl Into<String>, value: impl Into<Value>) -> Result<()> {
        let connector = self.connector()?;
        let mut metadata = self.metadata.write().unwrap_or_else(|e| e.into_inner());
        if !metadata.is_object() {
            *metadata = Value::Object(Map::new());
        }
        let section = metadata
            .as_object_mut()
            .and_then(|m| {
                if !m.contains_key(connector.name()) {
                    m.insert(connector.name().to_string(), Value::Object(Map::new()));
                }
                m.get_mut(connector.name())
            })
            .and_then(Value::as_object_mut);
        if let Some(section) = section {
            section.insert(key.into(), value.into());
        }
        Ok(())
    }

    /// Snapshot of the model metadata.
    pub fn metadata(&self) -> Value {
        self.metadata
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    // =========================================================================
    // Transforms & Custom Members
    // =========================================================================

    /// Apply the get-transform for a field: a model-level mapping takes
    /// precedence over the field's own transform.
    pub fn apply_get(&self, name: &str, value: Value, instance: &Instance) -> Value {
        if let Some(mapping) = self.mappings.get(name) {
            return match &mapping.get {
                Some(f) => f(value, name, instance),
                None => value,
            };
        }
        match self.fields.get(name).and_then(|f| f.get.as_ref()) {
            Some(f) => f(value, name, instance),
            None => value,
        }
    }

    /// Apply the set-transform for a field, the inverse of
    /// [`Model::apply_get`].
    pub fn apply_set(&self, name: &str, value: Value, instance: &Instance) -> Value {
        if let Some(mapping) = self.mappings.get(name) {
            return match &mapping.set {
                Some(f) => f(value, name, instance),
                None => value,
            };
        }
        match self.fields.get(name).and_then(|f| f.set.as_ref()) {
            Some(f) => f(value, name, instance),
            None => value,
        }
    }

    /// Invoke a custom method by name.
    pub fn invoke_method(
        &self,
        name: &str,
        instance: Option<&Instance>,
        args: Value,
    ) -> Result<Value> {
        match self.members.get(name) {
            Some(CustomMember::Method(f)) => f(self, instance, args),
            Some(CustomMember::Value(_)) => Err(OrmError::invalid_argument(format!(
                "'{}' is a value member, not a method",
                name
            ))),
            None => Err(OrmError::invalid_argument(format!(
                "unknown method: {}",
                name
            ))),
        }
    }

    // =========================================================================
    // Extension Algebra
    // =========================================================================

    /// Create a new model by merging a definition onto this model's
    /// schema. A child field re-declared over a parent field merges onto
    /// it; a child field renamed to collide with another parent field
    /// drops the colliding parent entry.
    pub fn extend(&self, name: impl Into<String>, definition: ModelDefinition) -> Result<Arc<Model>> {
        extend_or_reduce(self, name.into(), definition, true)
    }

    /// Create a new model keeping only the fields the definition
    /// re-declares, each merged with the parent's definition of the same
    /// key.
    pub fn reduce(&self, name: impl Into<String>, definition: ModelDefinition) -> Result<Arc<Model>> {
        extend_or_reduce(self, name.into(), definition, false)
    }

    // =========================================================================
    // Instances & Query Preparation
    // =========================================================================

    /// Materialize an instance of this model. `skip_unknown` marks the
    /// values as trusted connector data hydrated from storage.
    pub fn instance(&self, values: Value, skip_unknown: bool) -> Result<Instance> {
        Instance::new(self.arc(), values, skip_unknown)
    }

    /// Normalize raw query options against this model and its connector.
    pub fn prepare_query_options(&self, options: Value) -> Result<QueryOptions> {
        let translate = self
            .connector_opt()
            .map(|c| c.translate_where_regex())
            .unwrap_or(false);
        query::prepare_query_options(options, self.default_query_options.as_ref(), translate)
    }

    /// Translate an object keyed by logical field names into one keyed by
    /// wire names, coercing values to their declared field types.
    pub fn translate_keys_for_payload(&self, obj: Value) -> Value {
        let obj = match obj {
            Value::String(s) => match serde_json::from_str::<Value>(&s) {
                Ok(parsed) => parsed,
                Err(_) => return Value::String(s),
            },
            other => other,
        };
        let Value::Object(map) = obj else {
            return obj;
        };
        let mut out = Map::new();
        for (key, value) in map {
            match self.fields.get(&key) {
                Some(field) => {
                    out.insert(
                        field.wire_name(&key).to_string(),
                        coerce_payload_value(field.field_type, value),
                    );
                }
                None => {
                    out.insert(key, value);
                }
            }
        }
        Value::Object(out)
    }

    /// Produce a request-scoped view of this model: operations run through
    /// a [`RequestScope`] that injects login gating and tracing.
    pub fn request_scope(&self, ctx: RequestContext) -> Result<ScopedModel> {
        let connector = self.connector()?;
        Ok(ScopedModel::new(
            self.arc(),
            Arc::new(RequestScope::new(ctx, connector)),
        ))
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    fn guard(&self, channel: &Channel<'_>, action: Action, operation: Operation) -> Result<()> {
        if !self.actions.contains(&action) {
            return Err(OrmError::ActionDisabled {
                model: self.name.clone(),
                action: action.to_string(),
            });
        }
        if !channel.supports(operation) {
            return Err(OrmError::NotSupported {
                connector: channel.connector().name().to_string(),
                operation: operation.to_string(),
            });
        }
        Ok(())
    }

    /// Create a record. The instance is constructed first so validation
    /// runs before the connector is involved.
    pub async fn create(&self, values: Value) -> Result<Instance> {
        let connector = self.connector()?;
        self.create_via(&Channel::Direct(&connector), values).await
    }

    /// Batched create; returns the created records as a collection.
    pub async fn create_many(&self, values: Vec<Value>) -> Result<Collection> {
        let connector = self.connector()?;
        self.create_many_via(&Channel::Direct(&connector), values)
            .await
    }

    /// Persist an instance's pending changes. A clean instance is a
    /// success no-op that never reaches the connector.
    pub async fn save(&self, instance: &mut Instance) -> Result<()> {
        let connector = self.connector()?;
        self.save_via(&Channel::Direct(&connector), instance).await
    }

    /// Delete an instance. Deleting twice is an error.
    pub async fn remove(&self, instance: &mut Instance) -> Result<()> {
        let connector = self.connector()?;
        self.remove_via(&Channel::Direct(&connector), instance).await
    }

    /// Resolve a primary key via `find_one`, then delete the record.
    pub async fn remove_by_id(&self, id: impl Into<Value>) -> Result<Instance> {
        let connector = self.connector()?;
        self.remove_by_id_via(&Channel::Direct(&connector), id.into())
            .await
    }

    /// Delete every record; returns the removed count.
    pub async fn remove_all(&self) -> Result<u64> {
        let connector = self.connector()?;
        self.remove_all_via(&Channel::Direct(&connector)).await
    }

    /// Query records. A query limited to one record yields
    /// [`QueryResult::One`].
    pub async fn query(&self, options: Value) -> Result<QueryResult> {
        let connector = self.connector()?;
        self.query_via(&Channel::Direct(&connector), options).await
    }

    /// Find by argument shape: nothing finds all, an object queries, a
    /// scalar resolves a primary key.
    pub async fn find(&self, arg: impl Into<FindArg>) -> Result<QueryResult> {
        let connector = self.connector()?;
        self.find_via(&Channel::Direct(&connector), arg.into()).await
    }

    pub async fn find_all(&self) -> Result<Collection> {
        let connector = self.connector()?;
        self.find_all_via(&Channel::Direct(&connector)).await
    }

    /// Find by primary key. A missing record is a successful `None`.
    pub async fn find_one(&self, id: impl Into<Value>) -> Result<Option<Instance>> {
        let connector = self.connector()?;
        self.find_one_via(&Channel::Direct(&connector), id.into())
            .await
    }

    pub async fn count(&self, options: Value) -> Result<u64> {
        let connector = self.connector()?;
        self.count_via(&Channel::Direct(&connector), options).await
    }

    /// Unique values of one or more comma-separated fields.
    pub async fn distinct(&self, field: &str, options: Value) -> Result<Collection> {
        let connector = self.connector()?;
        self.distinct_via(&Channel::Direct(&connector), field, options)
            .await
    }

    pub async fn find_and_modify(
        &self,
        options: Value,
        doc: Value,
        args: ModifyArgs,
    ) -> Result<Option<Instance>> {
        let connector = self.connector()?;
        self.find_and_modify_via(&Channel::Direct(&connector), options, doc, args)
            .await
    }

    /// Update the record with the given id, or create it when absent.
    pub async fn upsert(&self, id: impl Into<Value>, doc: Value) -> Result<Instance> {
        let connector = self.connector()?;
        self.upsert_via(&Channel::Direct(&connector), id.into(), doc)
            .await
    }

    // -------------------------------------------------------------------------
    // Channel-parameterized implementations (shared with ScopedModel)
    // -------------------------------------------------------------------------

    pub(crate) async fn create_via(
        &self,
        channel: &Channel<'_>,
        values: Value,
    ) -> Result<Instance> {
        self.guard(channel, Action::Create, Operation::Create)?;
        let instance = self.instance(values.clone(), false)?;
        let mut payload = instance.to_payload();
        let pk_column = channel.primary_key_column(self);
        if let Some(id) = values.get(&pk_column) {
            if let Some(map) = payload.as_object_mut() {
                map.insert(pk_column, id.clone());
            }
        }
        channel.create(self, payload).await
    }

    pub(crate) async fn create_many_via(
        &self,
        channel: &Channel<'_>,
        values: Vec<Value>,
    ) -> Result<Collection> {
        self.guard(channel, Action::Create, Operation::CreateMany)?;
        let mut payloads = Vec::with_capacity(values.len());
        for value in values {
            payloads.push(self.instance(value, false)?.to_payload());
        }
        channel.create_many(self, payloads).await
    }

    pub(crate) async fn save_via(
        &self,
        channel: &Channel<'_>,
        instance: &mut Instance,
    ) -> Result<()> {
        if instance.is_deleted() {
            return Err(OrmError::AlreadyDeleted);
        }
        self.guard(channel, Action::Update, Operation::Save)?;
        if !instance.is_unsaved() {
            return Ok(());
        }
        channel.save(self, instance).await?;
        instance.clear_dirty();
        instance.notify_save();
        Ok(())
    }

    pub(crate) async fn remove_via(
        &self,
        channel: &Channel<'_>,
        instance: &mut Instance,
    ) -> Result<()> {
        if instance.is_deleted() {
            return Err(OrmError::AlreadyDeleted);
        }
        self.guard(channel, Action::Delete, Operation::Delete)?;
        channel.delete(self, instance).await?;
        instance.mark_deleted();
        instance.notify_delete();
        Ok(())
    }

    pub(crate) async fn remove_by_id_via(
        &self,
        channel: &Channel<'_>,
        id: Value,
    ) -> Result<Instance> {
        match self.find_one_via(channel, id.clone()).await? {
            Some(mut instance) => {
                self.remove_via(channel, &mut instance).await?;
                Ok(instance)
            }
            None => Err(OrmError::message(format!(
                "trying to remove, couldn't find record with primary key: {} for {}",
                value_string(&id),
                self.name
            ))),
        }
    }

    pub(crate) async fn remove_all_via(&self, channel: &Channel<'_>) -> Result<u64> {
        self.guard(channel, Action::DeleteAll, Operation::DeleteAll)?;
        channel.delete_all(self).await
    }

    pub(crate) async fn query_via(
        &self,
        channel: &Channel<'_>,
        options: Value,
    ) -> Result<QueryResult> {
        self.guard(channel, Action::Query, Operation::Query)?;
        let prepared = query::prepare_query_options(
            options,
            self.default_query_options.as_ref(),
            channel.connector().translate_where_regex(),
        )?;
        let collection = channel.query(self, &prepared).await?;
        if prepared.limit == 1 {
            Ok(QueryResult::One(collection.into_iter().next()))
        } else {
            Ok(QueryResult::Many(collection))
        }
    }

    pub(crate) async fn find_via(&self, channel: &Channel<'_>, arg: FindArg) -> Result<QueryResult> {
        match arg {
            FindArg::All => Ok(QueryResult::Many(self.find_all_via(channel).await?)),
            FindArg::Query(options) => self.query_via(channel, options).await,
            FindArg::Id(id) => Ok(QueryResult::One(self.find_one_via(channel, id).await?)),
        }
    }

    pub(crate) async fn find_all_via(&self, channel: &Channel<'_>) -> Result<Collection> {
        self.guard(channel, Action::FindAll, Operation::FindAll)?;
        channel.find_all(self).await
    }

    pub(crate) async fn find_one_via(
        &self,
        channel: &Channel<'_>,
        id: Value,
    ) -> Result<Option<Instance>> {
        self.guard(channel, Action::FindOne, Operation::FindOne)?;
        channel.find_one(self, &id).await
    }

    pub(crate) async fn count_via(&self, channel: &Channel<'_>, options: Value) -> Result<u64> {
        self.guard(channel, Action::Count, Operation::Count)?;
        let prepared = query::prepare_query_options(
            options,
            self.default_query_options.as_ref(),
            channel.connector().translate_where_regex(),
        )?;
        channel.count(self, &prepared).await
    }

    pub(crate) async fn distinct_via(
        &self,
        channel: &Channel<'_>,
        field: &str,
        options: Value,
    ) -> Result<Collection> {
        self.guard(channel, Action::Distinct, Operation::Distinct)?;
        let prepared = query::prepare_query_options(
            options,
            self.default_query_options.as_ref(),
            channel.connector().translate_where_regex(),
        )?;
        channel.distinct(self, field, &prepared).await
    }

    pub(crate) async fn find_and_modify_via(
        &self,
        channel: &Channel<'_>,
        options: Value,
        doc: Value,
        args: ModifyArgs,
    ) -> Result<Option<Instance>> {
        self.guard(channel, Action::FindAndUpdate, Operation::FindAndModify)?;
        let prepared = query::prepare_query_options(
            options,
            self.default_query_options.as_ref(),
            channel.connector().translate_where_regex(),
        )?;
        channel.find_and_modify(self, &prepared, doc, &args).await
    }

    pub(crate) async fn upsert_via(
        &self,
        channel: &Channel<'_>,
        id: Value,
        doc: Value,
    ) -> Result<Instance> {
        self.guard(channel, Action::Upsert, Operation::Upsert)?;
        let instance = self.instance(doc.clone(), false)?;
        let mut payload = instance.to_payload();
        let pk_column = channel.primary_key_column(self);
        if let Some(existing) = doc.get(&pk_column) {
            if let Some(map) = payload.as_object_mut() {
                map.insert(pk_column, existing.clone());
            }
        }
        channel.upsert(self, id, payload).await
    }
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("name", &self.name)
            .field("fields", &self.fields.keys().collect::<Vec<_>>())
            .field("actions", &self.actions)
            .field("parent", &self.parent)
            .finish_non_exhaustive()
    }
}

fn build_remap(fields: &BTreeMap<String, FieldSchema>) -> HashMap<String, String> {
    let mut remap = HashMap::new();
    for (key, field) in fields {
        if let Some(wire) = &field.name {
            if wire != key {
                remap.insert(wire.clone(), key.clone());
            }
        }
    }
    remap
}

fn extend_or_reduce(
    parent: &Model,
    name: String,
    definition: ModelDefinition,
    extend: bool,
) -> Result<Arc<Model>> {
    let ModelDefinition {
        fields: field_defs,
        connector,
        metadata,
        mappings: def_mappings,
        actions,
        singular,
        plural,
        autogen: _,
        default_query_options,
        serialize,
        deserialize,
        members: def_members,
    } = definition;

    let metadata = merged(
        &parent.metadata(),
        &metadata.unwrap_or_else(|| Value::Object(Map::new())),
    );

    let mut mappings = parent.mappings.clone();
    for (key, mapping) in def_mappings {
        let existing = mappings.remove(&key).unwrap_or_default();
        mappings.insert(
            key,
            FieldMapping {
                get: mapping.get.or(existing.get),
                set: mapping.set.or(existing.set),
            },
        );
    }

    let mut members = parent.members.clone();
    for (key, member) in def_members {
        members.insert(key, member);
    }

    let fields = if field_defs.is_empty() {
        parent.fields.clone()
    } else if extend {
        let mut fields = parent.fields.clone();
        for (key, def) in &field_defs {
            let schema = match parent.fields.get(key) {
                Some(inherited) => inherited.apply(def),
                None => FieldSchema::from_definition(key, def)?,
            };
            fields.insert(key.clone(), schema);
        }
        // A child field renamed onto an existing parent key wins: the
        // colliding parent entry is dropped.
        for (key, def) in &field_defs {
            if let Some(wire) = &def.name {
                if wire != key && parent.fields.contains_key(wire) {
                    fields.remove(wire);
                }
            }
        }
        fields
    } else {
        let mut fields = BTreeMap::new();
        for (key, def) in &field_defs {
            let schema = match parent.fields.get(key) {
                Some(inherited) => inherited.apply(def),
                None => FieldSchema::from_definition(key, def)?,
            };
            fields.insert(key.clone(), schema);
        }
        fields
    };

    let connector = connector.or_else(|| parent.connector_opt());
    let actions = actions.unwrap_or_else(|| parent.actions.clone());

    let lower = name.to_lowercase();
    let singular = singular.unwrap_or_else(|| pluralizer::pluralize(&lower, 1, false));
    let plural = plural.unwrap_or_else(|| pluralizer::pluralize(&lower, 2, false));
    let field_remap = build_remap(&fields);

    let model = Arc::new_cyclic(|weak| Model {
        self_ref: weak.clone(),
        name,
        singular,
        plural,
        autogen: parent.autogen,
        fields,
        field_remap,
        mappings,
        metadata: RwLock::new(metadata),
        actions,
        members,
        default_query_options: default_query_options
            .or_else(|| parent.default_query_options.clone()),
        serialize: serialize.or_else(|| parent.serialize.clone()),
        deserialize: deserialize.or_else(|| parent.deserialize.clone()),
        connector: RwLock::new(connector),
        parent: Some(parent.name.clone()),
    });
    Registry::global().register_model(&model);
    Ok(model)
}

// Coerce a translated payload value to its declared field type. Unlike
// instance validation this never fails: an uncoercible value passes
// through unchanged.
fn coerce_payload_value(field_type: FieldType, value: Value) -> Value {
    match (field_type, &value) {
        (FieldType::Number, Value::String(s)) => match s.trim().parse::<i64>() {
            Ok(i) => Value::Number(i.into()),
            Err(_) => value,
        },
        (FieldType::Boolean, Value::String(s)) => {
            let truthy = matches!(s.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "ok");
            Value::Bool(truthy)
        }
        (FieldType::Date, Value::String(s)) => match parse_date(s) {
            Some(dt) => Value::String(dt.to_rfc3339()),
            None => value,
        },
        _ => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::FieldDefinition;
    use serde_json::json;

    fn unique(name: &str) -> String {
        use std::sync::atomic::{AtomicU64, Ordering};
        static N: AtomicU64 = AtomicU64::new(0);
        format!("{}_{}", name, N.fetch_add(1, Ordering::Relaxed))
    }

    fn person_definition() -> ModelDefinition {
        ModelDefinition::new()
            .field("name", FieldDefinition::new(FieldType::String).required())
            .field(
                "age",
                FieldDefinition::new(FieldType::Number).default_value(10),
            )
    }

    // =========================================================================
    // Definition Tests
    // =========================================================================

    #[test]
    fn test_define_basic_model() {
        let model = Model::define(unique("person"), person_definition()).unwrap();
        assert_eq!(model.fields().len(), 2);
        assert!(model.fields()["name"].required);
        assert_eq!(model.actions().len(), Action::ALL.len());
        assert!(model.autogen());
    }

    #[test]
    fn test_define_rejects_reserved_id_field() {
        let err = Model::define(
            unique("bad"),
            ModelDefinition::new().field("id", FieldDefinition::new(FieldType::Number)),
        )
        .unwrap_err();
        assert_eq!(err.field(), Some("id"));
        assert!(err.to_string().contains("reserved field name"));
    }

    #[test]
    fn test_unknown_action_is_rejected() {
        let err = ModelDefinition::new()
            .actions_from(["create", "explode"])
            .unwrap_err();
        assert!(err.to_string().contains("actions must include only"));
    }

    #[test]
    fn test_actions_from_wire_names() {
        let def = ModelDefinition::new()
            .actions_from(["create", "findAll", "deleteAll"])
            .unwrap();
        assert_eq!(
            def.actions,
            Some(vec![Action::Create, Action::FindAll, Action::DeleteAll])
        );
    }

    #[test]
    fn test_singular_plural_derivation() {
        let model = Model::define(unique("Company"), ModelDefinition::new()).unwrap();
        assert!(model.singular().starts_with("company"));
        assert!(model.plural().starts_with("compan"));
    }

    #[test]
    fn test_model_registers_globally() {
        let name = unique("registered");
        let _model = Model::define(name.clone(), ModelDefinition::new()).unwrap();
        assert!(Registry::global().model(&name).is_some());
    }

    // =========================================================================
    // Extension Algebra Tests
    // =========================================================================

    #[test]
    fn test_extend_merges_fields() {
        let parent = Model::define(
            unique("parent"),
            person_definition().metadata(json!({"note": "base"})),
        )
        .unwrap();
        let child = parent
            .extend(
                unique("child"),
                ModelDefinition::new()
                    .field("email", FieldDefinition::new(FieldType::String))
                    .field("age", FieldDefinition::default().default_value(21)),
            )
            .unwrap();

        assert_eq!(child.fields().len(), 3);
        // Re-declared field merges onto the parent's definition.
        assert_eq!(child.fields()["age"].field_type, FieldType::Number);
        assert_eq!(child.fields()["age"].default, Some(json!(21)));
        assert_eq!(child.meta_get("note"), Some(json!("base")));
        assert_eq!(child.parent(), Some(parent.name()));
    }

    #[test]
    fn test_extend_rename_drops_colliding_parent_field() {
        let parent = Model::define(
            unique("parent"),
            ModelDefinition::new()
                .field("first", FieldDefinition::new(FieldType::String))
                .field("last", FieldDefinition::new(FieldType::String)),
        )
        .unwrap();
        let child = parent
            .extend(
                unique("child"),
                ModelDefinition::new()
                    .field("full", FieldDefinition::new(FieldType::String).name("last")),
            )
            .unwrap();

        assert!(child.fields().contains_key("full"));
        assert!(child.fields().contains_key("first"));
        // The renamed child field collides with the parent's "last".
        assert!(!child.fields().contains_key("last"));
    }

    #[test]
    fn test_reduce_keeps_only_declared_fields() {
        let parent = Model::define(unique("parent"), person_definition()).unwrap();
        let child = parent
            .reduce(
                unique("small"),
                ModelDefinition::new().field("name", FieldDefinition::default()),
            )
            .unwrap();

        assert_eq!(child.fields().len(), 1);
        // The surviving field pulls its authoritative definition from the
        // parent.
        assert!(child.fields()["name"].required);
        assert_eq!(child.fields()["name"].field_type, FieldType::String);
    }

    #[test]
    fn test_extend_without_fields_clones_parent_fields() {
        let parent = Model::define(unique("parent"), person_definition()).unwrap();
        let child = parent.extend(unique("clone"), ModelDefinition::new()).unwrap();
        assert_eq!(child.fields().len(), parent.fields().len());
    }

    // =========================================================================
    // Payload Translation Tests
    // =========================================================================

    #[test]
    fn test_translate_keys_for_payload() {
        let model = Model::define(
            unique("thing"),
            ModelDefinition::new()
                .field(
                    "name",
                    FieldDefinition::new(FieldType::String).name("thename"),
                )
                .field("count", FieldDefinition::new(FieldType::Number)),
        )
        .unwrap();

        let translated = model.translate_keys_for_payload(json!({"name": 1}));
        assert_eq!(translated, json!({"thename": 1}));

        let translated = model.translate_keys_for_payload(json!({"count": "5", "other": true}));
        assert_eq!(translated, json!({"count": 5, "other": true}));
    }

    #[test]
    fn test_payload_keys_use_wire_names() {
        let model = Model::define(
            unique("thing"),
            ModelDefinition::new()
                .field(
                    "name",
                    FieldDefinition::new(FieldType::String).name("thename"),
                )
                .field("virtual", FieldDefinition::new(FieldType::String).custom()),
        )
        .unwrap();
        assert_eq!(model.payload_keys(), vec!["thename".to_string()]);
    }

    // =========================================================================
    // Custom Member Tests
    // =========================================================================

    #[test]
    fn test_custom_method_invocation() {
        let model = Model::define(
            unique("greeter"),
            ModelDefinition::new()
                .member("kind", "friendly")
                .method("greet", |model, _instance, args| {
                    Ok(json!(format!(
                        "hello from {} with {}",
                        model.name(),
                        args["who"].as_str().unwrap_or("?")
                    )))
                }),
        )
        .unwrap();

        let out = model
            .invoke_method("greet", None, json!({"who": "tests"}))
            .unwrap();
        assert!(out.as_str().unwrap().contains("with tests"));

        assert!(matches!(
            model.member("kind"),
            Some(CustomMember::Value(v)) if v == "friendly"
        ));
        assert!(model.invoke_method("kind", None, Value::Null).is_err());
        assert!(model.invoke_method("missing", None, Value::Null).is_err());
    }

    #[test]
    fn test_related_model_resolves_lazily() {
        let author_name = unique("author");
        // The post links to the author before the author model exists.
        let post = Model::define(
            unique("post"),
            ModelDefinition::new().field(
                "author",
                FieldDefinition::new(FieldType::Object).model(author_name.clone()),
            ),
        )
        .unwrap();
        assert!(post.related_model("author").is_none());

        let _author = Model::define(author_name.clone(), ModelDefinition::new()).unwrap();
        let resolved = post.related_model("author").unwrap();
        assert_eq!(resolved.name(), author_name);
    }

    #[test]
    fn test_find_arg_conversions() {
        assert!(matches!(FindArg::from(()), FindArg::All));
        assert!(matches!(FindArg::from(json!({"a": 1})), FindArg::Query(_)));
        assert!(matches!(FindArg::from(json!(7)), FindArg::Id(_)));
        assert!(matches!(FindArg::from("key"), FindArg::Id(_)));
    }
}

//! # trellis-orm
//!
//! A schema-driven model and connector ORM layer.
//!
//! Models are defined at runtime from field schemas, instances are
//! materialized from raw records with validation and type coercion, and
//! persistence is delegated to pluggable connector backends.
//!
//! ## Features
//!
//! - **Runtime Schemas**: define models from field maps, extend and reduce
//!   them with deterministic merge rules
//! - **Validated Instances**: type coercion, length constraints, custom
//!   validators, dirty tracking, and change observers
//! - **Field Remapping**: expose a field under one name while storing it
//!   under another, with get/set transforms on both paths
//! - **Pluggable Connectors**: a minimal backend implements `query`,
//!   `create`, `save`, `delete`, and `delete_all`; `find_and_modify`,
//!   `distinct`, `count`, and `upsert` come for free
//! - **Connect On Demand**: the first operation against a connector runs
//!   its metadata/config/schema lifecycle exactly once
//! - **Request Scoping**: per-request façades inject login gating, request
//!   hooks, and tracing without mutating shared connectors
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use serde_json::json;
//! use trellis_orm::{FieldDefinition, FieldType, MemoryBackend, Model, ModelDefinition};
//!
//! # async fn demo() -> trellis_orm::Result<()> {
//! let connector = MemoryBackend::connector()?;
//!
//! let users = Model::define(
//!     "user",
//!     ModelDefinition::new()
//!         .field("name", FieldDefinition::new(FieldType::String).required())
//!         .field("age", FieldDefinition::new(FieldType::Number).default_value(10))
//!         .connector(connector),
//! )?;
//!
//! let user = users.create(json!({"name": "jeff"})).await?;
//! assert_eq!(user.get("age")?, json!(10));
//!
//! let found = users.find(json!({"name": "jeff"})).await?;
//! assert_eq!(found.len(), 1);
//! # Ok(())
//! # }
//! ```
//!
//! ## Query Options
//!
//! Queries accept a loosely-typed options object: `where` (or bare
//! field/value shorthand), `sel`/`unsel` projections as comma-separated
//! strings or objects, and `page`/`per_page`/`skip`/`limit` in any
//! consistent combination. Options are normalized once, up front, before
//! reaching a connector.

pub mod collection;
pub mod connector;
pub mod error;
pub mod field;
pub mod instance;
pub mod memory;
mod merge;
pub mod model;
pub mod query;
pub mod registry;
pub mod scope;

pub use collection::Collection;
pub use connector::{
    ConfigField, ConfigValidator, Connector, ConnectorBackend, ConnectorMetadata, ModifyArgs,
    Operation,
};
pub use error::{OrmError, Result, ValidationError};
pub use field::{
    FieldDefinition, FieldMapping, FieldSchema, FieldTransform, FieldType, Validator, ValidatorFn,
};
pub use instance::{Instance, InstanceObserver, PRIMARY_KEY};
pub use memory::MemoryBackend;
pub use model::{
    Action, CustomMember, FindArg, Model, ModelDefinition, ModelMethodFn, QueryResult,
    SerializeHook,
};
pub use query::{DEFAULT_LIMIT, QueryOptions, like_to_regex, prepare_query_options};
pub use registry::Registry;
pub use scope::{RequestContext, RequestScope, ScopedModel};

//! Request-scoped connector access
//!
//! Connectors are process-wide singletons, but login/session state is
//! per-request. A [`RequestScope`] reconciles the two lifetimes: it wraps
//! a shared connector for the duration of one request, running the
//! connector's request hooks and login gating around every call without
//! mutating the shared instance. [`ScopedModel`] is the matching
//! request-scoped view of a model.

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use tracing::Instrument;
use uuid::Uuid;

use crate::collection::Collection;
use crate::connector::{Connector, ModifyArgs};
use crate::error::{OrmError, Result};
use crate::instance::Instance;
use crate::model::{Channel, FindArg, Model, QueryResult};
use crate::query::QueryOptions;

/// The request/response pair a scope operates on behalf of.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub id: Uuid,
    pub request: Value,
    pub response: Value,
}

impl RequestContext {
    pub fn new(request: Value, response: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            request,
            response,
        }
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new(Value::Null, Value::Null)
    }
}

/// Per-request façade over a shared connector.
///
/// Every operation runs, strictly in order: the connector's
/// `start_request` hook, the `login_required` check (logging in when
/// required, failing when required but unavailable), the real method, and
/// the `end_request` hook. The first failing step aborts the rest. Each
/// call is wrapped in a `connector_request` trace span recording the
/// connector and method names.
pub struct RequestScope {
    ctx: RequestContext,
    connector: Arc<Connector>,
}

impl RequestScope {
    pub fn new(ctx: RequestContext, connector: Arc<Connector>) -> Self {
        Self { ctx, connector }
    }

    pub fn context(&self) -> &RequestContext {
        &self.ctx
    }

    pub fn connector(&self) -> &Arc<Connector> {
        &self.connector
    }

    /// Log in through the façade, threading the current request context
    /// into the backend. A backend without a login hook is a no-op
    /// success.
    pub async fn login(&self) -> Result<()> {
        let backend = self.connector.backend();
        if backend.has_login() {
            backend.login(&self.ctx).await
        } else {
            Ok(())
        }
    }

    async fn intercept<T, F, Fut>(&self, method: &'static str, call: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let span = tracing::info_span!(
            "connector_request",
            connector = %self.connector.name(),
            method = method,
            request = %self.ctx.id,
        );
        let result = async {
            let backend = self.connector.backend();
            backend.start_request(method, &self.ctx).await?;
            if backend.login_required(&self.ctx).await? {
                if !backend.has_login() {
                    return Err(OrmError::message(
                        "login required but no login method defined in the connector",
                    ));
                }
                backend.login(&self.ctx).await?;
            }
            let result = call().await?;
            backend.end_request(method, &self.ctx).await?;
            Ok(result)
        }
        .instrument(span.clone())
        .await;

        match &result {
            Ok(_) => tracing::debug!(parent: &span, "request complete"),
            Err(e) => tracing::debug!(parent: &span, error = %e, "request failed"),
        }
        result
    }

    pub async fn create(&self, model: &Model, payload: Value) -> Result<Instance> {
        self.intercept("create", || self.connector.create(model, payload))
            .await
    }

    pub async fn create_many(&self, model: &Model, payloads: Vec<Value>) -> Result<Collection> {
        self.intercept("createMany", || self.connector.create_many(model, payloads))
            .await
    }

    pub async fn save(&self, model: &Model, instance: &Instance) -> Result<()> {
        self.intercept("save", || self.connector.save(model, instance))
            .await
    }

    pub async fn delete(&self, model: &Model, instance: &Instance) -> Result<()> {
        self.intercept("delete", || self.connector.delete(model, instance))
            .await
    }

    pub async fn delete_all(&self, model: &Model) -> Result<u64> {
        self.intercept("deleteAll", || self.connector.delete_all(model))
            .await
    }

    pub async fn query(&self, model: &Model, options: &QueryOptions) -> Result<Collection> {
        self.intercept("query", || self.connector.query(model, options))
            .await
    }

    pub async fn find_all(&self, model: &Model) -> Result<Collection> {
        self.intercept("findAll", || self.connector.find_all(model))
            .await
    }

    pub async fn find_one(&self, model: &Model, id: &Value) -> Result<Option<Instance>> {
        self.intercept("findOne", || self.connector.find_one(model, id))
            .await
    }

    pub async fn find_and_modify(
        &self,
        model: &Model,
        options: &QueryOptions,
        doc: Value,
        args: &ModifyArgs,
    ) -> Result<Option<Instance>> {
        self.intercept("findAndModify", || {
            self.connector.find_and_modify(model, options, doc, args)
        })
        .await
    }

    pub async fn distinct(
        &self,
        model: &Model,
        field: &str,
        options: &QueryOptions,
    ) -> Result<Collection> {
        self.intercept("distinct", || self.connector.distinct(model, field, options))
            .await
    }

    pub async fn count(&self, model: &Model, options: &QueryOptions) -> Result<u64> {
        self.intercept("count", || self.connector.count(model, options))
            .await
    }

    pub async fn upsert(&self, model: &Model, id: Value, document: Value) -> Result<Instance> {
        self.intercept("upsert", || self.connector.upsert(model, id, document))
            .await
    }
}

/// Request-scoped view of a model: the same operation surface, routed
/// through a [`RequestScope`] and wrapped in `model_request` trace spans.
pub struct ScopedModel {
    model: Arc<Model>,
    scope: Arc<RequestScope>,
}

impl ScopedModel {
    pub fn new(model: Arc<Model>, scope: Arc<RequestScope>) -> Self {
        Self { model, scope }
    }

    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    pub fn scope(&self) -> &Arc<RequestScope> {
        &self.scope
    }

    pub fn context(&self) -> &RequestContext {
        self.scope.context()
    }

    pub async fn login(&self) -> Result<()> {
        self.scope.login().await
    }

    fn span(&self, op: &'static str) -> tracing::Span {
        tracing::info_span!("model_request", model = %self.model.name(), op = op)
    }

    pub async fn create(&self, values: Value) -> Result<Instance> {
        self.model
            .create_via(&Channel::Scoped(&self.scope), values)
            .instrument(self.span("create"))
            .await
    }

    pub async fn create_many(&self, values: Vec<Value>) -> Result<Collection> {
        self.model
            .create_many_via(&Channel::Scoped(&self.scope), values)
            .instrument(self.span("createMany"))
            .await
    }

    pub async fn save(&self, instance: &mut Instance) -> Result<()> {
        self.model
            .save_via(&Channel::Scoped(&self.scope), instance)
            .instrument(self.span("save"))
            .await
    }

    pub async fn remove(&self, instance: &mut Instance) -> Result<()> {
        self.model
            .remove_via(&Channel::Scoped(&self.scope), instance)
            .instrument(self.span("delete"))
            .await
    }

    pub async fn remove_by_id(&self, id: impl Into<Value>) -> Result<Instance> {
        self.model
            .remove_by_id_via(&Channel::Scoped(&self.scope), id.into())
            .instrument(self.span("delete"))
            .await
    }

    pub async fn remove_all(&self) -> Result<u64> {
        self.model
            .remove_all_via(&Channel::Scoped(&self.scope))
            .instrument(self.span("deleteAll"))
            .await
    }

    pub async fn query(&self, options: Value) -> Result<QueryResult> {
        self.model
            .query_via(&Channel::Scoped(&self.scope), options)
            .instrument(self.span("query"))
            .await
    }

    pub async fn find(&self, arg: impl Into<FindArg>) -> Result<QueryResult> {
        self.model
            .find_via(&Channel::Scoped(&self.scope), arg.into())
            .instrument(self.span("find"))
            .await
    }

    pub async fn find_all(&self) -> Result<Collection> {
        self.model
            .find_all_via(&Channel::Scoped(&self.scope))
            .instrument(self.span("findAll"))
            .await
    }

    pub async fn find_one(&self, id: impl Into<Value>) -> Result<Option<Instance>> {
        self.model
            .find_one_via(&Channel::Scoped(&self.scope), id.into())
            .instrument(self.span("findOne"))
            .await
    }

    pub async fn count(&self, options: Value) -> Result<u64> {
        self.model
            .count_via(&Channel::Scoped(&self.scope), options)
            .instrument(self.span("count"))
            .await
    }

    pub async fn distinct(&self, field: &str, options: Value) -> Result<Collection> {
        self.model
            .distinct_via(&Channel::Scoped(&self.scope), field, options)
            .instrument(self.span("distinct"))
            .await
    }

    pub async fn find_and_modify(
        &self,
        options: Value,
        doc: Value,
        args: ModifyArgs,
    ) -> Result<Option<Instance>> {
        self.model
            .find_and_modify_via(&Channel::Scoped(&self.scope), options, doc, args)
            .instrument(self.span("findAndModify"))
            .await
    }

    pub async fn upsert(&self, id: impl Into<Value>, doc: Value) -> Result<Instance> {
        self.model
            .upsert_via(&Channel::Scoped(&self.scope), id.into(), doc)
            .instrument(self.span("upsert"))
            .await
    }

    /// Invoke a custom model method inside a trace span.
    pub fn call_method(&self, name: &str, args: Value) -> Result<Value> {
        let span = tracing::info_span!("model_request", model = %self.model.name(), op = name);
        let _enter = span.enter();
        self.model.invoke_method(name, None, args)
    }
}

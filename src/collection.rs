//! Collection of model instances
//!
//! An ordered container of [`Instance`]s tied to a model, used for
//! multi-record results from `query`/`find_all` style operations.

use std::ops::Deref;

use serde_json::Value;

use crate::instance::Instance;

/// Ordered holder of model instances.
#[derive(Debug, Default)]
pub struct Collection {
    model: Option<String>,
    items: Vec<Instance>,
}

impl Collection {
    /// Create a collection tied to a model name.
    pub fn new(model: impl Into<String>, items: Vec<Instance>) -> Self {
        Self {
            model: Some(model.into()),
            items,
        }
    }

    /// Create a collection from instances alone.
    pub fn from_instances(items: Vec<Instance>) -> Self {
        Self { model: None, items }
    }

    /// The model name this collection is tied to, if any.
    pub fn model_name(&self) -> Option<&str> {
        self.model.as_deref()
    }

    /// Append an instance.
    pub fn add(&mut self, instance: Instance) {
        self.items.push(instance);
    }

    /// The instance at `idx`, or `None` when out of bounds.
    pub fn get(&self, idx: usize) -> Option<&Instance> {
        self.items.get(idx)
    }

    /// Mutable access to the instance at `idx`.
    pub fn get_mut(&mut self, idx: usize) -> Option<&mut Instance> {
        self.items.get_mut(idx)
    }

    /// JSON projection of every instance, in order.
    pub fn to_json(&self) -> Value {
        Value::Array(self.items.iter().map(Instance::to_json).collect())
    }

    /// Consume the collection, returning the underlying instances.
    pub fn into_inner(self) -> Vec<Instance> {
        self.items
    }
}

impl Deref for Collection {
    type Target = [Instance];

    fn deref(&self) -> &Self::Target {
        &self.items
    }
}

impl From<Vec<Instance>> for Collection {
    fn from(items: Vec<Instance>) -> Self {
        Self::from_instances(items)
    }
}

impl IntoIterator for Collection {
    type Item = Instance;
    type IntoIter = std::vec::IntoIter<Instance>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl<'a> IntoIterator for &'a Collection {
    type Item = &'a Instance;
    type IntoIter = std::slice::Iter<'a, Instance>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

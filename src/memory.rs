//! In-memory reference backend
//!
//! Stores records in per-model tables behind a mutex, with an atomic
//! primary-key counter. Supports field-equality where clauses plus a
//! small operator set (`$regex`, `$not`, `$ne`, `$gt`, `$gte`, `$lt`,
//! `$lte`, `$in`), ordering, skip/limit, and `sel`/`unsel` projection.
//! Declares `translate_where_regex`, so `$like` patterns arrive already
//! translated to `$regex`.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, Value, json};

use crate::collection::Collection;
use crate::connector::{Connector, ConnectorBackend};
use crate::error::{OrmError, Result};
use crate::instance::Instance;
use crate::model::Model;
use crate::query::{QueryOptions, value_string};

#[derive(Debug, Clone)]
struct MemoryRow {
    pk: Value,
    values: BTreeMap<String, Value>,
}

/// In-memory storage backend.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    tables: Mutex<HashMap<String, Vec<MemoryRow>>>,
    counter: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh memory backend as a connector.
    pub fn connector() -> Result<Arc<Connector>> {
        Connector::new(Arc::new(Self::new()), json!({}))
    }

    fn next_key(&self) -> Value {
        Value::from(self.counter.fetch_add(1, AtomicOrdering::SeqCst) + 1)
    }

    fn with_table<T>(&self, model: &Model, f: impl FnOnce(&mut Vec<MemoryRow>) -> T) -> T {
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        f(tables.entry(model.name().to_string()).or_default())
    }
}

#[async_trait]
impl ConnectorBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    fn description(&self) -> Option<&str> {
        Some("in-memory reference backend")
    }

    fn translate_where_regex(&self) -> bool {
        true
    }

    async fn create(&self, model: &Model, payload: Value) -> Result<Instance> {
        let pk_column = self.primary_key_column(model);
        let pk = match payload.get(&pk_column) {
            Some(id) if !id.is_null() => id.clone(),
            _ => self.next_key(),
        };
        let mut instance = model.instance(payload, false)?;
        instance.set_primary_key(pk.clone());
        self.with_table(model, |table| {
            table.push(MemoryRow {
                pk,
                values: instance.raw_values(),
            });
        });
        Ok(instance)
    }

    async fn save(&self, model: &Model, instance: &Instance) -> Result<()> {
        let pk = instance
            .primary_key()
            .ok_or_else(|| OrmError::message("cannot save an instance without a primary key"))?;
        self.with_table(model, |table| {
            if let Some(row) = table.iter_mut().find(|row| keys_equal(&row.pk, &pk)) {
                row.values = instance.raw_values();
            }
        });
        Ok(())
    }

    async fn delete(&self, model: &Model, instance: &Instance) -> Result<()> {
        let pk = instance
            .primary_key()
            .ok_or_else(|| OrmError::message("cannot delete an instance without a primary key"))?;
        self.with_table(model, |table| {
            table.retain(|row| !keys_equal(&row.pk, &pk));
        });
        Ok(())
    }

    async fn delete_all(&self, model: &Model) -> Result<u64> {
        Ok(self.with_table(model, |table| {
            let count = table.len() as u64;
            table.clear();
            count
        }))
    }

    async fn query(&self, model: &Model, options: &QueryOptions) -> Result<Collection> {
        let mut rows: Vec<MemoryRow> = self.with_table(model, |table| {
            table
                .iter()
                .filter(|row| matches_where(options.where_clause.as_ref(), row))
                .cloned()
                .collect()
        });

        if let Some(Value::Object(order)) = &options.order {
            rows.sort_by(|a, b| {
                for (field, direction) in order {
                    let ord = compare_values(&row_value(a, field), &row_value(b, field));
                    if ord != Ordering::Equal {
                        let descending = direction.as_i64().unwrap_or(1) < 0
                            || direction.as_f64().unwrap_or(1.0) < 0.0;
                        return if descending { ord.reverse() } else { ord };
                    }
                }
                Ordering::Equal
            });
        }

        let limit = if options.limit == 0 {
            usize::MAX
        } else {
            options.limit as usize
        };

        let mut out = Collection::new(model.name(), Vec::new());
        for row in rows.into_iter().skip(options.skip as usize).take(limit) {
            let mut values = row.values;
            if let Some(sel) = &options.sel {
                values.retain(|key, _| sel.contains(key));
            }
            if let Some(unsel) = &options.unsel {
                values.retain(|key, _| !unsel.contains(key));
            }
            let map: Map<String, Value> = values.into_iter().collect();
            let mut instance = model.instance(Value::Object(map), true)?;
            instance.set_primary_key(row.pk);
            out.add(instance);
        }
        Ok(out)
    }
}

fn row_value(row: &MemoryRow, field: &str) -> Option<Value> {
    if field == "id" {
        Some(row.pk.clone())
    } else {
        row.values.get(field).cloned()
    }
}

fn matches_where(where_clause: Option<&Value>, row: &MemoryRow) -> bool {
    let Some(Value::Object(conditions)) = where_clause else {
        return true;
    };
    conditions.iter().all(|(key, condition)| {
        let value = row_value(row, key);
        matches_condition(key, value.as_ref(), condition)
    })
}

fn matches_condition(key: &str, value: Option<&Value>, condition: &Value) -> bool {
    match condition {
        Value::Object(ops) if ops.keys().any(|k| k.starts_with('$')) => ops
            .iter()
            .all(|(op, operand)| apply_operator(key, value, op, operand)),
        target => loose_eq(value, target, key == "id"),
    }
}

fn apply_operator(key: &str, value: Option<&Value>, op: &str, operand: &Value) -> bool {
    match op {
        "$regex" => match (value, operand.as_str()) {
            (Some(v), Some(pattern)) => Regex::new(pattern)
                .map(|re| re.is_match(&value_string(v)))
                .unwrap_or(false),
            _ => false,
        },
        "$not" => !matches_condition(key, value, operand),
        "$ne" => !loose_eq(value, operand, key == "id"),
        "$gt" => compare_optional(value, operand) == Some(Ordering::Greater),
        "$gte" => matches!(
            compare_optional(value, operand),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        "$lt" => compare_optional(value, operand) == Some(Ordering::Less),
        "$lte" => matches!(
            compare_optional(value, operand),
            Some(Ordering::Less | Ordering::Equal)
        ),
        "$in" => operand
            .as_array()
            .map(|candidates| candidates.iter().any(|c| loose_eq(value, c, key == "id")))
            .unwrap_or(false),
        _ => false,
    }
}

fn loose_eq(value: Option<&Value>, target: &Value, id_key: bool) -> bool {
    match value {
        None => target.is_null(),
        Some(v) => {
            if v == target {
                return true;
            }
            if let (Some(a), Some(b)) = (v.as_f64(), target.as_f64()) {
                return a == b;
            }
            // Primary keys compare by string form so numeric keys match
            // their string representation.
            id_key && value_string(v) == value_string(target)
        }
    }
}

fn compare_optional(value: Option<&Value>, target: &Value) -> Option<Ordering> {
    value.map(|v| compare_values(&Some(v.clone()), &Some(target.clone())))
}

fn compare_values(a: &Option<Value>, b: &Option<Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => {
            if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
                return x.partial_cmp(&y).unwrap_or(Ordering::Equal);
            }
            value_string(a).cmp(&value_string(b))
        }
    }
}

fn keys_equal(a: &Value, b: &Value) -> bool {
    a == b || value_string(a) == value_string(b)
}

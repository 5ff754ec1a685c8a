//! Query option normalization
//!
//! Reconciles the loosely-typed wire shape accepted by `query`/`find`
//! (page/skip/limit aliases, comma-separated `sel`/`unsel`, JSON-encoded
//! string values, where-clause shorthand) into a canonical [`QueryOptions`],
//! and translates SQL-LIKE operators into regex form for connectors that
//! opt in.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value, json};

use crate::error::{OrmError, Result};
use crate::merge::merged;

/// Option keys understood by the normalizer. Anything else in the options
/// object is treated as a where-clause shorthand.
const RECOGNIZED_OPTIONS: [&str; 9] = [
    "where", "sel", "unsel", "page", "per_page", "order", "skip", "limit", "distinct",
];

/// Default page size when neither `limit` nor `per_page` is given.
pub const DEFAULT_LIMIT: u64 = 10;

/// Canonical, fully-reconciled query options.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOptions {
    /// Filter clause: field/value equality pairs, optionally with
    /// `$`-prefixed operators (`$regex`, `$gt`, ...).
    pub where_clause: Option<Value>,
    /// Fields to include; all others are excluded.
    pub sel: Option<BTreeSet<String>>,
    /// Fields to exclude; all others are included.
    pub unsel: Option<BTreeSet<String>>,
    /// Sort specification: map of field name to 1 (ascending) or -1.
    pub order: Option<Value>,
    /// Page number, starting from 1. Always consistent with `skip`.
    pub page: u64,
    /// Alias of `limit`.
    pub per_page: u64,
    /// Records to skip.
    pub skip: u64,
    /// Maximum records to return.
    pub limit: u64,
    /// Field whose unique values a `count` should count.
    pub distinct: Option<String>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            where_clause: None,
            sel: None,
            unsel: None,
            order: None,
            page: 1,
            per_page: DEFAULT_LIMIT,
            skip: 0,
            limit: DEFAULT_LIMIT,
            distinct: None,
        }
    }
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Options selecting at most `limit` records.
    pub fn with_limit(limit: u64) -> Self {
        Self {
            limit,
            per_page: limit,
            ..Self::default()
        }
    }

    /// Set the where clause.
    pub fn filter(mut self, where_clause: Value) -> Self {
        self.where_clause = Some(where_clause);
        self
    }

    /// Copy of these options with the limit forced to a new value.
    pub fn limited(&self, limit: u64) -> Self {
        let mut out = self.clone();
        out.limit = limit;
        out.per_page = limit;
        out
    }
}

/// Normalize raw query options.
///
/// `defaults` are model-level default options layered underneath the
/// caller's options; `translate_regex` enables `$like`/`$notLike`
/// translation for connectors that declare support.
pub fn prepare_query_options(
    options: Value,
    defaults: Option<&Value>,
    translate_regex: bool,
) -> Result<QueryOptions> {
    let mut map = match options {
        Value::Null => Map::new(),
        Value::Object(m) => m,
        other => {
            return Err(OrmError::invalid_argument(format!(
                "query options must be an object, got: {}",
                other
            )));
        }
    };

    parse_encoded_values(&mut map)?;
    fold_option_casing(&mut map);

    // Bare field/value pairs are shorthand for a where clause.
    let has_recognized = RECOGNIZED_OPTIONS.iter().any(|k| map.contains_key(*k));
    if !has_recognized && !map.is_empty() {
        let mut wrapped = Map::new();
        wrapped.insert("where".to_string(), Value::Object(map));
        map = wrapped;
    }

    if let Some(defaults) = defaults {
        map = match merged(defaults, &Value::Object(map)) {
            Value::Object(m) => m,
            _ => Map::new(),
        };
    }

    let sel = take_selection(&mut map, "sel");
    let unsel = take_selection(&mut map, "unsel");

    // limit and per_page are aliases; limit wins when both are given.
    let limit = numeric_option(map.get("limit"))
        .filter(|n| *n != 0)
        .or_else(|| numeric_option(map.get("per_page")).filter(|n| *n != 0))
        .unwrap_or(DEFAULT_LIMIT);
    let per_page = limit;

    // page and skip are mutually derivable. A given skip of 0 is still a
    // given skip, not an absent one.
    let page_in = if map.contains_key("page") {
        numeric_option(map.get("page"))
    } else {
        None
    };
    let skip_in = if map.contains_key("skip") {
        numeric_option(map.get("skip"))
    } else {
        None
    };
    let (page, skip) = match (page_in, skip_in) {
        (None, Some(skip)) => (skip / limit + 1, skip),
        (Some(page), None) => (page, page.saturating_sub(1) * per_page),
        (None, None) => (1, 0),
        (Some(page), Some(skip)) => (page, skip),
    };

    let mut where_clause = map.remove("where");
    if translate_regex {
        if let Some(wc) = where_clause.as_mut() {
            translate_like_operators(wc);
        }
    }

    let order = map.remove("order");
    let distinct = map
        .remove("distinct")
        .and_then(|v| v.as_str().map(String::from));

    Ok(QueryOptions {
        where_clause,
        sel,
        unsel,
        order,
        page,
        per_page,
        skip,
        limit,
        distinct,
    })
}

// Deep-parse string option values that look like JSON objects. A parse
// failure on `where` is fatal; other options keep their string value.
fn parse_encoded_values(map: &mut Map<String, Value>) -> Result<()> {
    let keys: Vec<String> = map.keys().cloned().collect();
    for key in keys {
        let Some(Value::String(s)) = map.get(&key) else {
            continue;
        };
        if !s.starts_with('{') {
            continue;
        }
        match serde_json::from_str::<Value>(s) {
            Ok(parsed) => {
                map.insert(key, parsed);
            }
            Err(e) if key == "where" => {
                return Err(OrmError::message(format!(
                    "Failed to parse \"where\" as JSON: {}",
                    e
                )));
            }
            Err(_) => {}
        }
    }
    Ok(())
}

// Tolerate unexpected casing on recognized option keys.
fn fold_option_casing(map: &mut Map<String, Value>) {
    let keys: Vec<String> = map.keys().cloned().collect();
    for key in keys {
        let lower = key.to_lowercase();
        if !RECOGNIZED_OPTIONS.contains(&key.as_str())
            && RECOGNIZED_OPTIONS.contains(&lower.as_str())
        {
            if let Some(value) = map.remove(&key) {
                map.insert(lower, value);
            }
        }
    }
}

// Accept a comma-separated string or an object keyed by field name.
fn take_selection(map: &mut Map<String, Value>, key: &str) -> Option<BTreeSet<String>> {
    match map.remove(key)? {
        Value::String(s) => Some(
            s.split(',')
                .map(|f| f.trim().to_string())
                .filter(|f| !f.is_empty())
                .collect(),
        ),
        Value::Object(obj) => Some(obj.keys().cloned().collect()),
        _ => None,
    }
}

fn numeric_option(value: Option<&Value>) -> Option<u64> {
    match value? {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<u64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().filter(|f| *f >= 0.0).map(|f| f as u64))
        }
        _ => None,
    }
}

/// The string form of a value, as used by validators and matchers.
pub(crate) fn value_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

static LIKE_ESCAPED_PERCENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("%{2}").expect("static regex"));
static LIKE_PERCENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(^|[^\\])%").expect("static regex"));
static LIKE_UNDERSCORE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(^|[^\\])_").expect("static regex"));

/// Translate a SQL-LIKE pattern to an anchored regex string: `%` becomes
/// `.*`, `_` becomes `.`, and a literal `%%` escapes to a literal `%`.
pub fn like_to_regex(pattern: &str) -> String {
    let escaped = LIKE_ESCAPED_PERCENT.replace_all(pattern, r"\%");
    let wildcards = LIKE_PERCENT.replace_all(&escaped, "${1}.*");
    let single = LIKE_UNDERSCORE.replace_all(&wildcards, "${1}.");
    format!("^{}$", single)
}

/// Recursively rewrite `$like`/`$notLike` operators inside a where clause
/// into `$regex`/`$not: {$regex}`.
pub fn translate_like_operators(value: &mut Value) {
    let Value::Object(map) = value else {
        return;
    };
    let keys: Vec<String> = map.keys().cloned().collect();
    for key in keys {
        match key.as_str() {
            "$like" => {
                if let Some(val) = map.remove("$like") {
                    map.insert(
                        "$regex".to_string(),
                        Value::String(like_to_regex(&value_string(&val))),
                    );
                }
            }
            "$notLike" => {
                if let Some(val) = map.remove("$notLike") {
                    map.insert(
                        "$not".to_string(),
                        json!({ "$regex": like_to_regex(&value_string(&val)) }),
                    );
                }
            }
            _ => {
                if let Some(nested) = map.get_mut(&key) {
                    match nested {
                        Value::Array(items) => {
                            for item in items.iter_mut().filter(|i| i.is_object()) {
                                translate_like_operators(item);
                            }
                        }
                        Value::Object(_) => translate_like_operators(nested),
                        _ => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prepare(options: Value) -> QueryOptions {
        prepare_query_options(options, None, false).unwrap()
    }

    // =========================================================================
    // Page / Skip / Limit Reconciliation Tests
    // =========================================================================

    #[test]
    fn test_empty_options_get_defaults() {
        let opts = prepare(json!({}));
        assert_eq!(opts.limit, 10);
        assert_eq!(opts.per_page, 10);
        assert_eq!(opts.page, 1);
        assert_eq!(opts.skip, 0);
        assert!(opts.where_clause.is_none());
    }

    #[test]
    fn test_skip_zero_is_preserved() {
        // Regression guard: a falsy check on skip would treat 0 as absent
        // and wrap the options into a where clause.
        let opts = prepare(json!({"skip": 0}));
        assert_eq!(opts.skip, 0);
        assert_eq!(opts.page, 1);
        assert!(opts.where_clause.is_none());
    }

    #[test]
    fn test_page_derives_skip() {
        let opts = prepare(json!({"per_page": 3, "page": 3}));
        assert_eq!(opts.limit, 3);
        assert_eq!(opts.per_page, 3);
        assert_eq!(opts.page, 3);
        assert_eq!(opts.skip, 6);
    }

    #[test]
    fn test_skip_derives_page() {
        let opts = prepare(json!({"skip": 12, "limit": 4}));
        assert_eq!(opts.limit, 4);
        assert_eq!(opts.per_page, 4);
        assert_eq!(opts.page, 4);
        assert_eq!(opts.skip, 12);
    }

    #[test]
    fn test_limit_wins_over_per_page() {
        let opts = prepare(json!({"limit": 5, "per_page": 50}));
        assert_eq!(opts.limit, 5);
        assert_eq!(opts.per_page, 5);
    }

    #[test]
    fn test_numeric_strings_are_coerced() {
        let opts = prepare(json!({"limit": "7", "skip": "14"}));
        assert_eq!(opts.limit, 7);
        assert_eq!(opts.skip, 14);
        assert_eq!(opts.page, 3);
    }

    // =========================================================================
    // Shorthand / Casing / Encoded-Value Tests
    // =========================================================================

    #[test]
    fn test_bare_fields_become_where_clause() {
        let opts = prepare(json!({"name": "jeff", "age": 10}));
        assert_eq!(opts.where_clause, Some(json!({"name": "jeff", "age": 10})));
        assert_eq!(opts.limit, 10);
    }

    #[test]
    fn test_mixed_casing_is_folded() {
        let opts = prepare(json!({"WHERE": {"name": "jeff"}, "Limit": 2}));
        assert_eq!(opts.where_clause, Some(json!({"name": "jeff"})));
        assert_eq!(opts.limit, 2);
    }

    #[test]
    fn test_json_encoded_where_is_parsed() {
        let opts = prepare(json!({"where": "{\"name\":\"jeff\"}"}));
        assert_eq!(opts.where_clause, Some(json!({"name": "jeff"})));
    }

    #[test]
    fn test_bad_json_where_is_fatal() {
        let err = prepare_query_options(json!({"where": "{not json"}), None, false).unwrap_err();
        assert!(err.to_string().contains("Failed to parse \"where\""));
    }

    #[test]
    fn test_bad_json_elsewhere_is_ignored() {
        let opts = prepare(json!({"order": "{not json", "limit": 1}));
        assert_eq!(opts.order, Some(json!("{not json")));
        assert_eq!(opts.limit, 1);
    }

    #[test]
    fn test_sel_csv_and_object_forms() {
        let opts = prepare(json!({"sel": "name, age"}));
        let sel = opts.sel.unwrap();
        assert!(sel.contains("name") && sel.contains("age"));

        let opts = prepare(json!({"unsel": {"password": 1}}));
        assert!(opts.unsel.unwrap().contains("password"));
    }

    #[test]
    fn test_defaults_are_layered_underneath() {
        let defaults = json!({"limit": 25, "where": {"tenant": "a"}});
        let opts =
            prepare_query_options(json!({"where": {"name": "x"}}), Some(&defaults), false).unwrap();
        assert_eq!(opts.limit, 25);
        assert_eq!(opts.where_clause, Some(json!({"tenant": "a", "name": "x"})));
    }

    // =========================================================================
    // LIKE Translation Tests
    // =========================================================================

    #[test]
    fn test_like_to_regex_basic() {
        assert_eq!(like_to_regex("Hello%"), "^Hello.*$");
        assert_eq!(like_to_regex("%world"), "^.*world$");
        assert_eq!(like_to_regex("a_c"), "^a.c$");
    }

    #[test]
    fn test_like_to_regex_escaped_percent() {
        assert_eq!(like_to_regex("100%%"), r"^100\%$");
    }

    #[test]
    fn test_translate_like_in_where() {
        let mut wc = json!({"name": {"$like": "Hello%"}});
        translate_like_operators(&mut wc);
        assert_eq!(wc, json!({"name": {"$regex": "^Hello.*$"}}));
    }

    #[test]
    fn test_translate_not_like_in_where() {
        let mut wc = json!({"name": {"$notLike": "Hello%"}});
        translate_like_operators(&mut wc);
        assert_eq!(wc, json!({"name": {"$not": {"$regex": "^Hello.*$"}}}));
    }

    #[test]
    fn test_translate_recurses_into_arrays() {
        let mut wc = json!({"$or": [{"name": {"$like": "a%"}}, {"name": {"$like": "%b"}}]});
        translate_like_operators(&mut wc);
        assert_eq!(
            wc,
            json!({"$or": [{"name": {"$regex": "^a.*$"}}, {"name": {"$regex": "^.*b$"}}]})
        );
    }

    #[test]
    fn test_translation_only_when_enabled() {
        let raw = json!({"where": {"name": {"$like": "Hello%"}}});
        let off = prepare_query_options(raw.clone(), None, false).unwrap();
        assert_eq!(off.where_clause, Some(json!({"name": {"$like": "Hello%"}})));

        let on = prepare_query_options(raw, None, true).unwrap();
        assert_eq!(on.where_clause, Some(json!({"name": {"$regex": "^Hello.*$"}})));
    }

    #[test]
    fn test_limited_copy() {
        let opts = QueryOptions::with_limit(50).limited(1);
        assert_eq!(opts.limit, 1);
        assert_eq!(opts.per_page, 1);
    }
}

//! # Query & Projection
//!
//! Membership filters over JSON documents, dot-path field access,
//! projections, and sort ordering.

use std::cmp::Ordering;
use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Filter operator for membership predicates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
}

/// One field predicate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldFilter {
    /// Dot-path of the field to test
    pub field: String,
    /// Operator
    pub op: FilterOp,
    /// Value to compare against
    pub value: Value,
}

impl FieldFilter {
    /// Check whether a document satisfies this predicate
    pub fn matches(&self, doc: &Value) -> bool {
        let Some(field_value) = path_value(doc, &self.field) else {
            return false;
        };

        match self.op {
            FilterOp::Eq => field_value == &self.value,
            FilterOp::Neq => field_value != &self.value,
            FilterOp::Gt => compare_numeric(field_value, &self.value, |o| o == Ordering::Greater),
            FilterOp::Gte => compare_numeric(field_value, &self.value, |o| o != Ordering::Less),
            FilterOp::Lt => compare_numeric(field_value, &self.value, |o| o == Ordering::Less),
            FilterOp::Lte => compare_numeric(field_value, &self.value, |o| o != Ordering::Greater),
            FilterOp::In => {
                if let Some(arr) = self.value.as_array() {
                    arr.contains(field_value)
                } else {
                    false
                }
            }
        }
    }
}

fn compare_numeric(a: &Value, b: &Value, pred: impl Fn(Ordering) -> bool) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => a.partial_cmp(&b).is_some_and(&pred),
        _ => false,
    }
}

/// Conjunction of field predicates defining a subscription's result set.
///
/// An empty query matches every document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Query {
    /// Predicates, all of which must hold
    pub filters: Vec<FieldFilter>,
}

impl Query {
    /// Create an empty query (matches everything)
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a predicate
    pub fn with(mut self, field: impl Into<String>, op: FilterOp, value: Value) -> Self {
        self.filters.push(FieldFilter {
            field: field.into(),
            op,
            value,
        });
        self
    }

    /// Check whether a document satisfies every predicate
    pub fn matches(&self, doc: &Value) -> bool {
        self.filters.iter().all(|filter| filter.matches(doc))
    }
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Sort specification for snapshot ordering
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sort {
    /// Dot-path of the field to order by
    pub field: String,
    /// Direction
    pub order: SortOrder,
}

impl Sort {
    /// Ascending sort on a field
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: SortOrder::Asc,
        }
    }

    /// Descending sort on a field
    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: SortOrder::Desc,
        }
    }

    /// Compare two documents under this sort
    pub fn compare(&self, a: &Value, b: &Value) -> Ordering {
        let ordering = compare_values(
            path_value(a, &self.field),
            path_value(b, &self.field),
        );
        match self.order {
            SortOrder::Asc => ordering,
            SortOrder::Desc => ordering.reverse(),
        }
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => {
            if let (Some(a), Some(b)) = (a.as_f64(), b.as_f64()) {
                a.partial_cmp(&b).unwrap_or(Ordering::Equal)
            } else if let (Some(a), Some(b)) = (a.as_str(), b.as_str()) {
                a.cmp(b)
            } else {
                Ordering::Equal
            }
        }
    }
}

/// Resolve a dot-path against a document
pub fn path_value<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

/// Set a value at a dot-path, creating intermediate objects as needed
pub(crate) fn set_path(doc: &mut Value, path: &str, value: Value) {
    let mut current = doc;
    let mut segments = path.split('.').peekable();

    while let Some(segment) = segments.next() {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else {
            return;
        };

        if segments.peek().is_none() {
            map.insert(segment.to_string(), value);
            return;
        }
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

/// Remove a value at a dot-path. Returns true if something was removed.
pub(crate) fn unset_path(doc: &mut Value, path: &str) -> bool {
    let mut current = doc;
    let mut segments = path.split('.').peekable();

    while let Some(segment) = segments.next() {
        let Some(map) = current.as_object_mut() else {
            return false;
        };
        if segments.peek().is_none() {
            return map.remove(segment).is_some();
        }
        match map.get_mut(segment) {
            Some(next) => current = next,
            None => return false,
        }
    }
    false
}

/// Project a document down to a set of dot-path fields.
///
/// The `_id` field is always retained. `None` means no projection: the
/// whole document is returned.
pub fn project(doc: &Value, fields: Option<&HashSet<String>>) -> Value {
    let Some(fields) = fields else {
        return doc.clone();
    };

    let mut projected = Value::Object(Map::new());
    if let Some(id) = doc.get("_id") {
        set_path(&mut projected, "_id", id.clone());
    }
    for field in fields {
        if let Some(value) = path_value(doc, field) {
            set_path(&mut projected, field, value.clone());
        }
    }
    projected
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_eq() {
        let query = Query::new().with("done", FilterOp::Eq, json!(false));

        assert!(query.matches(&json!({"_id": "1", "done": false})));
        assert!(!query.matches(&json!({"_id": "1", "done": true})));
        assert!(!query.matches(&json!({"_id": "1"})));
    }

    #[test]
    fn test_filter_numeric_ops() {
        let query = Query::new().with("age", FilterOp::Gte, json!(18));

        assert!(query.matches(&json!({"age": 18})));
        assert!(query.matches(&json!({"age": 30})));
        assert!(!query.matches(&json!({"age": 17})));
        assert!(!query.matches(&json!({"age": "old"})));
    }

    #[test]
    fn test_filter_in() {
        let query = Query::new().with("status", FilterOp::In, json!(["open", "pending"]));

        assert!(query.matches(&json!({"status": "open"})));
        assert!(!query.matches(&json!({"status": "closed"})));
    }

    #[test]
    fn test_dot_path_filter() {
        let query = Query::new().with("meta.kind", FilterOp::Eq, json!("note"));

        assert!(query.matches(&json!({"meta": {"kind": "note"}})));
        assert!(!query.matches(&json!({"meta": {"kind": "task"}})));
        assert!(!query.matches(&json!({"meta": "flat"})));
    }

    #[test]
    fn test_empty_query_matches_all() {
        assert!(Query::new().matches(&json!({"anything": 1})));
    }

    #[test]
    fn test_path_helpers() {
        let mut doc = json!({"a": {"b": 1}});

        assert_eq!(path_value(&doc, "a.b"), Some(&json!(1)));
        assert_eq!(path_value(&doc, "a.c"), None);

        set_path(&mut doc, "a.c", json!(2));
        assert_eq!(path_value(&doc, "a.c"), Some(&json!(2)));

        set_path(&mut doc, "x.y.z", json!("deep"));
        assert_eq!(path_value(&doc, "x.y.z"), Some(&json!("deep")));

        assert!(unset_path(&mut doc, "a.b"));
        assert!(!unset_path(&mut doc, "a.b"));
        assert_eq!(path_value(&doc, "a.b"), None);
    }

    #[test]
    fn test_projection_retains_id() {
        let doc = json!({"_id": "1", "title": "x", "body": "y", "meta": {"a": 1, "b": 2}});
        let fields: HashSet<String> = ["title".to_string(), "meta.a".to_string()].into();

        let projected = project(&doc, Some(&fields));
        assert_eq!(
            projected,
            json!({"_id": "1", "title": "x", "meta": {"a": 1}})
        );
    }

    #[test]
    fn test_projection_none_is_identity() {
        let doc = json!({"_id": "1", "title": "x"});
        assert_eq!(project(&doc, None), doc);
    }

    #[test]
    fn test_sort_compare() {
        let sort = Sort::asc("rank");
        let a = json!({"rank": 1});
        let b = json!({"rank": 2});

        assert_eq!(sort.compare(&a, &b), Ordering::Less);
        assert_eq!(Sort::desc("rank").compare(&a, &b), Ordering::Greater);

        // Missing field sorts first ascending
        assert_eq!(sort.compare(&json!({}), &a), Ordering::Less);
    }
}

//! Metadata filter algebra.
//!
//! A leaf is `{field: value}` or `{field: {"$in": [...]}}`; composition is
//! `{"$and": [...]}` / `{"$or": [...]}`.  [`Filter::to_value`] produces the
//! wire form the store expects; [`Filter::matches`] evaluates the same
//! semantics against a flat metadata map so the in-process store and the
//! remote one agree.

use serde_json::{Map, Value, json};

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, Value),
    In(String, Vec<Value>),
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq(field.into(), value.into())
    }

    pub fn is_in(field: impl Into<String>, values: Vec<Value>) -> Self {
        Filter::In(field.into(), values)
    }

    /// Conjunction; a single clause collapses to itself.
    pub fn and(clauses: Vec<Filter>) -> Self {
        Self::compose(clauses, Filter::And)
    }

    /// Disjunction; a single clause collapses to itself.
    pub fn or(clauses: Vec<Filter>) -> Self {
        Self::compose(clauses, Filter::Or)
    }

    fn compose(mut clauses: Vec<Filter>, wrap: fn(Vec<Filter>) -> Filter) -> Self {
        if clauses.len() == 1 {
            clauses.remove(0)
        } else {
            wrap(clauses)
        }
    }

    /// Wire representation.
    pub fn to_value(&self) -> Value {
        match self {
            Filter::Eq(field, value) => json!({ field: value }),
            Filter::In(field, values) => json!({ field: { "$in": values } }),
            Filter::And(clauses) => {
                json!({ "$and": clauses.iter().map(Filter::to_value).collect::<Vec<_>>() })
            }
            Filter::Or(clauses) => {
                json!({ "$or": clauses.iter().map(Filter::to_value).collect::<Vec<_>>() })
            }
        }
    }

    /// Evaluate against a flat metadata map.
    pub fn matches(&self, metadata: &Map<String, Value>) -> bool {
        match self {
            Filter::Eq(field, value) => metadata.get(field) == Some(value),
            Filter::In(field, values) => metadata
                .get(field)
                .map(|present| values.contains(present))
                .unwrap_or(false),
            Filter::And(clauses) => clauses.iter().all(|clause| clause.matches(metadata)),
            Filter::Or(clauses) => clauses.iter().any(|clause| clause.matches(metadata)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn eq_leaf_wire_form() {
        let filter = Filter::eq("workspace_id", "algs");
        assert_eq!(filter.to_value(), json!({"workspace_id": "algs"}));
    }

    #[test]
    fn in_leaf_wire_form() {
        let filter = Filter::is_in("code_type", vec![json!("python"), json!("rust")]);
        assert_eq!(
            filter.to_value(),
            json!({"code_type": {"$in": ["python", "rust"]}})
        );
    }

    #[test]
    fn nested_composition_wire_form() {
        let filter = Filter::And(vec![
            Filter::Or(vec![
                Filter::eq("workspace_id", "algs"),
                Filter::eq("project_path", "algs"),
            ]),
            Filter::is_in("code_type", vec![json!("python")]),
        ]);
        assert_eq!(
            filter.to_value(),
            json!({"$and": [
                {"$or": [{"workspace_id": "algs"}, {"project_path": "algs"}]},
                {"code_type": {"$in": ["python"]}},
            ]})
        );
    }

    #[test]
    fn single_clause_collapses() {
        let filter = Filter::and(vec![Filter::eq("workspace_id", "w")]);
        assert_eq!(filter, Filter::eq("workspace_id", "w"));
        let filter = Filter::or(vec![Filter::eq("workspace_id", "w")]);
        assert_eq!(filter, Filter::eq("workspace_id", "w"));
    }

    #[test]
    fn eq_matches_exact_value_only() {
        let metadata = meta(&[("workspace_id", json!("algs"))]);
        assert!(Filter::eq("workspace_id", "algs").matches(&metadata));
        assert!(!Filter::eq("workspace_id", "other").matches(&metadata));
        assert!(!Filter::eq("missing", "algs").matches(&metadata));
    }

    #[test]
    fn in_matches_membership() {
        let metadata = meta(&[("code_type", json!("python"))]);
        let filter = Filter::is_in("code_type", vec![json!("python"), json!("go")]);
        assert!(filter.matches(&metadata));
        let filter = Filter::is_in("code_type", vec![json!("go")]);
        assert!(!filter.matches(&metadata));
    }

    #[test]
    fn and_or_combinations() {
        let metadata = meta(&[
            ("workspace_id", json!("algs")),
            ("code_type", json!("python")),
        ]);
        let both = Filter::And(vec![
            Filter::eq("workspace_id", "algs"),
            Filter::eq("code_type", "python"),
        ]);
        assert!(both.matches(&metadata));

        let either = Filter::Or(vec![
            Filter::eq("workspace_id", "nope"),
            Filter::eq("code_type", "python"),
        ]);
        assert!(either.matches(&metadata));

        let neither = Filter::Or(vec![
            Filter::eq("workspace_id", "nope"),
            Filter::eq("code_type", "go"),
        ]);
        assert!(!neither.matches(&metadata));
    }
}

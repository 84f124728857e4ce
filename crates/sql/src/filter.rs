//! Filter text algebra.
//!
//! Every backend hands the caller a filter text to apply to the dataset. The
//! helpers here combine such texts, render primary-key membership filters and
//! decide what part of a dataset's currently applied filter survives a new
//! spatial step.

use geosieve_common::config::{DEFAULT_STAGE_PREFIX, DEFAULT_VIEW_PREFIX};
use geosieve_common::{CombineOperator, FeatureIdSet};
use once_cell::sync::Lazy;
use regex::Regex;
use sqlparser::ast::{BinaryOperator, Expr};

use crate::dialects::SqlDialect;
use crate::error::SqlGenError;
use crate::sanitize::quote_ident;

/// Constant-false filter: selects no feature in either dialect.
pub const MATCH_NOTHING: &str = "0 = 1";

static SPATIAL_FUNCTION_REGEX: Lazy<Regex> = Lazy::new(|| {
    let mut names: Vec<&str> = SqlDialect::PostGis.spatial_markers();
    names.extend(SqlDialect::SpatiaLite.spatial_markers());
    names.sort_unstable();
    names.dedup();
    Regex::new(&format!(r"(?i)\b(?:ST_\w+|{})\s*\(", names.join("|"))).unwrap()
});

static KEY_LIST_REGEX: Lazy<Regex> = Lazy::new(|| {
    let item = r"(?:'(?:[^']|'')*'|-?\d+)";
    Regex::new(&format!(
        r#"(?is)^\s*(?:"[^"]+"|\w+)\s+IN\s*\(\s*{item}(?:\s*,\s*{item})*\s*\)\s*$"#
    ))
    .unwrap()
});

static MATCH_NOTHING_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*0\s*=\s*1\s*$").unwrap());

/// Combine an existing filter with a new one.
///
/// `AND`/`OR`/`AND NOT` parenthesize both sides; `Replace` (or no existing
/// filter) yields the new filter alone. A new filter that matches nothing
/// leaves an existing one unchanged under `OR` and `AND NOT`.
pub fn combine_filter(existing: Option<&str>, new: &str, op: CombineOperator) -> String {
    let existing = existing.map(str::trim).filter(|e| !e.is_empty());
    if MATCH_NOTHING_REGEX.is_match(new) {
        if let (Some(old), CombineOperator::Or | CombineOperator::AndNot) = (existing, op) {
            return old.to_string();
        }
    }
    match (existing, op) {
        (_, CombineOperator::Replace) => new.to_string(),
        (None, CombineOperator::AndNot) => format!("NOT ({})", new),
        (None, _) => new.to_string(),
        (Some(old), CombineOperator::And) => format!("({}) AND ({})", old, new),
        (Some(old), CombineOperator::Or) => format!("({}) OR ({})", old, new),
        (Some(old), CombineOperator::AndNot) => format!("({}) AND NOT ({})", old, new),
    }
}

/// `"pk" IN (1, 2, 3)`, or the constant-false filter for an empty set.
pub fn key_membership(pk_column: &str, ids: &FeatureIdSet) -> Result<String, SqlGenError> {
    if ids.is_empty() {
        return Ok(MATCH_NOTHING.to_string());
    }
    let list = ids
        .iter()
        .map(|id| id.to_sql_literal())
        .collect::<Vec<_>>()
        .join(", ");
    Ok(format!("{} IN ({})", quote_ident(pk_column)?, list))
}

/// `"pk" IN (SELECT "pk" FROM relation)` for a precomputed view or staging
/// table. `relation` must already be quoted.
pub fn key_subquery(pk_column: &str, relation: &str) -> Result<String, SqlGenError> {
    let pk = quote_ident(pk_column)?;
    Ok(format!("{pk} IN (SELECT {pk} FROM {relation})"))
}

/// What kind of filter a dataset currently has applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterClass {
    Empty,
    /// Produced by a spatial step: contains spatial functions or refers to a
    /// precomputed view or staging table.
    Spatial,
    /// A bare primary-key list left behind by a previous spatial step.
    KeyMembership,
    /// A plain attribute filter.
    Attribute,
}

#[derive(Debug, Clone)]
pub struct FilterClassifier {
    prefixes: Vec<String>,
}

impl Default for FilterClassifier {
    fn default() -> Self {
        Self::new([DEFAULT_VIEW_PREFIX, DEFAULT_STAGE_PREFIX])
    }
}

impl FilterClassifier {
    /// `prefixes` are the view and staging-table name prefixes in use.
    pub fn new<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            prefixes: prefixes
                .into_iter()
                .map(|p| p.into().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    pub fn classify(&self, text: &str) -> FilterClass {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return FilterClass::Empty;
        }
        let lower = trimmed.to_lowercase();
        if SPATIAL_FUNCTION_REGEX.is_match(trimmed)
            || self.prefixes.iter().any(|p| lower.contains(p.as_str()))
        {
            return FilterClass::Spatial;
        }
        if KEY_LIST_REGEX.is_match(trimmed) || MATCH_NOTHING_REGEX.is_match(trimmed) {
            return FilterClass::KeyMembership;
        }
        FilterClass::Attribute
    }

    /// The part of an applied filter to keep when a new spatial step is
    /// combined into it.
    ///
    /// Spatial and key-membership filters are replaced; attribute filters are
    /// kept. A conjunction is split on its top-level `AND`s and only the
    /// attribute conjuncts are kept, so `(pop > 10) AND ("id" IN (1, 2))`
    /// keeps `pop > 10`.
    pub fn retained_attribute(&self, text: &str) -> Option<String> {
        match self.classify(text) {
            FilterClass::Empty => return None,
            FilterClass::KeyMembership => return None,
            FilterClass::Attribute | FilterClass::Spatial => {}
        }

        let Ok(expr) = crate::condition::parse_expr(text) else {
            return (self.classify(text) == FilterClass::Attribute).then(|| text.trim().to_string());
        };

        let mut conjuncts = Vec::new();
        flatten_and(&expr, &mut conjuncts);
        let kept: Vec<String> = conjuncts
            .iter()
            .map(|c| c.to_string())
            .filter(|c| self.classify(c) == FilterClass::Attribute)
            .collect();

        if kept.len() == conjuncts.len() {
            return Some(text.trim().to_string());
        }
        match kept.len() {
            0 => None,
            1 => kept.into_iter().next(),
            _ => Some(
                kept.iter()
                    .map(|c| format!("({})", c))
                    .collect::<Vec<_>>()
                    .join(" AND "),
            ),
        }
    }
}

fn flatten_and<'a>(expr: &'a Expr, out: &mut Vec<&'a Expr>) {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            flatten_and(left, out);
            flatten_and(right, out);
        }
        Expr::Nested(inner) if matches!(**inner, Expr::BinaryOp { op: BinaryOperator::And, .. }) => {
            flatten_and(inner, out)
        }
        Expr::Nested(inner) => out.push(inner),
        other => out.push(other),
    }
}

static DEFAULT_CLASSIFIER: Lazy<FilterClassifier> = Lazy::new(FilterClassifier::default);

/// Classify with the default view and staging prefixes.
pub fn classify_filter(text: &str) -> FilterClass {
    DEFAULT_CLASSIFIER.classify(text)
}

/// [`FilterClassifier::retained_attribute`] with the default prefixes.
pub fn retained_attribute(text: &str) -> Option<String> {
    DEFAULT_CLASSIFIER.retained_attribute(text)
}

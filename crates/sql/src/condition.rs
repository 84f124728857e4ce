//! Attribute conditions.
//!
//! Conditions arrive as SQL boolean expressions. They are parsed once with
//! `sqlparser` so malformed text fails before it reaches a database, and the
//! parsed form can be evaluated in-process against a feature's attributes
//! when no SQL engine is available.
//!
//! Evaluation follows SQL three-valued logic; a condition that evaluates to
//! NULL does not match.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use regex::Regex;
use sqlparser::ast::{BinaryOperator, Expr, UnaryOperator, Value};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::Token;

use crate::error::SqlGenError;

/// Feature attributes keyed by column name.
pub type Attributes = serde_json::Map<String, serde_json::Value>;

/// Runtime value of an evaluated sub-expression.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl AttrValue {
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => AttrValue::Null,
            serde_json::Value::Bool(b) => AttrValue::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => AttrValue::Int(i),
                None => n.as_f64().map(AttrValue::Float).unwrap_or(AttrValue::Null),
            },
            serde_json::Value::String(s) => AttrValue::Text(s.clone()),
            other => AttrValue::Text(other.to_string()),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttrValue::Int(i) => Some(*i as f64),
            AttrValue::Float(f) => Some(*f),
            AttrValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            AttrValue::Text(s) => s.trim().parse().ok(),
            AttrValue::Null => None,
        }
    }

    /// SQL truthiness; `None` is NULL.
    fn truth(&self) -> Option<bool> {
        match self {
            AttrValue::Null => None,
            AttrValue::Bool(b) => Some(*b),
            AttrValue::Int(i) => Some(*i != 0),
            AttrValue::Float(f) => Some(*f != 0.0),
            AttrValue::Text(s) => Some(s.trim().parse::<f64>().map(|f| f != 0.0).unwrap_or(false)),
        }
    }

    fn from_truth(t: Option<bool>) -> Self {
        t.map(AttrValue::Bool).unwrap_or(AttrValue::Null)
    }

    fn is_numeric(&self) -> bool {
        matches!(self, AttrValue::Int(_) | AttrValue::Float(_) | AttrValue::Bool(_))
    }

    fn compare(&self, other: &AttrValue) -> Option<Ordering> {
        match (self, other) {
            (AttrValue::Null, _) | (_, AttrValue::Null) => None,
            (AttrValue::Int(a), AttrValue::Int(b)) => Some(a.cmp(b)),
            (AttrValue::Text(a), AttrValue::Text(b)) => Some(a.cmp(b)),
            (a, b) if a.is_numeric() && b.is_numeric() => a.as_f64()?.partial_cmp(&b.as_f64()?),
            // Text that looks like a number compares numerically.
            (a, b) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        }
    }

    fn text(&self) -> Option<String> {
        match self {
            AttrValue::Null => None,
            AttrValue::Bool(b) => Some(if *b { "1" } else { "0" }.to_string()),
            AttrValue::Int(i) => Some(i.to_string()),
            AttrValue::Float(f) => Some(f.to_string()),
            AttrValue::Text(s) => Some(s.clone()),
        }
    }
}

pub(crate) fn parse_expr(text: &str) -> Result<Expr, SqlGenError> {
    let dialect = GenericDialect {};
    let mut parser = Parser::new(&dialect).try_with_sql(text)?;
    let expr = parser.parse_expr()?;
    let next = parser.peek_token();
    if next.token != Token::EOF {
        return Err(SqlGenError::TrailingInput(next.token.to_string()));
    }
    Ok(expr)
}

/// Check that `text` is a single well-formed SQL expression.
pub fn validate_expression(text: &str) -> Result<(), SqlGenError> {
    parse_expr(text).map(|_| ())
}

/// A parsed attribute condition.
#[derive(Debug, Clone)]
pub struct Condition {
    text: String,
    expr: Expr,
}

impl Condition {
    pub fn parse(text: &str) -> Result<Self, SqlGenError> {
        let text = text.trim();
        Ok(Self {
            text: text.to_string(),
            expr: parse_expr(text)?,
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Column names referenced by the condition.
    pub fn columns(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        collect_columns(&self.expr, &mut out);
        out
    }

    /// Whether the row satisfies the condition. NULL does not match.
    pub fn matches(&self, row: &Attributes) -> Result<bool, SqlGenError> {
        Ok(eval(&self.expr, row)?.truth().unwrap_or(false))
    }

    /// Evaluate as a value, e.g. a per-feature buffer distance.
    pub fn evaluate(&self, row: &Attributes) -> Result<AttrValue, SqlGenError> {
        eval(&self.expr, row)
    }
}

fn collect_columns(expr: &Expr, out: &mut BTreeSet<String>) {
    match expr {
        Expr::Identifier(ident) => {
            out.insert(ident.value.clone());
        }
        Expr::CompoundIdentifier(parts) => {
            if let Some(last) = parts.last() {
                out.insert(last.value.clone());
            }
        }
        Expr::BinaryOp { left, right, .. } => {
            collect_columns(left, out);
            collect_columns(right, out);
        }
        Expr::UnaryOp { expr, .. }
        | Expr::Nested(expr)
        | Expr::IsNull(expr)
        | Expr::IsNotNull(expr)
        | Expr::IsTrue(expr)
        | Expr::IsFalse(expr) => collect_columns(expr, out),
        Expr::InList { expr, list, .. } => {
            collect_columns(expr, out);
            list.iter().for_each(|e| collect_columns(e, out));
        }
        Expr::Between { expr, low, high, .. } => {
            collect_columns(expr, out);
            collect_columns(low, out);
            collect_columns(high, out);
        }
        Expr::Like { expr, pattern, .. } | Expr::ILike { expr, pattern, .. } => {
            collect_columns(expr, out);
            collect_columns(pattern, out);
        }
        _ => {}
    }
}

fn lookup(name: &str, row: &Attributes) -> Result<AttrValue, SqlGenError> {
    if let Some(v) = row.get(name) {
        return Ok(AttrValue::from_json(v));
    }
    if let Some((_, v)) = row.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)) {
        return Ok(AttrValue::from_json(v));
    }
    Err(SqlGenError::UnknownColumn {
        name: name.to_string(),
        available: row.keys().cloned().collect(),
    })
}

fn literal(value: &Value) -> Result<AttrValue, SqlGenError> {
    Ok(match value {
        Value::Null => AttrValue::Null,
        Value::Boolean(b) => AttrValue::Bool(*b),
        Value::Number(n, _) => match n.parse::<i64>() {
            Ok(i) => AttrValue::Int(i),
            Err(_) => n
                .parse::<f64>()
                .map(AttrValue::Float)
                .map_err(|_| SqlGenError::UnsupportedExpr(format!("number '{}'", n)))?,
        },
        Value::SingleQuotedString(s) | Value::DoubleQuotedString(s) => AttrValue::Text(s.clone()),
        other => return Err(SqlGenError::UnsupportedExpr(other.to_string())),
    })
}

fn eval(expr: &Expr, row: &Attributes) -> Result<AttrValue, SqlGenError> {
    match expr {
        Expr::Identifier(ident) => lookup(&ident.value, row),
        Expr::CompoundIdentifier(parts) => match parts.last() {
            Some(last) => lookup(&last.value, row),
            None => Err(SqlGenError::UnsupportedExpr(expr.to_string())),
        },
        Expr::Value(v) => literal(&v.value),
        Expr::Nested(inner) => eval(inner, row),
        Expr::UnaryOp { op, expr: inner } => {
            let v = eval(inner, row)?;
            match op {
                UnaryOperator::Not => Ok(AttrValue::from_truth(v.truth().map(|b| !b))),
                UnaryOperator::Minus => Ok(match v {
                    AttrValue::Int(i) => AttrValue::Int(-i),
                    AttrValue::Null => AttrValue::Null,
                    other => other
                        .as_f64()
                        .map(|f| AttrValue::Float(-f))
                        .unwrap_or(AttrValue::Null),
                }),
                UnaryOperator::Plus => Ok(v),
                other => Err(SqlGenError::UnsupportedExpr(format!("unary operator {}", other))),
            }
        }
        Expr::BinaryOp { left, op, right } => eval_binary(left, op, right, row),
        Expr::IsNull(inner) => Ok(AttrValue::Bool(eval(inner, row)? == AttrValue::Null)),
        Expr::IsNotNull(inner) => Ok(AttrValue::Bool(eval(inner, row)? != AttrValue::Null)),
        Expr::IsTrue(inner) => Ok(AttrValue::Bool(eval(inner, row)?.truth() == Some(true))),
        Expr::IsFalse(inner) => Ok(AttrValue::Bool(eval(inner, row)?.truth() == Some(false))),
        Expr::InList {
            expr: inner,
            list,
            negated,
        } => {
            let needle = eval(inner, row)?;
            if needle == AttrValue::Null {
                return Ok(AttrValue::Null);
            }
            let mut saw_null = false;
            for item in list {
                let candidate = eval(item, row)?;
                match needle.compare(&candidate) {
                    Some(Ordering::Equal) => return Ok(AttrValue::Bool(!negated)),
                    None => saw_null |= candidate == AttrValue::Null,
                    _ => {}
                }
            }
            Ok(if saw_null {
                AttrValue::Null
            } else {
                AttrValue::Bool(*negated)
            })
        }
        Expr::Between {
            expr: inner,
            negated,
            low,
            high,
        } => {
            let v = eval(inner, row)?;
            let lo = v.compare(&eval(low, row)?);
            let hi = v.compare(&eval(high, row)?);
            let inside = match (lo, hi) {
                (Some(lo), Some(hi)) => Some(lo != Ordering::Less && hi != Ordering::Greater),
                _ => None,
            };
            Ok(AttrValue::from_truth(inside.map(|b| b != *negated)))
        }
        Expr::Like {
            negated,
            expr: inner,
            pattern,
            ..
        } => eval_like(inner, pattern, *negated, false, row),
        Expr::ILike {
            negated,
            expr: inner,
            pattern,
            ..
        } => eval_like(inner, pattern, *negated, true, row),
        Expr::Function(func) => Err(SqlGenError::UnsupportedFunction(func.name.to_string())),
        other => Err(SqlGenError::UnsupportedExpr(other.to_string())),
    }
}

fn eval_binary(
    left: &Expr,
    op: &BinaryOperator,
    right: &Expr,
    row: &Attributes,
) -> Result<AttrValue, SqlGenError> {
    match op {
        BinaryOperator::And => {
            let l = eval(left, row)?.truth();
            if l == Some(false) {
                return Ok(AttrValue::Bool(false));
            }
            let r = eval(right, row)?.truth();
            Ok(match (l, r) {
                (_, Some(false)) => AttrValue::Bool(false),
                (Some(true), Some(true)) => AttrValue::Bool(true),
                _ => AttrValue::Null,
            })
        }
        BinaryOperator::Or => {
            let l = eval(left, row)?.truth();
            if l == Some(true) {
                return Ok(AttrValue::Bool(true));
            }
            let r = eval(right, row)?.truth();
            Ok(match (l, r) {
                (_, Some(true)) => AttrValue::Bool(true),
                (Some(false), Some(false)) => AttrValue::Bool(false),
                _ => AttrValue::Null,
            })
        }
        _ => {
            let l = eval(left, row)?;
            let r = eval(right, row)?;
            let cmp = || l.compare(&r);
            Ok(match op {
                BinaryOperator::Eq => AttrValue::from_truth(cmp().map(|o| o == Ordering::Equal)),
                BinaryOperator::NotEq => AttrValue::from_truth(cmp().map(|o| o != Ordering::Equal)),
                BinaryOperator::Lt => AttrValue::from_truth(cmp().map(|o| o == Ordering::Less)),
                BinaryOperator::LtEq => AttrValue::from_truth(cmp().map(|o| o != Ordering::Greater)),
                BinaryOperator::Gt => AttrValue::from_truth(cmp().map(|o| o == Ordering::Greater)),
                BinaryOperator::GtEq => AttrValue::from_truth(cmp().map(|o| o != Ordering::Less)),
                BinaryOperator::StringConcat => match (l.text(), r.text()) {
                    (Some(a), Some(b)) => AttrValue::Text(a + &b),
                    _ => AttrValue::Null,
                },
                BinaryOperator::Plus
                | BinaryOperator::Minus
                | BinaryOperator::Multiply
                | BinaryOperator::Divide
                | BinaryOperator::Modulo => arithmetic(&l, op, &r),
                other => {
                    return Err(SqlGenError::UnsupportedExpr(format!("operator {}", other)))
                }
            })
        }
    }
}

fn arithmetic(l: &AttrValue, op: &BinaryOperator, r: &AttrValue) -> AttrValue {
    if let (AttrValue::Int(a), AttrValue::Int(b)) = (l, r) {
        let out = match op {
            BinaryOperator::Plus => a.checked_add(*b),
            BinaryOperator::Minus => a.checked_sub(*b),
            BinaryOperator::Multiply => a.checked_mul(*b),
            BinaryOperator::Divide => a.checked_div(*b),
            BinaryOperator::Modulo => a.checked_rem(*b),
            _ => None,
        };
        return out.map(AttrValue::Int).unwrap_or(AttrValue::Null);
    }
    let (Some(a), Some(b)) = (l.as_f64(), r.as_f64()) else {
        return AttrValue::Null;
    };
    let out = match op {
        BinaryOperator::Plus => a + b,
        BinaryOperator::Minus => a - b,
        BinaryOperator::Multiply => a * b,
        BinaryOperator::Divide if b != 0.0 => a / b,
        BinaryOperator::Modulo if b != 0.0 => a % b,
        _ => return AttrValue::Null,
    };
    AttrValue::Float(out)
}

fn like_regex(pattern: &str, case_insensitive: bool) -> Result<Regex, SqlGenError> {
    let mut re = String::with_capacity(pattern.len() + 8);
    if case_insensitive {
        re.push_str("(?i)");
    }
    re.push_str("(?s)^");
    for ch in pattern.chars() {
        match ch {
            '%' => re.push_str(".*"),
            '_' => re.push('.'),
            c => re.push_str(&regex::escape(c.encode_utf8(&mut [0; 4]))),
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|e| SqlGenError::UnsupportedExpr(format!("LIKE pattern: {}", e)))
}

fn eval_like(
    expr: &Expr,
    pattern: &Expr,
    negated: bool,
    case_insensitive: bool,
    row: &Attributes,
) -> Result<AttrValue, SqlGenError> {
    let (Some(value), Some(pattern)) = (eval(expr, row)?.text(), eval(pattern, row)?.text()) else {
        return Ok(AttrValue::Null);
    };
    let matched = like_regex(&pattern, case_insensitive)?.is_match(&value);
    Ok(AttrValue::Bool(matched != negated))
}

//! Function Mapper
//!
//! Declarative registry translating canonical spatial function names to
//! dialect-specific calls. Arguments are pre-rendered SQL fragments.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::SqlGenError;

/// Transform closures receive already-sanitized SQL fragments and must
/// return a complete SQL expression.
pub type TransformFn = Arc<dyn Fn(&[String]) -> String + Send + Sync>;

/// A translation rule for one canonical function.
pub enum Translation {
    /// Simple rename: "make_valid" → "ST_MakeValid"
    Rename(&'static str),
    /// Custom transform with access to arguments
    Transform(TransformFn),
}

impl Clone for Translation {
    fn clone(&self) -> Self {
        match self {
            Translation::Rename(s) => Translation::Rename(s),
            Translation::Transform(f) => Translation::Transform(Arc::clone(f)),
        }
    }
}

/// Registry of function translations from canonical names to a target dialect
pub struct FunctionMapper {
    rules: HashMap<&'static str, Translation>,
}

impl std::fmt::Debug for FunctionMapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionMapper")
            .field("rules_count", &self.rules.len())
            .finish()
    }
}

impl Clone for FunctionMapper {
    fn clone(&self) -> Self {
        Self {
            rules: self.rules.iter().map(|(k, v)| (*k, v.clone())).collect(),
        }
    }
}

impl Default for FunctionMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl FunctionMapper {
    pub fn new() -> Self {
        Self {
            rules: HashMap::new(),
        }
    }

    /// Add a simple rename rule
    pub fn rename(mut self, from: &'static str, to: &'static str) -> Self {
        self.rules.insert(from, Translation::Rename(to));
        self
    }

    /// Add a custom transform rule
    pub fn transform<F>(mut self, from: &'static str, f: F) -> Self
    where
        F: Fn(&[String]) -> String + Send + Sync + 'static,
    {
        self.rules.insert(from, Translation::Transform(Arc::new(f)));
        self
    }

    /// Translate a call; `None` when the function has no rule.
    pub fn translate(&self, func: &str, args: &[String]) -> Option<String> {
        let func_lower = func.to_lowercase();
        match self.rules.get(func_lower.as_str()) {
            Some(Translation::Rename(new_name)) => Some(render_call(new_name, args)),
            Some(Translation::Transform(f)) => Some(f(args)),
            None => None,
        }
    }

    /// Like [`translate`](Self::translate), but a missing rule is an error.
    pub fn call(&self, func: &str, args: &[String]) -> Result<String, SqlGenError> {
        self.translate(func, args)
            .ok_or_else(|| SqlGenError::UnsupportedFunction(func.to_string()))
    }

    /// Check if a function has a translation rule
    pub fn has_rule(&self, func: &str) -> bool {
        self.rules.contains_key(func.to_lowercase().as_str())
    }

    /// Target-side function names produced by plain renames.
    pub fn target_names(&self) -> Vec<&'static str> {
        self.rules
            .values()
            .filter_map(|t| match t {
                Translation::Rename(name) => Some(*name),
                Translation::Transform(_) => None,
            })
            .collect()
    }
}

/// `name(arg1, arg2, ...)`
pub fn render_call(name: &str, args: &[String]) -> String {
    format!("{}({})", name, args.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rename_rule() {
        let mapper = FunctionMapper::new().rename("make_valid", "ST_MakeValid");
        let out = mapper.translate("MAKE_VALID", &["g".to_string()]).unwrap();
        assert_eq!(out, "ST_MakeValid(g)");
        assert!(mapper.has_rule("make_valid"));
    }

    #[test]
    fn test_transform_rule() {
        let mapper = FunctionMapper::new()
            .transform("intersects", |args| format!("Intersects({}) = 1", args.join(", ")));
        let out = mapper
            .translate("intersects", &["a".to_string(), "b".to_string()])
            .unwrap();
        assert_eq!(out, "Intersects(a, b) = 1");
    }

    #[test]
    fn test_missing_rule_is_error() {
        let mapper = FunctionMapper::new();
        assert!(matches!(
            mapper.call("st_frobnicate", &[]),
            Err(SqlGenError::UnsupportedFunction(_))
        ));
    }
}

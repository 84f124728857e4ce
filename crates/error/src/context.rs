//! # Error Contexts
//!
//! Structured metadata attached to errors so callers can react without
//! parsing messages.

use serde::{Deserialize, Serialize};

/// Structured context for errors.
///
/// Each variant provides specific fields relevant to that error type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ErrorContext {
    /// Context for connection errors (GEOSIEVE-1001..1006)
    Connection {
        backend: String,
        target: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        sqlstate: Option<String>,
    },

    /// Context for GEOSIEVE-2001/2002 (expression errors)
    Expression {
        expression: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        function: Option<String>,
    },

    /// Context for geometry errors; `index` is the position of the offending
    /// source feature when known.
    Geometry {
        #[serde(skip_serializing_if = "Option::is_none")]
        index: Option<usize>,
        reason: String,
    },

    /// Context for GEOSIEVE-5003 (precomputed view failures)
    View {
        view_name: String,
        statement: String,
    },

    /// Context for errors surfaced after lock retries were exhausted
    Retry { attempts: u32, waited_ms: u64 },

    /// Generic key-value context for extensibility
    Generic {
        #[serde(flatten)]
        data: std::collections::HashMap<String, serde_json::Value>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_view_context_serde_roundtrip() {
        let ctx = ErrorContext::View {
            view_name: "geosieve_mv_abc".to_string(),
            statement: "CLUSTER".to_string(),
        };

        let json = serde_json::to_string(&ctx).unwrap();
        assert!(json.contains("\"type\":\"view\""));
        let de: ErrorContext = serde_json::from_str(&json).unwrap();

        match de {
            ErrorContext::View { view_name, .. } => {
                assert_eq!(view_name, "geosieve_mv_abc");
            }
            _ => panic!("Wrong variant"),
        }
    }
}

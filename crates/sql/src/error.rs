use sqlparser::parser::ParserError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SqlGenError {
    #[error("SQL Parser error: {0}")]
    Parser(#[from] ParserError),

    #[error("Unexpected trailing input after expression: {0}")]
    TrailingInput(String),

    #[error("Unsupported expression: {0}")]
    UnsupportedExpr(String),

    #[error("Unsupported function: {0}")]
    UnsupportedFunction(String),

    #[error("Unknown column '{name}'. Available: {available:?}")]
    UnknownColumn {
        name: String,
        available: Vec<String>,
    },

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Invalid literal: {0}")]
    InvalidLiteral(String),

    #[error("No spatial predicate selected")]
    NoPredicates,

    #[error("Invalid buffer: {0}")]
    InvalidBuffer(String),

    #[error("Auxiliary dataset '{0}' was not supplied with the request")]
    MissingAuxiliary(String),

    #[error("Dataset '{0}' has no primary key")]
    MissingPrimaryKey(String),
}

impl SqlGenError {
    pub fn to_sieve_error(self, dialect_name: &str) -> geosieve_error::SieveError {
        use geosieve_error::{find_closest_match, ErrorCode, ErrorContext, SieveError};

        match self {
            SqlGenError::Parser(e) => SieveError::new(
                ErrorCode::InvalidExpression,
                format!("Cannot parse filter condition: {}", e),
            )
            .with_hint("Check the condition for unbalanced quotes or parentheses"),
            SqlGenError::TrailingInput(rest) => SieveError::new(
                ErrorCode::InvalidExpression,
                format!("Unexpected input after condition: '{}'", rest),
            )
            .with_hint("A filter condition must be a single boolean expression"),
            SqlGenError::UnsupportedExpr(expr) => SieveError::new(
                ErrorCode::InvalidExpression,
                format!("Expression not supported: {}", expr),
            )
            .with_context(ErrorContext::Expression {
                expression: expr,
                function: None,
            }),
            SqlGenError::UnsupportedFunction(func) => SieveError::new(
                ErrorCode::UnsupportedFunction,
                format!("Function '{}' is not supported by the {} backend", func, dialect_name),
            )
            .with_context(ErrorContext::Expression {
                expression: func.clone(),
                function: Some(func),
            })
            .with_hint("Use the backend's native dialect condition or a plain comparison"),
            SqlGenError::UnknownColumn { name, available } => {
                let mut err = SieveError::new(
                    ErrorCode::InvalidExpression,
                    format!("Unknown column '{}'", name),
                )
                .with_context(ErrorContext::Expression {
                    expression: name.clone(),
                    function: None,
                });
                if let Some(candidate) = find_closest_match(&name, &available) {
                    err = err.with_hint(format!("Did you mean '{}'?", candidate));
                }
                err
            }
            SqlGenError::InvalidIdentifier(e) => SieveError::new(
                ErrorCode::InvalidExpression,
                format!("Invalid SQL identifier: {}", e),
            )
            .with_hint("Identifiers must be sanitized to prevent SQL injection"),
            SqlGenError::InvalidLiteral(e) => SieveError::new(
                ErrorCode::InvalidExpression,
                format!("Invalid SQL literal: {}", e),
            ),
            SqlGenError::NoPredicates => SieveError::new(
                ErrorCode::UnsupportedPredicate,
                "A source geometry was given without any spatial predicate",
            )
            .with_hint("Select at least one of intersects, contains, within, crosses, overlaps, touches, disjoint, equals"),
            SqlGenError::InvalidBuffer(e) => SieveError::new(
                ErrorCode::InvalidExpression,
                format!("Invalid buffer: {}", e),
            ),
            SqlGenError::MissingAuxiliary(id) => SieveError::new(
                ErrorCode::UnsupportedDataset,
                format!("Source dataset '{}' was not supplied with the request", id),
            )
            .with_hint("Pass the source dataset in the request's auxiliary targets"),
            SqlGenError::MissingPrimaryKey(id) => SieveError::new(
                ErrorCode::MissingPrimaryKey,
                format!("Dataset '{}' has no primary key", id),
            ),
        }
    }
}

impl From<SqlGenError> for geosieve_error::SieveError {
    fn from(e: SqlGenError) -> Self {
        e.to_sieve_error("SQL")
    }
}

use crate::{ErrorCode, ErrorContext, SieveError};
use tokio_postgres::error::SqlState;

impl From<rusqlite::Error> for SieveError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode as Code;

        let message = err.to_string();
        match err.sqlite_error_code() {
            Some(Code::DatabaseBusy) | Some(Code::DatabaseLocked) => {
                SieveError::new(ErrorCode::DatabaseLocked, message)
            }
            Some(Code::DiskFull) | Some(Code::OutOfMemory) => {
                SieveError::new(ErrorCode::ResourceExhausted, message)
            }
            Some(Code::CannotOpen) | Some(Code::NotADatabase) | Some(Code::PermissionDenied) => {
                SieveError::new(ErrorCode::ConnectionFailed, message)
            }
            Some(Code::Unknown) if is_sqlite_statement_error(&message) => {
                SieveError::new(ErrorCode::InvalidExpression, message)
            }
            _ => match err {
                rusqlite::Error::UserFunctionError(inner) => {
                    SieveError::new(ErrorCode::InvalidGeometry, inner.to_string())
                }
                rusqlite::Error::InvalidColumnType(..)
                | rusqlite::Error::InvalidColumnName(_)
                | rusqlite::Error::FromSqlConversionFailure(..) => {
                    SieveError::new(ErrorCode::QueryFailed, message)
                }
                _ => SieveError::new(ErrorCode::QueryFailed, message),
            },
        }
    }
}

/// SQLite reports both parse errors and runtime failures as SQLITE_ERROR;
/// only the former are the caller's fault.
fn is_sqlite_statement_error(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("syntax error")
        || lower.contains("no such column")
        || lower.contains("no such function")
        || lower.contains("wrong number of arguments")
}

impl From<tokio_postgres::Error> for SieveError {
    fn from(err: tokio_postgres::Error) -> Self {
        let message = err.to_string();
        let Some(state) = err.code() else {
            // No server-side error: the socket dropped or never connected.
            return SieveError::new(ErrorCode::ConnectionFailed, message);
        };

        let db_message = err
            .as_db_error()
            .map(|db| db.message().to_string())
            .unwrap_or(message);

        let code = classify_sqlstate(state, &db_message);
        SieveError::new(code, db_message).with_context(ErrorContext::Connection {
            backend: "relational".to_string(),
            target: String::new(),
            sqlstate: Some(state.code().to_string()),
        })
    }
}

fn classify_sqlstate(state: &SqlState, message: &str) -> ErrorCode {
    if *state == SqlState::SYNTAX_ERROR
        || *state == SqlState::UNDEFINED_COLUMN
        || *state == SqlState::UNDEFINED_TABLE
        || *state == SqlState::DATATYPE_MISMATCH
        || *state == SqlState::INVALID_TEXT_REPRESENTATION
    {
        ErrorCode::InvalidExpression
    } else if *state == SqlState::UNDEFINED_FUNCTION {
        ErrorCode::UnsupportedFunction
    } else if *state == SqlState::DISK_FULL
        || *state == SqlState::OUT_OF_MEMORY
        || *state == SqlState::INSUFFICIENT_RESOURCES
        || *state == SqlState::PROGRAM_LIMIT_EXCEEDED
        || *state == SqlState::CONFIGURATION_LIMIT_EXCEEDED
    {
        ErrorCode::ResourceExhausted
    } else if *state == SqlState::QUERY_CANCELED {
        ErrorCode::QueryCancelled
    } else if *state == SqlState::TOO_MANY_CONNECTIONS
        || *state == SqlState::ADMIN_SHUTDOWN
        || *state == SqlState::CANNOT_CONNECT_NOW
        || *state == SqlState::CONNECTION_FAILURE
        || *state == SqlState::CONNECTION_EXCEPTION
    {
        ErrorCode::ConnectionFailed
    } else if *state == SqlState::INTERNAL_ERROR && message.to_lowercase().contains("geometry") {
        ErrorCode::InvalidGeometry
    } else {
        ErrorCode::QueryFailed
    }
}

impl From<std::io::Error> for SieveError {
    fn from(err: std::io::Error) -> Self {
        SieveError::new(ErrorCode::Io, err.to_string())
    }
}

impl From<serde_json::Error> for SieveError {
    fn from(err: serde_json::Error) -> Self {
        SieveError::new(ErrorCode::SerializationFailed, err.to_string())
    }
}

impl From<sqlparser::parser::ParserError> for SieveError {
    fn from(err: sqlparser::parser::ParserError) -> Self {
        SieveError::new(ErrorCode::InvalidExpression, err.to_string())
    }
}

/// Levenshtein-based suggestion for misspelled attribute names.
pub fn find_closest_match(target: &str, options: &[String]) -> Option<String> {
    let mut best_match: Option<&str> = None;
    let mut min_distance = usize::MAX;

    for option in options {
        let distance = levenshtein(target, option);
        if distance < min_distance && distance <= 3 {
            min_distance = distance;
            best_match = Some(option.as_str());
        }
    }

    best_match.map(|s| s.to_string())
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut dp = vec![vec![0; b.len() + 1]; a.len() + 1];

    for (i, row) in dp.iter_mut().enumerate() {
        row[0] = i;
    }
    for (j, val) in dp[0].iter_mut().enumerate() {
        *val = j;
    }

    for i in 1..=a.len() {
        for j in 1..=b.len() {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            dp[i][j] = std::cmp::min(
                std::cmp::min(dp[i - 1][j] + 1, dp[i][j - 1] + 1),
                dp[i - 1][j - 1] + cost,
            );
        }
    }

    dp[a.len()][b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levenshtein_distance() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("book", "back"), 2);
        assert_eq!(levenshtein("", ""), 0);
        assert_eq!(levenshtein("same", "same"), 0);
    }

    #[test]
    fn test_find_closest_match() {
        let options = vec![
            "landuse".to_string(),
            "area".to_string(),
            "owner".to_string(),
        ];

        assert_eq!(
            find_closest_match("landuse", &options),
            Some("landuse".to_string())
        );
        assert_eq!(
            find_closest_match("landuze", &options),
            Some("landuse".to_string())
        );
        assert_eq!(find_closest_match("completely_different", &options), None);
    }

    #[test]
    fn test_sqlite_busy_maps_to_lock() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".to_string()),
        );
        let sieve: SieveError = err.into();
        assert_eq!(sieve.code, ErrorCode::DatabaseLocked);
        assert!(sieve.is_lock());
    }

    #[test]
    fn test_sqlite_syntax_error_is_expression_error() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let err = conn.execute("SELEC 1", []).unwrap_err();
        let sieve: SieveError = err.into();
        assert_eq!(sieve.code, ErrorCode::InvalidExpression);
    }

    #[test]
    fn test_sqlstate_classification() {
        assert_eq!(
            classify_sqlstate(&SqlState::DISK_FULL, "no space"),
            ErrorCode::ResourceExhausted
        );
        assert_eq!(
            classify_sqlstate(&SqlState::SYNTAX_ERROR, "near x"),
            ErrorCode::InvalidExpression
        );
        assert_eq!(
            classify_sqlstate(&SqlState::INTERNAL_ERROR, "parse error - invalid geometry"),
            ErrorCode::InvalidGeometry
        );
        assert_eq!(
            classify_sqlstate(&SqlState::T_R_DEADLOCK_DETECTED, "deadlock"),
            ErrorCode::QueryFailed
        );
    }

    #[test]
    fn test_io_error_mapping() {
        let io_err = std::io::Error::other("File error");
        let sieve: SieveError = io_err.into();
        assert_eq!(sieve.code, ErrorCode::Io);
        assert!(sieve.message.contains("File error"));
    }
}

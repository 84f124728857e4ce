use serde_json::Value;
use geosieve_error::{ErrorCode, ErrorContext, SieveError};

#[test]
fn test_json_serialization() {
    let error = SieveError::new(ErrorCode::UnsupportedFunction, "Function 'upper' is not supported")
        .with_context(ErrorContext::Expression {
            expression: "upper(name) = 'A'".to_string(),
            function: Some("upper".to_string()),
        })
        .with_hint("Rewrite the condition using comparisons only");

    let json = error.to_json();
    println!("JSON: {}", json);

    let v: Value = serde_json::from_str(&json).expect("valid json");

    assert_eq!(v["code"], "GEOSIEVE-2002");
    assert_eq!(v["message"], "Function 'upper' is not supported");
    assert_eq!(v["hint"], "Rewrite the condition using comparisons only");
    assert_eq!(v["context"]["type"], "expression");
    assert_eq!(v["context"]["function"], "upper");
}

#[test]
fn test_error_roundtrips_through_json() {
    let error = SieveError::new(ErrorCode::DatabaseLocked, "database is locked")
        .with_context(ErrorContext::Retry {
            attempts: 5,
            waited_ms: 1500,
        });

    let back: SieveError = serde_json::from_str(&error.to_json()).expect("valid json");
    assert_eq!(back, error);
    assert!(back.is_lock());
}

#[test]
fn test_error_code_parsing() {
    let code: ErrorCode = "GEOSIEVE-1003".to_string().try_into().unwrap();
    assert_eq!(code, ErrorCode::PoolExhausted);
}

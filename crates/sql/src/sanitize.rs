use crate::error::SqlGenError;

pub fn validate_identifier(name: &str) -> Result<(), SqlGenError> {
    if name.is_empty() {
        return Err(SqlGenError::InvalidIdentifier("empty".to_string()));
    }
    if name.len() > 128 {
        return Err(SqlGenError::InvalidIdentifier(format!(
            "too long: {}",
            name.len()
        )));
    }
    if name.contains('"')
        || name.contains('\x00')
        || name.contains(';')
        || name.contains('`')
        || name.contains('\\')
    {
        return Err(SqlGenError::InvalidIdentifier(format!(
            "forbidden characters in: {}",
            name
        )));
    }
    Ok(())
}

/// Double-quoted identifier.
pub fn quote_ident(name: &str) -> Result<String, SqlGenError> {
    validate_identifier(name)?;
    Ok(format!("\"{}\"", name))
}

/// Dotted path of quoted identifiers, e.g. `"public"."roads"."geom"`.
pub fn quote_path(parts: &[&str]) -> Result<String, SqlGenError> {
    let quoted = parts
        .iter()
        .map(|p| quote_ident(p))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(quoted.join("."))
}

/// Single-quoted string literal with embedded quotes doubled.
pub fn quote_literal(value: &str) -> Result<String, SqlGenError> {
    if value.contains('\x00') {
        return Err(SqlGenError::InvalidLiteral("NUL byte in literal".to_string()));
    }
    Ok(format!("'{}'", value.replace('\'', "''")))
}

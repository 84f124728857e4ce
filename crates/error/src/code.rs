use serde::{Deserialize, Serialize};
use std::fmt;

/// Numeric error codes following GEOSIEVE-XXXX format.
///
/// ## Code Ranges
/// - **1000-1999**: Connection errors (trigger backend fallthrough)
/// - **2000-2999**: Expression and query errors (fail fast)
/// - **3000-3999**: Configuration errors
/// - **4000-4999**: Geometry errors
/// - **5000-5999**: Storage and resource errors
/// - **9000-9999**: Internal errors
///
/// Codes are stable across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
#[non_exhaustive]
pub enum ErrorCode {
    // === Connection Errors (1000-1999) ===
    /// GEOSIEVE-1001: Backend unreachable or connection refused
    ConnectionFailed = 1001,
    /// GEOSIEVE-1002: Network connection timeout
    ConnectionTimeout = 1002,
    /// GEOSIEVE-1003: Connection pool exhausted (acquire timed out)
    PoolExhausted = 1003,
    /// GEOSIEVE-1004: Circuit breaker is open for the backend
    CircuitOpen = 1004,
    /// GEOSIEVE-1005: Database driver or spatial extension unavailable
    DriverUnavailable = 1005,
    /// GEOSIEVE-1006: Pool was shut down
    PoolClosed = 1006,

    // === Expression / Query Errors (2000-2999) ===
    /// GEOSIEVE-2001: Malformed filter expression
    InvalidExpression = 2001,
    /// GEOSIEVE-2002: Function not supported by the evaluator
    UnsupportedFunction = 2002,
    /// GEOSIEVE-2003: Spatial predicate or buffer form not supported
    UnsupportedPredicate = 2003,
    /// GEOSIEVE-2004: Dataset has no resolvable primary key
    MissingPrimaryKey = 2004,
    /// GEOSIEVE-2005: Backend rejected the query
    QueryFailed = 2005,
    /// GEOSIEVE-2006: Request cancelled by the caller
    QueryCancelled = 2006,
    /// GEOSIEVE-2007: No backend supports the dataset
    UnsupportedDataset = 2007,

    // === Configuration Errors (3000-3999) ===
    /// GEOSIEVE-3001: Configuration value out of range
    InvalidConfig = 3001,
    /// GEOSIEVE-3002: Missing required field
    MissingRequiredField = 3002,
    /// GEOSIEVE-3003: Invalid connection string
    InvalidConnectionString = 3003,

    // === Geometry Errors (4000-4999) ===
    /// GEOSIEVE-4001: Geometry could not be parsed
    InvalidGeometry = 4001,
    /// GEOSIEVE-4002: Geometry could not be repaired
    GeometryRepairFailed = 4002,

    // === Storage / Resource Errors (5000-5999) ===
    /// GEOSIEVE-5001: Database file locked by another writer
    DatabaseLocked = 5001,
    /// GEOSIEVE-5002: Disk, memory or quota exhausted
    ResourceExhausted = 5002,
    /// GEOSIEVE-5003: Precomputed view could not be built
    ViewCreationFailed = 5003,
    /// GEOSIEVE-5004: I/O failure reading a dataset
    Io = 5004,

    // === Internal Errors (9000-9999) ===
    /// GEOSIEVE-9001: Serialization/deserialization failed
    SerializationFailed = 9001,
    /// GEOSIEVE-9002: Unexpected internal state or task panic
    InternalPanic = 9002,
    /// GEOSIEVE-9999: Unknown/unclassified error
    Unknown = 9999,
}

impl ErrorCode {
    /// Get the numeric code value
    pub fn as_u16(&self) -> u16 {
        *self as u16
    }

    /// Get the formatted code string (e.g., "GEOSIEVE-2001")
    pub fn as_str(&self) -> String {
        format!("GEOSIEVE-{:04}", self.as_u16())
    }

    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self.as_u16() {
            1000..=1999 => ErrorCategory::Connection,
            2000..=2999 => ErrorCategory::Expression,
            3000..=3999 => ErrorCategory::Config,
            4000..=4999 => ErrorCategory::Geometry,
            5000..=5999 => ErrorCategory::Storage,
            _ => ErrorCategory::Internal,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<ErrorCode> for String {
    fn from(code: ErrorCode) -> String {
        code.as_str()
    }
}

impl TryFrom<String> for ErrorCode {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        let num: u16 = s
            .strip_prefix("GEOSIEVE-")
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| "Invalid format".to_string())?;
        Self::try_from(num).map_err(|_| "Unknown code".to_string())
    }
}

impl TryFrom<u16> for ErrorCode {
    type Error = String;

    fn try_from(n: u16) -> std::result::Result<Self, Self::Error> {
        match n {
            1001 => Ok(Self::ConnectionFailed),
            1002 => Ok(Self::ConnectionTimeout),
            1003 => Ok(Self::PoolExhausted),
            1004 => Ok(Self::CircuitOpen),
            1005 => Ok(Self::DriverUnavailable),
            1006 => Ok(Self::PoolClosed),
            2001 => Ok(Self::InvalidExpression),
            2002 => Ok(Self::UnsupportedFunction),
            2003 => Ok(Self::UnsupportedPredicate),
            2004 => Ok(Self::MissingPrimaryKey),
            2005 => Ok(Self::QueryFailed),
            2006 => Ok(Self::QueryCancelled),
            2007 => Ok(Self::UnsupportedDataset),
            3001 => Ok(Self::InvalidConfig),
            3002 => Ok(Self::MissingRequiredField),
            3003 => Ok(Self::InvalidConnectionString),
            4001 => Ok(Self::InvalidGeometry),
            4002 => Ok(Self::GeometryRepairFailed),
            5001 => Ok(Self::DatabaseLocked),
            5002 => Ok(Self::ResourceExhausted),
            5003 => Ok(Self::ViewCreationFailed),
            5004 => Ok(Self::Io),
            9001 => Ok(Self::SerializationFailed),
            9002 => Ok(Self::InternalPanic),
            9999 => Ok(Self::Unknown),
            _ => Err(format!("Unknown error code: {}", n)),
        }
    }
}

/// High-level error category used for fallback and retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ErrorCategory {
    Connection,
    Expression,
    Config,
    Geometry,
    Storage,
    Internal,
}

//! Error types for the object tracker

use std::fmt;

/// Main error type for the object tracker
#[derive(Debug, Clone, PartialEq)]
pub enum TrackerError {
    // ============ Store Errors ============
    /// A stored status value is neither VALID nor INVALID
    UnknownStatus {
        value: String,
    },

    /// A stored row is missing a column the tracker relies on
    MalformedRow {
        table: String,
        column: String,
    },

    // ============ I/O and System Errors (XX000) ============
    /// PostgreSQL catalog operation failed
    CatalogError {
        operation: String,
        pg_error: String,
    },

    /// SPI operation failed
    SpiError {
        query: String,
        error: String,
    },

    /// Serialization/deserialization failed
    SerializationError {
        message: String,
    },

    /// Internal error (bug in extension)
    InternalError {
        message: String,
        file: &'static str,
        line: u32,
    },
}

impl TrackerError {
    /// Get PostgreSQL SQLSTATE code for this error
    pub fn sqlstate(&self) -> &'static str {
        use TrackerError::*;
        match self {
            UnknownStatus { .. } => "22023", // Invalid parameter value
            MalformedRow { .. } => "XX001", // Data corrupted

            CatalogError { .. } => "XX000",
            SpiError { .. } => "XX000",
            SerializationError { .. } => "22P02", // Invalid text representation
            InternalError { .. } => "XX000",
        }
    }

    /// Create internal error with file/line info
    pub fn internal(message: String, file: &'static str, line: u32) -> Self {
        TrackerError::InternalError { message, file, line }
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

impl fmt::Display for TrackerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use TrackerError::*;
        match self {
            UnknownStatus { value } => {
                write!(f, "Unknown object status '{}' (expected VALID or INVALID)", value)
            }
            MalformedRow { table, column } => {
                write!(f, "Row in {} has no value for column '{}'", table, column)
            }
            CatalogError { operation, pg_error } => {
                write!(f, "Catalog operation '{}' failed: {}", operation, pg_error)
            }
            SpiError { query, error } => {
                write!(f, "SPI query failed: {}\nQuery: {}", error, truncate(query, 100))
            }
            SerializationError { message } => {
                write!(f, "Serialization error: {}", message)
            }
            InternalError { message, file, line } => {
                write!(f, "Internal error at {}:{}: {}\nPlease report this bug.",
                       file, line, message)
            }
        }
    }
}

impl std::error::Error for TrackerError {}

/// Result type for tracker operations
pub type TrackerResult<T> = Result<T, TrackerError>;

/// Convert SpiError to TrackerError
impl From<pgrx::spi::Error> for TrackerError {
    fn from(e: pgrx::spi::Error) -> Self {
        TrackerError::SpiError {
            query: "Unknown".to_string(),
            error: e.to_string(),
        }
    }
}

/// Convert serde_json::Error to TrackerError
impl From<serde_json::Error> for TrackerError {
    fn from(e: serde_json::Error) -> Self {
        TrackerError::SerializationError {
            message: format!("JSON serialization error: {}", e),
        }
    }
}

/// Helper macro for creating internal errors with automatic file/line
#[macro_export]
macro_rules! internal_error {
    ($msg:expr) => {
        $crate::error::TrackerError::internal($msg.to_string(), file!(), line!())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::TrackerError::internal(format!($fmt, $($arg)*), file!(), line!())
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_status_message() {
        let err = TrackerError::UnknownStatus {
            value: "BROKEN".to_string(),
        };

        let msg = err.to_string();
        assert!(msg.contains("BROKEN"));
        assert!(msg.contains("VALID or INVALID"));
        assert_eq!(err.sqlstate(), "22023");
    }

    #[test]
    fn test_spi_error_truncates_long_query() {
        let err = TrackerError::SpiError {
            query: "x".repeat(500),
            error: "boom".to_string(),
        };

        let msg = err.to_string();
        assert!(msg.contains("boom"));
        assert!(msg.len() < 200);
    }

    #[test]
    fn test_internal_error_macro() {
        let err = internal_error!("Test error at {}", "location");

        match err {
            TrackerError::InternalError { message, file, line } => {
                assert!(message.contains("Test error"));
                assert!(file.ends_with("mod.rs"));
                assert!(line > 0);
            }
            _ => panic!("Wrong error type"),
        }
    }

    #[test]
    fn test_serde_error_converts() {
        let parse: Result<serde_json::Value, _> = serde_json::from_str("{not json");
        let err: TrackerError = parse.unwrap_err().into();

        assert_eq!(err.sqlstate(), "22P02");
        assert!(err.to_string().starts_with("Serialization error"));
    }
}

use thiserror::Error;

/// Errors raised while exporting a table. Every variant is terminal for the
/// export that produced it.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("Unsupported source type '{source_type}'{}", column_suffix(.column))]
    UnsupportedType {
        column: Option<String>,
        source_type: String,
    },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Commit failed: {0}")]
    Commit(String),

    #[error("Type mismatch for column '{column}': expected {expected}, found {found}")]
    TypeMismatch {
        column: String,
        expected: String,
        found: String,
    },

    #[error("Row has {found} values but the schema has {expected} fields")]
    ColumnCountMismatch {
        expected: usize,
        found: usize,
    },

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Schema introspection failed: {0}")]
    Introspection(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Export cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{primary} (cleanup also failed: {})", join_errors(.cleanup))]
    WithCleanupErrors {
        primary: Box<ExportError>,
        cleanup: Vec<ExportError>,
    },
}

impl ExportError {
    pub fn type_mismatch(column: &str, expected: impl ToString, found: impl ToString) -> Self {
        Self::TypeMismatch {
            column: column.to_string(),
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }

    /// Attach release failures to the error that triggered the release.
    /// Returns `primary` untouched when nothing failed during cleanup.
    pub fn with_cleanup(primary: ExportError, cleanup: Vec<ExportError>) -> Self {
        if cleanup.is_empty() {
            primary
        } else {
            Self::WithCleanupErrors {
                primary: Box::new(primary),
                cleanup,
            }
        }
    }

    /// The error that ended the export, looking through cleanup wrappers.
    pub fn primary(&self) -> &ExportError {
        match self {
            Self::WithCleanupErrors { primary, .. } => primary.primary(),
            other => other,
        }
    }

    pub fn is_cleanup_failure(&self) -> bool {
        matches!(self, Self::WithCleanupErrors { .. })
    }
}

fn column_suffix(column: &Option<String>) -> String {
    column
        .as_ref()
        .map(|name| format!(" for column '{}'", name))
        .unwrap_or_default()
}

fn join_errors(errors: &[ExportError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<std::io::Error> for ExportError {
    fn from(error: std::io::Error) -> Self {
        ExportError::Io(error.to_string())
    }
}

impl From<arrow::error::ArrowError> for ExportError {
    fn from(error: arrow::error::ArrowError) -> Self {
        ExportError::Serialization(error.to_string())
    }
}

impl From<parquet::errors::ParquetError> for ExportError {
    fn from(error: parquet::errors::ParquetError) -> Self {
        ExportError::Serialization(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_cleanup_keeps_primary_when_nothing_failed() {
        let error = ExportError::with_cleanup(ExportError::Cancelled, vec![]);
        assert!(matches!(error, ExportError::Cancelled));
        assert!(!error.is_cleanup_failure());
    }

    #[test]
    fn test_with_cleanup_surfaces_both_errors() {
        let error = ExportError::with_cleanup(
            ExportError::type_mismatch("id", "Int32", "Text"),
            vec![ExportError::Transaction("rollback failed".to_string())],
        );

        assert!(error.is_cleanup_failure());
        assert!(matches!(error.primary(), ExportError::TypeMismatch { .. }));
        let message = error.to_string();
        assert!(message.contains("expected Int32, found Text"));
        assert!(message.contains("rollback failed"));
    }
}

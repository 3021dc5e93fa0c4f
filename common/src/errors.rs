// Error handling framework
// Expression, store, formatter and facade errors

use thiserror::Error;

/// Schedule expression errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExpressionError {
    #[error("Malformed expression '{expression}': {reason}")]
    Malformed { expression: String, reason: String },

    #[error("Unrecognized expression format: {0}")]
    Unrecognized(String),

    #[error("No duration found: at least one duration field or a start date is required")]
    EmptyDuration,
}

impl ExpressionError {
    pub fn malformed(expression: impl Into<String>, reason: impl Into<String>) -> Self {
        ExpressionError::Malformed {
            expression: expression.into(),
            reason: reason.into(),
        }
    }
}

/// SQL template formatting errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("Invalid parameter index: {0}")]
    InvalidIndex(String),

    #[error("Parameter ${0} is a list, use :csv to format it")]
    ListWithoutCsv(usize),

    #[error("Parameter ${0} is a JSON object, use :json to stringify it")]
    ObjectWithoutJson(usize),

    #[error("Invalid table name: {0}")]
    InvalidTableName(String),
}

/// Job store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Query formatting failed: {0}")]
    Format(#[from] FormatError),

    #[error("Failed to decode job row: {0}")]
    Decode(String),
}

/// Scheduler facade errors
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Invalid worker options: {0}")]
    InvalidOptions(String),

    #[error("Handler failed for job {queue}/{id}: {reason}")]
    HandlerFailure {
        queue: String,
        id: String,
        reason: String,
    },
}

// Implement From for common external errors
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Unavailable(err.to_string()),
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                StoreError::Decode(err.to_string())
            }
            sqlx::Error::Database(db_err) => StoreError::Query(db_err.message().to_string()),
            _ => StoreError::Query(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_expression_display() {
        let err = ExpressionError::malformed("R/invalid", "invalid duration");
        assert!(err.to_string().contains("R/invalid"));
        assert!(err.to_string().contains("invalid duration"));
    }

    #[test]
    fn test_expression_error_converts_to_scheduler_error() {
        let err: SchedulerError = ExpressionError::EmptyDuration.into();
        assert!(matches!(
            err,
            SchedulerError::Expression(ExpressionError::EmptyDuration)
        ));
    }

    #[test]
    fn test_format_error_converts_to_store_error() {
        let err: StoreError = FormatError::ListWithoutCsv(3).into();
        assert!(err.to_string().contains("$3"));
    }

    #[test]
    fn test_pool_timeout_is_unavailable() {
        let err: StoreError = sqlx::Error::PoolTimedOut.into();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }
}

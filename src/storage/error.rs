use thiserror::Error;

/// Storage-specific errors that can occur during database operations.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Database connection or query execution error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Backend unreachable or temporarily overloaded
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// Malformed row or constraint violation, retrying cannot help
    #[error("Malformed write: {0}")]
    Malformed(String),
}

/// Whether a failed storage call is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
}

impl StorageError {
    pub fn class(&self) -> ErrorClass {
        match self {
            StorageError::Unavailable(_) => ErrorClass::Transient,
            StorageError::Malformed(_) => ErrorClass::Permanent,
            StorageError::Database(err) => classify_sqlx(err),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

fn classify_sqlx(err: &sqlx::Error) -> ErrorClass {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Protocol(_)
        | sqlx::Error::WorkerCrashed => ErrorClass::Transient,
        sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
            // serialization_failure, deadlock_detected
            Some("40001") | Some("40P01") => ErrorClass::Transient,
            // connection exceptions, insufficient resources, admin shutdown
            Some(code)
                if code.starts_with("08") || code.starts_with("53") || code.starts_with("57") =>
            {
                ErrorClass::Transient
            }
            _ => ErrorClass::Permanent,
        },
        _ => ErrorClass::Permanent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_is_transient() {
        let err = StorageError::Unavailable("connection refused".to_string());
        assert!(err.is_transient());
    }

    #[test]
    fn test_malformed_is_permanent() {
        let err = StorageError::Malformed("NaN timestamp".to_string());
        assert_eq!(err.class(), ErrorClass::Permanent);
    }

    #[test]
    fn test_pool_timeout_is_transient() {
        let err = StorageError::Database(sqlx::Error::PoolTimedOut);
        assert!(err.is_transient());
    }

    #[test]
    fn test_row_not_found_is_permanent() {
        let err = StorageError::Database(sqlx::Error::RowNotFound);
        assert_eq!(err.class(), ErrorClass::Permanent);
    }
}

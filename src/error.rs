use thiserror::Error;

/// Error taxonomy for the reconciliation core.
///
/// Classification is typed from the store upward; callers must never have to
/// inspect message text to decide how to react.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(anyhow::Error),

    #[error("Already exists: {0}")]
    AlreadyExists(anyhow::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(anyhow::Error),

    #[error("Conflict: {0}")]
    Conflict(anyhow::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Whether a bounded retry may succeed. Only `Internal` errors are
    /// treated as transient; everything else is a permanent outcome.
    pub fn is_transient(&self) -> bool {
        matches!(self, AppError::Internal(_))
    }

    /// Classify a sqlx error, attaching the operation context to the cause.
    pub fn from_sqlx(err: sqlx::Error, context: &'static str) -> Self {
        match AppError::from(err) {
            AppError::NotFound(e) => AppError::NotFound(e.context(context)),
            AppError::AlreadyExists(e) => AppError::AlreadyExists(e.context(context)),
            AppError::InvalidInput(e) => AppError::InvalidInput(e.context(context)),
            AppError::Conflict(e) => AppError::Conflict(e.context(context)),
            AppError::Internal(e) => AppError::Internal(e.context(context)),
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        if matches!(err, sqlx::Error::RowNotFound) {
            return AppError::NotFound(anyhow::Error::new(err));
        }
        if let sqlx::Error::Database(db) = &err {
            if db.is_unique_violation() {
                return AppError::AlreadyExists(anyhow::Error::new(err));
            }
        }
        AppError::Internal(anyhow::Error::new(err))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Internal(anyhow::Error::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_not_found_maps_to_not_found() {
        let err = AppError::from(sqlx::Error::RowNotFound);
        assert!(matches!(err, AppError::NotFound(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn serde_errors_map_to_internal() {
        let parse_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = AppError::from(parse_err);
        assert!(matches!(err, AppError::Internal(_)));
        assert!(err.is_transient());
    }
}

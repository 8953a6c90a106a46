use std::fmt;

/// Classification of storage failures.
///
/// Unique-constraint violations are their own kind because the refund dedupe
/// path recovers from them by rereading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseErrorKind {
    NotFound { entity: String, id: String },
    UniqueViolation { constraint: Option<String> },
    ConnectionError { message: String },
    CorruptRow { entity: String, message: String },
    QueryError { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseError {
    pub kind: DatabaseErrorKind,
}

impl DatabaseError {
    pub fn new(kind: DatabaseErrorKind) -> Self {
        Self { kind }
    }

    pub fn unique_violation(constraint: impl Into<String>) -> Self {
        Self::new(DatabaseErrorKind::UniqueViolation {
            constraint: Some(constraint.into()),
        })
    }

    pub fn corrupt(entity: &str, message: impl fmt::Display) -> Self {
        Self::new(DatabaseErrorKind::CorruptRow {
            entity: entity.to_string(),
            message: message.to_string(),
        })
    }

    pub fn is_unique_violation(&self) -> bool {
        matches!(self.kind, DatabaseErrorKind::UniqueViolation { .. })
    }

    /// Connection-level failures may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, DatabaseErrorKind::ConnectionError { .. })
    }

    #[cfg(feature = "database")]
    pub fn from_sqlx(err: sqlx::Error) -> Self {
        let kind = match &err {
            sqlx::Error::RowNotFound => DatabaseErrorKind::NotFound {
                entity: "row".to_string(),
                id: String::new(),
            },
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                DatabaseErrorKind::UniqueViolation {
                    constraint: db.constraint().map(str::to_string),
                }
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                DatabaseErrorKind::ConnectionError {
                    message: err.to_string(),
                }
            }
            _ => DatabaseErrorKind::QueryError {
                message: err.to_string(),
            },
        };
        Self { kind }
    }
}

impl fmt::Display for DatabaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            DatabaseErrorKind::NotFound { entity, id } => write!(f, "{} not found: {}", entity, id),
            DatabaseErrorKind::UniqueViolation { constraint } => write!(
                f,
                "unique constraint violated: {}",
                constraint.as_deref().unwrap_or("unknown")
            ),
            DatabaseErrorKind::ConnectionError { message } => {
                write!(f, "database connection error: {}", message)
            }
            DatabaseErrorKind::CorruptRow { entity, message } => {
                write!(f, "corrupt {} row: {}", entity, message)
            }
            DatabaseErrorKind::QueryError { message } => write!(f, "query failed: {}", message),
        }
    }
}

impl std::error::Error for DatabaseError {}

pub type DatabaseResult<T> = Result<T, DatabaseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_violation_is_classified() {
        let err = DatabaseError::unique_violation("uk_refund_dedupe");
        assert!(err.is_unique_violation());
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "unique constraint violated: uk_refund_dedupe");
    }
}

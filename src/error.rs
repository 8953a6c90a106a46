//! Application error taxonomy for the reconciliation core.
//!
//! Every engine operation returns [`AppResult`]; callers match on
//! [`AppErrorKind`] instead of catching by type. `Conflict` covers CAS losses,
//! terminal or stale state and mismatched external ids, and is always safe to
//! retry verbatim. `Gateway` failures leave local state untouched.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::database::error::{DatabaseError, DatabaseErrorKind};
use crate::payments::error::PaymentError;

/// Machine-readable error codes returned to HTTP clients
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NotFound,
    Conflict,
    IllegalParam,
    GatewayError,
    RateLimitError,
    DatabaseError,
    CacheError,
    ConfigurationError,
    InternalError,
}

/// Infrastructure-level errors (database, cache, configuration)
#[derive(Debug, Clone)]
pub enum InfrastructureError {
    Database { message: String, is_retryable: bool },
    Cache { message: String },
    Configuration { message: String },
}

#[derive(Debug, Clone)]
pub enum AppErrorKind {
    /// Referenced order, attempt or refund is missing.
    NotFound { entity: String, id: String },
    Conflict { reason: String },
    /// Malformed or missing caller input, rejected before any lock is taken.
    IllegalParam { field: String, reason: String },
    Gateway(PaymentError),
    Infrastructure(InfrastructureError),
}

#[derive(Debug, Clone)]
pub struct AppError {
    pub kind: AppErrorKind,
    pub request_id: Option<String>,
    pub context: Option<String>,
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn new(kind: AppErrorKind) -> Self {
        Self {
            kind,
            request_id: None,
            context: None,
        }
    }

    pub fn not_found(entity: &str, id: impl fmt::Display) -> Self {
        Self::new(AppErrorKind::NotFound {
            entity: entity.to_string(),
            id: id.to_string(),
        })
    }

    pub fn conflict(reason: impl Into<String>) -> Self {
        Self::new(AppErrorKind::Conflict {
            reason: reason.into(),
        })
    }

    pub fn illegal_param(field: &str, reason: impl Into<String>) -> Self {
        Self::new(AppErrorKind::IllegalParam {
            field: field.to_string(),
            reason: reason.into(),
        })
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self.kind, AppErrorKind::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.kind, AppErrorKind::NotFound { .. })
    }

    pub fn is_illegal_param(&self) -> bool {
        matches!(self.kind, AppErrorKind::IllegalParam { .. })
    }

    pub fn is_gateway(&self) -> bool {
        matches!(self.kind, AppErrorKind::Gateway(_))
    }

    /// Map error to HTTP status code
    pub fn status_code(&self) -> u16 {
        match &self.kind {
            AppErrorKind::NotFound { .. } => 404,
            AppErrorKind::Conflict { .. } => 409,
            AppErrorKind::IllegalParam { .. } => 400,
            AppErrorKind::Gateway(err) => match err {
                PaymentError::RateLimitError { .. } => 429,
                PaymentError::NetworkError { .. } => 504,
                _ => 502,
            },
            AppErrorKind::Infrastructure(_) => 500,
        }
    }

    pub fn error_code(&self) -> ErrorCode {
        match &self.kind {
            AppErrorKind::NotFound { .. } => ErrorCode::NotFound,
            AppErrorKind::Conflict { .. } => ErrorCode::Conflict,
            AppErrorKind::IllegalParam { .. } => ErrorCode::IllegalParam,
            AppErrorKind::Gateway(PaymentError::RateLimitError { .. }) => ErrorCode::RateLimitError,
            AppErrorKind::Gateway(_) => ErrorCode::GatewayError,
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { .. } => ErrorCode::DatabaseError,
                InfrastructureError::Cache { .. } => ErrorCode::CacheError,
                InfrastructureError::Configuration { .. } => ErrorCode::ConfigurationError,
            },
        }
    }

    pub fn user_message(&self) -> String {
        match &self.kind {
            AppErrorKind::NotFound { entity, id } => format!("{} '{}' not found", entity, id),
            AppErrorKind::Conflict { reason } => format!("Conflict: {}", reason),
            AppErrorKind::IllegalParam { field, reason } => {
                format!("Invalid parameter '{}': {}", field, reason)
            }
            AppErrorKind::Gateway(err) => err.user_message(),
            AppErrorKind::Infrastructure(_) => {
                "Service temporarily unavailable. Please try again later".to_string()
            }
        }
    }

    /// Conflicts are retryable because every write path is idempotent.
    pub fn is_retryable(&self) -> bool {
        match &self.kind {
            AppErrorKind::NotFound { .. } | AppErrorKind::IllegalParam { .. } => false,
            AppErrorKind::Conflict { .. } => true,
            AppErrorKind::Gateway(err) => err.is_retryable(),
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { is_retryable, .. } => *is_retryable,
                InfrastructureError::Cache { .. } => true,
                InfrastructureError::Configuration { .. } => false,
            },
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            AppErrorKind::Infrastructure(InfrastructureError::Database { message, .. }) => {
                write!(f, "database error: {}", message)
            }
            AppErrorKind::Infrastructure(InfrastructureError::Cache { message }) => {
                write!(f, "cache error: {}", message)
            }
            AppErrorKind::Infrastructure(InfrastructureError::Configuration { message }) => {
                write!(f, "configuration error: {}", message)
            }
            AppErrorKind::Gateway(err) => write!(f, "gateway error: {}", err),
            _ => write!(f, "{}", self.user_message()),
        }?;
        if let Some(context) = &self.context {
            write!(f, " ({})", context)?;
        }
        Ok(())
    }
}

impl std::error::Error for AppError {}

impl From<DatabaseError> for AppError {
    fn from(err: DatabaseError) -> Self {
        let kind = match &err.kind {
            DatabaseErrorKind::NotFound { entity, id } => AppErrorKind::NotFound {
                entity: entity.clone(),
                id: id.clone(),
            },
            DatabaseErrorKind::UniqueViolation { .. } => AppErrorKind::Conflict {
                reason: err.to_string(),
            },
            _ => AppErrorKind::Infrastructure(InfrastructureError::Database {
                message: err.to_string(),
                is_retryable: err.is_retryable(),
            }),
        };
        AppError::new(kind)
    }
}

impl From<PaymentError> for AppError {
    fn from(err: PaymentError) -> Self {
        AppError::new(AppErrorKind::Gateway(err))
    }
}

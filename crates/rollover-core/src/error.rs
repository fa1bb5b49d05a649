// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for rollover-core.
//!
//! Provides a unified error type with stable, machine-readable error codes
//! that the HTTP layer maps onto status codes.

use thiserror::Error;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur while running a rollover.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// User was not found in the database.
    #[error("User '{user_id}' not found")]
    UserNotFound {
        /// The user ID that was not found.
        user_id: String,
    },

    /// Task was not found in the database.
    #[error("Task '{task_id}' not found")]
    TaskNotFound {
        /// The task ID that was not found.
        task_id: String,
    },

    /// The cron lease held by this execution was no longer current at release.
    ///
    /// Happens when the lease expired and another execution took it over,
    /// or an operator force-released it.
    #[error("Cron lease for user '{user_id}' was lost before release")]
    CronLeaseLost {
        /// The user whose lease was lost.
        user_id: String,
    },

    /// Input validation failed.
    #[error("Validation error for '{field}': {message}")]
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// A stored row could not be decoded into a domain value.
    #[error("Corrupt {entity} record '{id}': {details}")]
    CorruptRecord {
        /// Entity kind (user, task, group).
        entity: &'static str,
        /// Record identifier.
        id: String,
        /// What was wrong with it.
        details: String,
    },

    /// Database operation failed.
    #[error("Database error during '{operation}': {details}")]
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::UserNotFound { .. } => "USER_NOT_FOUND",
            Self::TaskNotFound { .. } => "TASK_NOT_FOUND",
            Self::CronLeaseLost { .. } => "CRON_LEASE_LOST",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::CorruptRecord { .. } => "CORRUPT_RECORD",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }

    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::DatabaseError { .. })
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for CoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        CoreError::DatabaseError {
            operation: "migrate".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::DatabaseError {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}

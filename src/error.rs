use chrono::{DateTime, Utc};
use thiserror::Error;

/// Main error type for the coordination core
#[derive(Error, Debug)]
pub enum IbcError {
    // Lease errors
    #[error("Lock {name} is held by {holder} until {expires_at}")]
    LockHeld {
        name: String,
        holder: String,
        expires_at: DateTime<Utc>,
    },

    #[error("Lock {name} is not owned by {holder} with fencing token {token}")]
    LockNotOwned {
        name: String,
        holder: String,
        token: i64,
    },

    // Pub-sub errors
    #[error(
        "Subscription {subscriber} on {channel} lags retention: cursor {cursor} < pruned through {pruned_through}"
    )]
    SubscriptionLag {
        channel: String,
        subscriber: String,
        cursor: i64,
        pruned_through: i64,
    },

    #[error("Notification callback failed: {0}")]
    Callback(String),

    // Database errors
    #[error("Database connection lost: {0}")]
    ConnectionLost(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for IbcError
pub type Result<T> = std::result::Result<T, IbcError>;

impl IbcError {
    /// Infrastructure failures that are worth retrying locally with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            IbcError::ConnectionLost(_) => true,
            IbcError::Database(err) => is_transient_sqlx(err),
            _ => false,
        }
    }

    /// The caller no longer owns the lease it believes it holds.
    pub fn is_ownership_loss(&self) -> bool {
        matches!(self, IbcError::LockNotOwned { .. })
    }

    pub fn lock_not_owned(name: &str, holder: &str, token: i64) -> Self {
        IbcError::LockNotOwned {
            name: name.to_string(),
            holder: holder.to_string(),
            token,
        }
    }
}

fn is_transient_sqlx(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::WorkerCrashed => true,
        // serialization_failure, deadlock_detected
        sqlx::Error::Database(db) => matches!(db.code().as_deref(), Some("40001") | Some("40P01")),
        _ => false,
    }
}

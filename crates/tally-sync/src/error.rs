//! # Sync Error Types
//!
//! Error types for sync operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Transport     │  │     Session             │ │
//! │  │                 │  │   (retryable)   │  │   (never retried)       │ │
//! │  │  InvalidConfig  │  │  Network        │  │  Auth                   │ │
//! │  │  InvalidUrl     │  │  Timeout        │  │                         │ │
//! │  │  ConfigLoad/Save│  │                 │  │                         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │    Storage      │  │     Round       │  │      Internal           │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  Database       │  │  AlreadySyncing │  │  ChannelError           │ │
//! │  │  Core           │  │  Serialization  │  │  ShuttingDown           │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Conflicts are not errors: they travel as data on a successful outcome.

use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering all possible sync failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid sync configuration.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Invalid remote store URL.
    #[error("Invalid remote URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// The remote store could not be reached or answered with a server error.
    #[error("Network error: {0}")]
    Network(String),

    /// One network attempt exceeded its deadline.
    #[error("Request timeout after {0} seconds")]
    Timeout(u64),

    // =========================================================================
    // Session Errors
    // =========================================================================
    /// The remote store refused the credential, or it could not be refreshed.
    #[error("Authentication required: {0}")]
    Auth(String),

    // =========================================================================
    // Round Errors
    // =========================================================================
    /// A round is already running on this replica.
    #[error("A sync is already in progress")]
    AlreadySyncing,

    /// A document or record could not be encoded or decoded.
    #[error("Serialization failed: {0}")]
    Serialization(String),

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// Local Store failure.
    #[error("Database error: {0}")]
    Database(#[from] tally_db::DbError),

    /// Domain rule or merge precondition violated.
    #[error(transparent)]
    Core(#[from] tally_core::CoreError),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal sync agent error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Agent is shutting down.
    #[error("Sync agent is shutting down")]
    ShuttingDown,

    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return SyncError::Serialization(err.to_string());
        }
        match err.status() {
            Some(s) if s.as_u16() == 401 || s.as_u16() == 403 => SyncError::Auth(err.to_string()),
            _ => SyncError::Network(err.to_string()),
        }
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Returns true if the failed network attempt may be retried.
    ///
    /// ## Retryable Errors
    /// - Network failures (unreachable, 5xx)
    /// - Timeouts
    ///
    /// ## Non-Retryable Errors
    /// - Authorization failures
    /// - Everything local (config, database, serialization)
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Network(_) | SyncError::Timeout(_))
    }

    /// Returns true if the user has to sign in again.
    pub fn is_auth_error(&self) -> bool {
        matches!(self, SyncError::Auth(_))
    }
}

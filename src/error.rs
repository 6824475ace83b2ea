//! Error types for the page preparation pipeline

use thiserror::Error;

/// Result type alias for preparation operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while preparing a page
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to set up the session (HTTP client, configuration, ...)
    #[error("Session initialization failed: {0}")]
    InitializationError(String),

    /// Failed to fetch a referenced resource
    #[error("Failed to fetch resource: {0}")]
    FetchError(String),

    /// A stored resource handle could not be resolved
    #[error("Unknown resource handle: {0}")]
    ResourceError(String),

    /// A registered plugin reported a failure
    #[error("Plugin failed: {0}")]
    PluginError(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

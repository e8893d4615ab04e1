//! Unified error handling for Skymonitor
//!
//! This crate provides a single error type used across all Skymonitor
//! components. It uses thiserror for ergonomic error definitions with proper
//! Display and Error trait impls.

use std::io;
use std::path::PathBuf;

/// Result type alias using SkymonitorError
pub type Result<T> = std::result::Result<T, SkymonitorError>;

/// Unified error type for all Skymonitor operations
#[derive(thiserror::Error, Debug)]
pub enum SkymonitorError {
    // ========================================================================
    // I/O and File System Errors
    // ========================================================================
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: io::Error,
    },

    #[error("Failed to write file {path}: {source}")]
    FileWrite {
        path: PathBuf,
        source: io::Error,
    },

    // ========================================================================
    // Sensor Fetch Errors
    // ========================================================================
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Invalid endpoint URL {url}: {reason}")]
    InvalidEndpoint {
        url: String,
        reason: String,
    },

    #[error("Sensor data stale: {age_seconds:.0}s old (max {max_age_seconds:.0}s)")]
    StaleData {
        age_seconds: f64,
        max_age_seconds: f64,
    },

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Serial read failed: {0}")]
    Serial(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    // ========================================================================
    // Derived Computation Errors
    // ========================================================================
    #[error("Math domain error in {function}: {reason}")]
    MathDomain {
        function: &'static str,
        reason: String,
    },

    // ========================================================================
    // Configuration Errors
    // ========================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    // ========================================================================
    // API / Protocol Errors
    // ========================================================================
    #[error("Invalid actuator command: {0}")]
    InvalidCommand(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Message too large: {size} bytes (max {max_size} bytes)")]
    MessageTooLarge {
        size: usize,
        max_size: usize,
    },

    // ========================================================================
    // Generic Errors
    // ========================================================================
    #[error("{0}")]
    Generic(String),
}

impl SkymonitorError {
    /// Create a generic error from a string
    pub fn generic(msg: impl Into<String>) -> Self {
        Self::Generic(msg.into())
    }

    /// Create a config error from a string
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an HTTP fetch error from a string
    pub fn http(msg: impl Into<String>) -> Self {
        Self::Http(msg.into())
    }

    /// Create a math domain error
    pub fn math_domain(function: &'static str, reason: impl Into<String>) -> Self {
        Self::MathDomain {
            function,
            reason: reason.into(),
        }
    }
}

// Allow converting from String to SkymonitorError
impl From<String> for SkymonitorError {
    fn from(s: String) -> Self {
        Self::Generic(s)
    }
}

// Allow converting from &str to SkymonitorError
impl From<&str> for SkymonitorError {
    fn from(s: &str) -> Self {
        Self::Generic(s.to_string())
    }
}

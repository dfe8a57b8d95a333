//! # Tracking Error Types
//!
//! All errors that can occur in the tracking and reporting layer.

use thiserror::Error;

/// Errors that can occur in the tracking system.
#[derive(Error, Debug)]
pub enum TrackerError {
    /// A block handed to the free hook carries no valid tracking header.
    #[error("invalid free of {address:#x}: {reason}")]
    InvalidFree {
        /// Address passed to the free hook.
        address: usize,
        /// What was wrong with the header.
        reason: &'static str,
    },

    /// The symbol system was initialized twice.
    #[error("symbol system already initialized")]
    SymbolSystemActive,

    /// The configuration file could not be parsed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] toml::de::Error),

    /// Reading a configuration file or writing a report failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for tracking operations.
pub type TrackerResult<T> = Result<T, TrackerError>;

//! Error types for the DHCP server.
//!
//! All fallible operations in this crate return [`Result<T>`], which uses
//! the [`Error`] enum for error variants.

/// Errors that can occur during DHCP server operation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File system or network I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (config file).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Datagram that is not a DHCP message.
    ///
    /// Shorter than the fixed header, wrong magic cookie, or an option area
    /// that cannot be walked without reading past the datagram.
    #[error("Malformed DHCP packet: {0}")]
    MalformedPacket(String),

    /// An option could not be written to a reply.
    ///
    /// The data violates the length rule for its code, is longer than 255
    /// bytes, does not fit, or was written at the wrong offset. The reply
    /// being built must be abandoned.
    #[error("Invalid option {code}: {reason}")]
    InvalidOption { code: u8, reason: String },

    /// Invalid server configuration.
    ///
    /// `field` names the offending entry, e.g. `routers[1]` or `prefix_len`.
    #[error("Invalid configuration for {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    /// The address pool is already holding `capacity` entries.
    #[error("Address pool is full (capacity {capacity})")]
    PoolFull { capacity: usize },

    /// Socket creation or configuration error.
    ///
    /// Typically occurs when binding to port 67 without the required
    /// privileges, or when the named interface doesn't exist.
    #[error("Socket error: {0}")]
    Socket(String),
}

impl Error {
    pub(crate) fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_option(code: u8, reason: impl Into<String>) -> Self {
        Self::InvalidOption {
            code,
            reason: reason.into(),
        }
    }
}

/// A specialized Result type for DHCP operations.
pub type Result<T> = std::result::Result<T, Error>;

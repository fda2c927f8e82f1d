//! Error types shared across the crate.

use std::fmt::{Display, Formatter};

/// Shared crate result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Error enumeration covering every failure mode of the protocol engine.
///
/// Variants split along propagation lines: `Protocol`, `Control`, `Timeout`
/// and `Permission` are local to one frame or one request, while `Launch`,
/// `Execution` and `Cancelled` end a whole execution.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Working directory or other input path failed validation.
    InvalidPath(String),
    /// No usable agent executable could be located.
    Discovery(String),
    /// Process start or pipe setup failed.
    Launch(String),
    /// Malformed frame or envelope on the wire.
    Protocol(String),
    /// Control response explicitly marked as an error by the peer.
    Control(String),
    /// A bounded wait elapsed.
    Timeout(String),
    /// An operation was told to stop.
    Cancelled(String),
    /// The agent process exited unsuccessfully.
    Execution(String),
    /// Operation attempted after explicit close.
    Closed(String),
    /// A decision authority refused a tool invocation.
    Permission(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// File-system or stream I/O failure.
    Io(String),
}

impl AppError {
    /// Bare reason text without the category prefix.
    ///
    /// Used when the reason is echoed back to the agent inside a control
    /// envelope, where the `Display` prefix would be noise.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Config(msg)
            | Self::InvalidPath(msg)
            | Self::Discovery(msg)
            | Self::Launch(msg)
            | Self::Protocol(msg)
            | Self::Control(msg)
            | Self::Timeout(msg)
            | Self::Cancelled(msg)
            | Self::Execution(msg)
            | Self::Closed(msg)
            | Self::Permission(msg)
            | Self::NotFound(msg)
            | Self::Io(msg) => msg,
        }
    }

    /// Whether this error ends the whole execution rather than one request.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Discovery(_) | Self::Launch(_) | Self::Execution(_) | Self::Cancelled(_)
        )
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::InvalidPath(msg) => write!(f, "invalid path: {msg}"),
            Self::Discovery(msg) => write!(f, "discovery: {msg}"),
            Self::Launch(msg) => write!(f, "launch: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::Control(msg) => write!(f, "control: {msg}"),
            Self::Timeout(msg) => write!(f, "timeout: {msg}"),
            Self::Cancelled(msg) => write!(f, "cancelled: {msg}"),
            Self::Execution(msg) => write!(f, "execution: {msg}"),
            Self::Closed(msg) => write!(f, "closed: {msg}"),
            Self::Permission(msg) => write!(f, "permission: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(format!("malformed json: {err}"))
    }
}

use std::fmt;
use std::time::Duration;

/// Result alias that carries the custom [`PoseTransferError`] type.
pub type Result<T> = std::result::Result<T, PoseTransferError>;

/// Coarse classification of a failure, used for exit codes and the pipeline
/// state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    MissingRig,
    ExportFailed,
    PreviewRender,
    ExternalToolInvocation,
    ExternalToolTimeout,
    SettingsIo,
    InvalidSkeleton,
    Cancelled,
    Other,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::MissingRig => "missing rig",
            ErrorKind::ExportFailed => "export failed",
            ErrorKind::PreviewRender => "preview render failed",
            ErrorKind::ExternalToolInvocation => "external tool invocation failed",
            ErrorKind::ExternalToolTimeout => "external tool timed out",
            ErrorKind::SettingsIo => "settings io",
            ErrorKind::InvalidSkeleton => "invalid skeleton",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Other => "error",
        };
        f.write_str(name)
    }
}

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum PoseTransferError {
    /// An imported file (or the in-memory skeleton) carries no armature.
    #[error("no armature found in {context}")]
    MissingRig { context: String },
    /// The external serialization call failed. `diagnostic` is the tool output
    /// exactly as captured.
    #[error("export failed: {diagnostic}")]
    ExportFailed { diagnostic: String },
    /// Re-imported export had no armature, or the render call failed.
    #[error("preview render failed: {diagnostic}")]
    PreviewRender { diagnostic: String },
    #[error("could not run `{program}`: {diagnostic}")]
    ExternalToolInvocation { program: String, diagnostic: String },
    #[error("`{program}` did not finish within {timeout:?}")]
    ExternalToolTimeout { program: String, timeout: Duration },
    /// Persisted settings could not be read or written. Never fatal.
    #[error("settings file `{path}`: {diagnostic}")]
    SettingsIo { path: String, diagnostic: String },
    #[error("invalid skeleton: {0}")]
    InvalidSkeleton(String),
    #[error("run cancelled")]
    Cancelled,
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
}

impl PoseTransferError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    pub fn missing_rig(context: impl Into<String>) -> Self {
        Self::MissingRig {
            context: context.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingRig { .. } => ErrorKind::MissingRig,
            Self::ExportFailed { .. } => ErrorKind::ExportFailed,
            Self::PreviewRender { .. } => ErrorKind::PreviewRender,
            Self::ExternalToolInvocation { .. } => ErrorKind::ExternalToolInvocation,
            Self::ExternalToolTimeout { .. } => ErrorKind::ExternalToolTimeout,
            Self::SettingsIo { .. } => ErrorKind::SettingsIo,
            Self::InvalidSkeleton(_) => ErrorKind::InvalidSkeleton,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Message(_) | Self::Io(_) | Self::Json(_) => ErrorKind::Other,
        }
    }
}

impl From<&str> for PoseTransferError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for PoseTransferError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

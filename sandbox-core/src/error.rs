use std::fmt;

/// Errors returned by sandbox orchestration operations.
#[derive(Debug)]
pub enum SandboxError {
    /// Requested sandbox/snapshot/image not found.
    NotFound(String),
    /// Operation not valid in the entity's current state.
    InvalidState(String),
    /// Non-2xx from a hosted backend; preserves the remote status and body.
    Backend { status: u16, body: String },
    /// Git operation failure (clone, sync, rev-parse).
    Git(String),
    /// GitHub App authentication failure.
    Auth(String),
    /// HTTP transport failure.
    Http(String),
    /// Filesystem or process I/O failure.
    Io(String),
    /// Invalid input or configuration.
    Validation(String),
    /// A bounded wait elapsed without the condition becoming true.
    Timeout(String),
    /// The caller cancelled the in-flight operation.
    Cancelled,
}

impl fmt::Display for SandboxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SandboxError::NotFound(msg) => write!(f, "not found: {msg}"),
            SandboxError::InvalidState(msg) => write!(f, "invalid state: {msg}"),
            SandboxError::Backend { status, body } => {
                write!(f, "backend error ({status}): {body}")
            }
            SandboxError::Git(msg) => write!(f, "git error: {msg}"),
            SandboxError::Auth(msg) => write!(f, "auth error: {msg}"),
            SandboxError::Http(msg) => write!(f, "http error: {msg}"),
            SandboxError::Io(msg) => write!(f, "io error: {msg}"),
            SandboxError::Validation(msg) => write!(f, "validation error: {msg}"),
            SandboxError::Timeout(msg) => write!(f, "timeout: {msg}"),
            SandboxError::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::error::Error for SandboxError {}

impl From<std::io::Error> for SandboxError {
    fn from(err: std::io::Error) -> Self {
        SandboxError::Io(err.to_string())
    }
}

/// Convert SandboxError to String for HTTP error bodies.
impl From<SandboxError> for String {
    fn from(err: SandboxError) -> Self {
        err.to_string()
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;

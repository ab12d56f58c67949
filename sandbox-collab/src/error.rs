use std::fmt;

/// Errors returned by collaboration-surface operations.
#[derive(Debug)]
pub enum CollabError {
    /// Session/user/prompt/skill not found.
    NotFound(String),
    /// Invalid input (bad body, capacity exceeded, unknown user).
    Validation(String),
    /// Operation conflicts with current state (duplicate PR session,
    /// voice already active).
    Conflict(String),
}

impl fmt::Display for CollabError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollabError::NotFound(msg) => write!(f, "not found: {msg}"),
            CollabError::Validation(msg) => write!(f, "validation error: {msg}"),
            CollabError::Conflict(msg) => write!(f, "conflict: {msg}"),
        }
    }
}

impl std::error::Error for CollabError {}

impl From<CollabError> for String {
    fn from(err: CollabError) -> Self {
        err.to_string()
    }
}

pub type Result<T> = std::result::Result<T, CollabError>;

use thiserror::Error;

/// Coarse error taxonomy used to decide between retrying, dropping and
/// escalating a failure.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorClass {
    Transient,
    Validation,
    Conflict,
    Exhausted,
    Fatal,
}

#[derive(Error, Debug)]
pub enum LessorError {
    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Retry budget exhausted: {0}")]
    Exhausted(String),

    #[error("Fatal: {0}")]
    Fatal(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] redb::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl LessorError {
    pub fn class(&self) -> ErrorClass {
        match self {
            LessorError::Transient(_) | LessorError::Io(_) => ErrorClass::Transient,
            LessorError::Http(err) => {
                if err.is_decode() || err.is_builder() {
                    ErrorClass::Validation
                } else {
                    ErrorClass::Transient
                }
            }
            LessorError::Validation(_)
            | LessorError::NotFound(_)
            | LessorError::Serialization(_) => ErrorClass::Validation,
            LessorError::Conflict(_) => ErrorClass::Conflict,
            LessorError::Exhausted(_) | LessorError::Cancelled(_) => {
                ErrorClass::Exhausted
            }
            LessorError::Fatal(_) | LessorError::Storage(_) => ErrorClass::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Fatal
    }

    /// Timeout wrapper error for external calls. An elapsed deadline is a
    /// retryable failure, never a fatal one.
    pub fn timed_out(operation: &str) -> Self {
        LessorError::Transient(format!("{operation} timed out"))
    }
}

/// Converts any redb error flavour into [`LessorError::Storage`].
pub(crate) fn storage<E>(err: E) -> LessorError
where
    E: Into<redb::Error>,
{
    LessorError::Storage(err.into())
}

pub type Result<T> = std::result::Result<T, LessorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_classifies_plumbing_variants() {
        let io = LessorError::Io(std::io::Error::other("disk"));
        assert!(io.is_retryable());
        assert_eq!(
            LessorError::NotFound("order".into()).class(),
            ErrorClass::Validation
        );
        assert!(LessorError::Fatal("corrupt".into()).is_fatal());
        assert!(LessorError::timed_out("broadcast").is_retryable());
    }
}

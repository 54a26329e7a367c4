use thiserror::Error;

use crate::types::ErrorClass;

/// Failures reported by a [`crate::session::BrowserSession`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session is not attached to a loaded document")]
    Detached,

    #[error("browser call timed out: {0}")]
    Timeout(String),

    #[error("no element with id {0}")]
    NoSuchElement(String),

    #[error("navigation failed: {0}")]
    Navigation(String),

    #[error("page script failed: {0}")]
    Script(String),

    #[error("browser error: {0}")]
    Other(String),
}

impl SessionError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SessionError::Timeout(_) => ErrorClass::Timeout,
            SessionError::NoSuchElement(_) => ErrorClass::StaleElement,
            SessionError::Navigation(_) => ErrorClass::NavigationFailed,
            SessionError::Detached | SessionError::Script(_) | SessionError::Other(_) => {
                ErrorClass::Unknown
            }
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExtractionError {
    #[error("page is not readable: no document attached")]
    Detached,

    #[error("extraction timed out after {0}ms")]
    Timeout(u64),

    #[error("extraction failed: {0}")]
    Session(#[from] SessionError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasoningErrorKind {
    Transient,
    Permanent,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{provider} {kind:?} error: {message}")]
pub struct ReasoningError {
    pub kind: ReasoningErrorKind,
    pub provider: String,
    pub message: String,
}

impl ReasoningError {
    pub fn transient(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: ReasoningErrorKind::Transient,
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn permanent(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: ReasoningErrorKind::Permanent,
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ReasoningErrorKind::Transient
    }

    pub fn class(&self) -> ErrorClass {
        match self.kind {
            ReasoningErrorKind::Transient => ErrorClass::ReasoningTransient,
            ReasoningErrorKind::Permanent => ErrorClass::ReasoningPermanent,
        }
    }
}

/// Conditions that stop a run before the loop can start.
#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("browser session error: {0}")]
    Session(#[from] SessionError),

    #[error("no usable model credential: set GOOGLE_API_KEY or OPENAI_API_KEY")]
    NoCredentials,

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T, E = CrawlError> = std::result::Result<T, E>;

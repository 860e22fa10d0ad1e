use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("unsupported source `{name}`: {reason}")]
    UnsupportedSource { name: String, reason: &'static str },
    #[error("task cannot {action} while {status}")]
    InvalidTransition {
        status: &'static str,
        action: &'static str,
    },
    #[error("domain validation failed: {message}")]
    Validation { message: String },
}

impl DomainError {
    pub fn unsupported_source(name: impl Into<String>, reason: &'static str) -> Self {
        Self::UnsupportedSource {
            name: name.into(),
            reason,
        }
    }

    pub fn invalid_transition(status: &'static str, action: &'static str) -> Self {
        Self::InvalidTransition { status, action }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }
}

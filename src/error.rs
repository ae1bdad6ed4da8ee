//! Error taxonomy for the engine core.
//!
//! Four kinds, matching the policy table in the design doc: `Transient`
//! errors are retried by the component that hit them, `Invariant`
//! violations reject the offending request, `Programming` errors mark
//! the owning instance as errored and keep the rest of the session
//! alive, `Fatal` errors take the whole session down.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("transient failure in {component}: {message}")]
    Transient { component: &'static str, message: String },

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("programming error in {component}: {message}")]
    Programming { component: &'static str, message: String },

    #[error("fatal error: {0}")]
    Fatal(String),
}

impl EngineError {
    pub fn transient(component: &'static str, message: impl Into<String>) -> Self {
        Self::Transient {
            component,
            message: message.into(),
        }
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        Self::Invariant(message.into())
    }

    pub fn programming(component: &'static str, message: impl Into<String>) -> Self {
        Self::Programming {
            component,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

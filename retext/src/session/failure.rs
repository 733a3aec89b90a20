use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure reported by the model service, decoded once at the boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceFailure {
    #[error("model not loaded")]
    NotLoaded,
    #[error("model instance has been disposed")]
    Disposed,
    #[error("device context lost")]
    DeviceLost,
    #[error("{0}")]
    Other(String),
}

/// Wire-level failure tag sent by inference workers that classify their own
/// errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NotLoaded,
    Disposed,
    DeviceLost,
    #[serde(other)]
    Other,
}

impl ServiceFailure {
    /// Classifies a free-form error message from a worker that did not tag it.
    pub fn decode(message: &str) -> Self {
        let normalized = message.to_lowercase();
        if normalized.contains("not loaded") {
            Self::NotLoaded
        } else if normalized.contains("disposed") {
            Self::Disposed
        } else if normalized.contains("instance reference")
            || normalized.contains("context lost")
            || normalized.contains("device lost")
            || normalized.contains("device is lost")
        {
            Self::DeviceLost
        } else {
            Self::Other(message.to_string())
        }
    }

    pub fn from_kind(kind: Option<FailureKind>, message: &str) -> Self {
        match kind {
            Some(FailureKind::NotLoaded) => Self::NotLoaded,
            Some(FailureKind::Disposed) => Self::Disposed,
            Some(FailureKind::DeviceLost) => Self::DeviceLost,
            Some(FailureKind::Other) => Self::Other(message.to_string()),
            None => Self::decode(message),
        }
    }

    /// The session handle is gone but a reload may bring it back.
    pub fn is_stale(&self) -> bool {
        !matches!(self, Self::Other(_))
    }

    /// During a load, these mean the whole device context is unusable.
    pub fn is_catastrophic(&self) -> bool {
        matches!(self, Self::Disposed | Self::DeviceLost)
    }
}

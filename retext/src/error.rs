use thiserror::Error;

use crate::assistant::AssistantError;
use crate::config::ConfigError;
use crate::orchestrator::RevisionError;
use crate::preferences::PreferenceError;
use crate::session::SessionError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("failed to initialize logging: {0}")]
    LoggingInit(String),
    #[error("runtime error: {0}")]
    Runtime(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Preferences(#[from] PreferenceError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Revision(#[from] RevisionError),
    #[error(transparent)]
    Assistant(#[from] AssistantError),
}

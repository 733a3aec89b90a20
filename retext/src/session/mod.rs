pub mod failure;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

pub use failure::{FailureKind, ServiceFailure};

/// Automatic recoveries allowed per lifetime before manual action is needed.
pub const MAX_AUTO_RECOVERIES: u32 = 1;
pub const AUTO_RELOAD_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Request/response boundary to the inference backend. Implementations take
/// `&mut self`, so a session can never have two calls in flight.
pub trait ModelService: Send {
    fn load(&mut self, model_id: &str) -> impl Future<Output = Result<(), ServiceFailure>> + Send;

    fn unload(&mut self) -> impl Future<Output = Result<(), ServiceFailure>> + Send;

    fn complete(
        &mut self,
        request: &CompletionRequest,
    ) -> impl Future<Output = Result<String, ServiceFailure>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Unloaded,
    Loading,
    Ready,
    Stale,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Reload the whole tool after `delay`.
    AutoReload { delay: Duration },
    /// The automatic recovery was already spent; the user must reload.
    Manual,
}

impl fmt::Display for Recovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AutoReload { .. } => f.write_str("auto-recovering"),
            Self::Manual => f.write_str("reload manually to recover"),
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("model not loaded; load a model first")]
    NotReady,
    #[error("model session was lost and could not be recovered: {0}")]
    Stale(ServiceFailure),
    #[error("GPU context lost; {recovery}")]
    CatastrophicDeviceLoss { recovery: Recovery },
    #[error("auto-reload failed: {0}")]
    ReloadFailed(String),
    #[error("{0}")]
    Unrecognized(String),
}

/// Counts consecutive automatic recoveries. Clones share the count, so a host
/// that keeps one counter alive across tool reloads bounds recoveries for the
/// whole process lifetime.
#[derive(Debug, Clone, Default)]
pub struct RecoveryCounter {
    attempts: Arc<AtomicU32>,
}

impl RecoveryCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Claims an automatic recovery if the budget allows one.
    pub fn try_begin(&self) -> bool {
        self.attempts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current < MAX_AUTO_RECOVERIES).then_some(current + 1)
            })
            .is_ok()
    }

    pub fn reset(&self) {
        self.attempts.store(0, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub stale_retries: u64,
    pub auto_recoveries: u64,
    pub manual_recoveries: u64,
    pub last_call_ms: u64,
}

/// Builds a fresh service for the staged reload after a device loss.
pub type ServiceFactory<M> = Box<dyn FnMut() -> M + Send>;

pub struct InferenceSession<M> {
    service: M,
    rebuild: Option<ServiceFactory<M>>,
    state: SessionState,
    model_id: Option<String>,
    recovery: RecoveryCounter,
    stats: SessionStats,
}

impl<M: ModelService> InferenceSession<M> {
    pub fn new(service: M, recovery: RecoveryCounter) -> Self {
        Self {
            service,
            rebuild: None,
            state: SessionState::Unloaded,
            model_id: None,
            recovery,
            stats: SessionStats::default(),
        }
    }

    /// Lets the session perform the automatic reload itself: without a
    /// factory, `AutoReload` is returned for the host to act on.
    pub fn with_rebuild(mut self, rebuild: impl FnMut() -> M + Send + 'static) -> Self {
        self.rebuild = Some(Box::new(rebuild));
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn model_id(&self) -> Option<&str> {
        self.model_id.as_deref()
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    pub fn recovery(&self) -> &RecoveryCounter {
        &self.recovery
    }

    /// Loads `model_id`, replacing whatever was loaded before. Clears a
    /// previous `Failed` state.
    pub async fn load(&mut self, model_id: &str) -> Result<(), SessionError> {
        if matches!(self.state, SessionState::Ready | SessionState::Stale) {
            if let Err(err) = self.service.unload().await {
                warn!("unload failed before reload (likely already disposed): {err}");
            }
        }

        self.state = SessionState::Loading;
        info!(model_id, "loading model");

        match self.service.load(model_id).await {
            Ok(()) => {
                self.state = SessionState::Ready;
                self.model_id = Some(model_id.to_string());
                self.recovery.reset();
                info!(model_id, "model ready");
                Ok(())
            }
            Err(failure) if failure.is_catastrophic() => {
                self.state = SessionState::Failed;
                if self.recovery.try_begin() {
                    self.stats.auto_recoveries += 1;
                    warn!(
                        model_id,
                        attempts = self.recovery.attempts(),
                        "device context lost while loading; scheduling automatic reload"
                    );
                    Err(SessionError::CatastrophicDeviceLoss {
                        recovery: Recovery::AutoReload {
                            delay: AUTO_RELOAD_DELAY,
                        },
                    })
                } else {
                    self.recovery.reset();
                    self.stats.manual_recoveries += 1;
                    error!(
                        model_id,
                        "device context lost again after automatic recovery; manual reload required"
                    );
                    Err(SessionError::CatastrophicDeviceLoss {
                        recovery: Recovery::Manual,
                    })
                }
            }
            Err(failure) => {
                self.state = SessionState::Failed;
                warn!(model_id, "model load failed: {failure}");
                Err(SessionError::Unrecognized(failure.to_string()))
            }
        }
    }

    /// Like `load`, but carries out a granted automatic reload: wait, swap in
    /// a rebuilt service and load again. The shared counter grants one such
    /// reload, so the loop ends with success or `Recovery::Manual`.
    pub async fn load_with_recovery(&mut self, model_id: &str) -> Result<(), SessionError> {
        loop {
            match self.load(model_id).await {
                Err(SessionError::CatastrophicDeviceLoss {
                    recovery: Recovery::AutoReload { delay },
                }) if self.rebuild.is_some() => {
                    warn!(model_id, ?delay, "reloading inference service after device loss");
                    tokio::time::sleep(delay).await;
                    if let Some(rebuild) = self.rebuild.as_mut() {
                        self.service = rebuild();
                    }
                    self.state = SessionState::Unloaded;
                }
                other => return other,
            }
        }
    }

    /// Runs one completion. A stale-session failure triggers exactly one
    /// reload and, if that succeeds, exactly one retry.
    pub async fn complete(&mut self, request: &CompletionRequest) -> Result<String, SessionError> {
        if self.state != SessionState::Ready {
            return Err(SessionError::NotReady);
        }

        let started = Instant::now();
        let first = self.service.complete(request).await;
        let result = match first {
            Ok(text) => Ok(text),
            Err(failure) if failure.is_stale() => self.reload_and_retry(request, failure).await,
            Err(failure) => Err(SessionError::Unrecognized(failure.to_string())),
        };
        self.stats.last_call_ms = started.elapsed().as_millis() as u64;
        result
    }

    async fn reload_and_retry(
        &mut self,
        request: &CompletionRequest,
        failure: ServiceFailure,
    ) -> Result<String, SessionError> {
        self.state = SessionState::Stale;
        let Some(model_id) = self.model_id.clone() else {
            return Err(SessionError::NotReady);
        };
        warn!(%model_id, "model session went stale ({failure}); reloading once");

        match self.load_with_recovery(&model_id).await {
            Ok(()) => {}
            Err(SessionError::Unrecognized(message)) => {
                return Err(SessionError::ReloadFailed(message));
            }
            Err(err) => return Err(err),
        }

        self.stats.stale_retries += 1;
        match self.service.complete(request).await {
            Ok(text) => Ok(text),
            Err(failure) if failure.is_stale() => {
                self.state = SessionState::Stale;
                Err(SessionError::Stale(failure))
            }
            Err(failure) => Err(SessionError::Unrecognized(failure.to_string())),
        }
    }
}

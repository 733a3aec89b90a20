use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cleanup::clean_response;
use crate::config::DEFAULT_REWRITE_TEMPERATURE;
use crate::diff::{Token, diff_words};
use crate::metrics::{PerformanceReport, RuntimeMetrics};
use crate::session::{ChatMessage, CompletionRequest, InferenceSession, ModelService, SessionError};
use crate::transport::{Delivery, Transport, TransportError};

pub const MIN_GENERATION_TOKENS: u32 = 128;
const CHARS_PER_TOKEN: f64 = 1.5;
pub const CORRECTION_TEMPERATURE: f32 = 0.0;

const CORRECTION_SYSTEM_PROMPT: &str = "You are a specialized spellchecker. Fix all grammar, spelling, punctuation, and capitalization errors. Output ONLY the corrected text. Do NOT explain.";
const CORRECTION_EXAMPLES: [(&str, &str); 2] = [
    ("ello sword", "Hello sword"),
    ("i has a apple", "I have an apple."),
];

#[derive(Debug, Error)]
pub enum RevisionError {
    #[error("Nothing to revise; select or type some text first.")]
    EmptyInput,
    #[error("Empty response. Try a different model or rephrase.")]
    EmptyResult,
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("No revision is waiting to be applied.")]
    NothingPending,
    #[error("No editable field found; click into the text to replace and try again.")]
    NoWritableTarget,
    #[error("Could not apply the revision: {0}")]
    Transport(TransportError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RewriteStyle {
    Formal,
    Concise,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RevisionMode {
    Correct,
    Rewrite(RewriteStyle),
}

impl RevisionMode {
    fn messages(self, text: &str) -> Vec<ChatMessage> {
        match self {
            Self::Correct => {
                let mut messages = vec![ChatMessage::system(CORRECTION_SYSTEM_PROMPT)];
                for (input, output) in CORRECTION_EXAMPLES {
                    messages.push(ChatMessage::user(correction_turn(input)));
                    messages.push(ChatMessage::assistant(output));
                }
                messages.push(ChatMessage::user(correction_turn(text)));
                messages
            }
            Self::Rewrite(style) => {
                let (tone, verb) = match style {
                    RewriteStyle::Formal => ("in a formal, professional tone", "Rewrite this text formally"),
                    RewriteStyle::Concise => ("as concisely as possible", "Rewrite this text concisely"),
                };
                vec![
                    ChatMessage::system(format!(
                        "You are a professional editor. Rewrite the user's text {tone}. Keep the original meaning. Output ONLY the rewritten text. Do NOT explain your changes."
                    )),
                    ChatMessage::user(format!("{verb}:\n\n{text}")),
                ]
            }
        }
    }

    fn temperature(self, rewrite_temperature: f32) -> f32 {
        match self {
            Self::Correct => CORRECTION_TEMPERATURE,
            Self::Rewrite(_) => rewrite_temperature,
        }
    }
}

fn correction_turn(text: &str) -> String {
    format!("Correct this text:\n\n{text}")
}

/// Token budget proportional to input size: `max(128, ceil(chars / 1.5))`.
pub fn generation_budget(text: &str) -> u32 {
    let scaled = (text.chars().count() as f64 / CHARS_PER_TOKEN).ceil() as u32;
    scaled.max(MIN_GENERATION_TOKENS)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionResult {
    pub original_text: String,
    pub corrected_text: String,
    pub diff: Vec<Token>,
    pub mode: RevisionMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevisionOutcome {
    Ready(RevisionResult),
    /// A newer request was issued while this one was running; its result
    /// was dropped.
    Superseded,
}

struct Pending {
    ticket: u64,
    result: RevisionResult,
}

/// Drives correction requests through the session and applies the accepted
/// result. Only the most recent result is kept.
pub struct RevisionOrchestrator<M, T> {
    session: Arc<Mutex<InferenceSession<M>>>,
    transport: T,
    metrics: Arc<Mutex<RuntimeMetrics>>,
    rewrite_temperature: f32,
    ticket: AtomicU64,
    pending: Mutex<Option<Pending>>,
}

impl<M, T> RevisionOrchestrator<M, T>
where
    M: ModelService,
    T: Transport,
{
    pub fn new(
        session: Arc<Mutex<InferenceSession<M>>>,
        transport: T,
        metrics: Arc<Mutex<RuntimeMetrics>>,
    ) -> Self {
        Self {
            session,
            transport,
            metrics,
            rewrite_temperature: DEFAULT_REWRITE_TEMPERATURE,
            ticket: AtomicU64::new(0),
            pending: Mutex::new(None),
        }
    }

    pub fn with_rewrite_temperature(mut self, temperature: f32) -> Self {
        self.rewrite_temperature = temperature;
        self
    }

    pub fn session(&self) -> Arc<Mutex<InferenceSession<M>>> {
        Arc::clone(&self.session)
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub async fn pending(&self) -> Option<RevisionResult> {
        self.pending
            .lock()
            .await
            .as_ref()
            .map(|pending| pending.result.clone())
    }

    pub async fn discard(&self) -> Option<RevisionResult> {
        self.pending.lock().await.take().map(|pending| pending.result)
    }

    /// Runs one revision. Any earlier pending result is discarded as soon
    /// as this starts, and an earlier in-flight request resolves to
    /// `Superseded`.
    pub async fn revise(&self, text: &str, mode: RevisionMode) -> Result<RevisionOutcome, RevisionError> {
        let original = text.trim();
        if original.is_empty() {
            return Err(RevisionError::EmptyInput);
        }

        let ticket = self.ticket.fetch_add(1, Ordering::SeqCst) + 1;
        self.pending.lock().await.take();

        let request = CompletionRequest {
            messages: mode.messages(original),
            max_tokens: generation_budget(original),
            temperature: mode.temperature(self.rewrite_temperature),
        };
        debug!(ticket, max_tokens = request.max_tokens, ?mode, "revision requested");

        let started = Instant::now();
        let raw = {
            let mut session = self.session.lock().await;
            session.complete(&request).await
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        if self.is_superseded(ticket) {
            return Ok(self.superseded(ticket).await);
        }

        {
            let mut metrics = self.metrics.lock().await;
            metrics.record_inference(elapsed_ms);
            metrics.record_revision();
        }

        let corrected = clean_response(&raw?, original);
        if corrected.is_empty() {
            self.metrics.lock().await.record_empty_result();
            warn!(ticket, "model response was empty after cleanup");
            return Err(RevisionError::EmptyResult);
        }

        let result = RevisionResult {
            diff: diff_words(original, &corrected),
            original_text: original.to_string(),
            corrected_text: corrected,
            mode,
        };

        let mut pending = self.pending.lock().await;
        if self.is_superseded(ticket) {
            drop(pending);
            return Ok(self.superseded(ticket).await);
        }
        *pending = Some(Pending {
            ticket,
            result: result.clone(),
        });
        info!(ticket, elapsed_ms, "revision ready");
        Ok(RevisionOutcome::Ready(result))
    }

    /// Sends the pending result to the write-back transport. The result
    /// stays pending when nothing could be written so the user can retry.
    pub async fn accept(&self) -> Result<Delivery, RevisionError> {
        let Some(pending) = self.pending.lock().await.take() else {
            return Err(RevisionError::NothingPending);
        };

        let started = Instant::now();
        match self.transport.apply_fix(&pending.result.corrected_text).await {
            Ok(delivery) if delivery.is_noop() => {
                debug!("no frame accepted the revision");
                self.restore(pending).await;
                Err(RevisionError::NoWritableTarget)
            }
            Ok(delivery) => {
                self.metrics
                    .lock()
                    .await
                    .record_write_back(started.elapsed().as_millis() as u64);
                info!(outcomes = ?delivery.outcomes, "revision applied");
                Ok(delivery)
            }
            Err(TransportError::Unauthorized) => {
                warn!("write-back not permitted on this page; treating as no target");
                self.restore(pending).await;
                Err(RevisionError::NoWritableTarget)
            }
            Err(err) => {
                warn!("write-back failed: {err}");
                self.restore(pending).await;
                Err(RevisionError::Transport(err))
            }
        }
    }

    pub async fn report(&self) -> PerformanceReport {
        let stats = self.session.lock().await.stats();
        self.metrics.lock().await.report(stats)
    }

    fn is_superseded(&self, ticket: u64) -> bool {
        self.ticket.load(Ordering::SeqCst) != ticket
    }

    async fn superseded(&self, ticket: u64) -> RevisionOutcome {
        debug!(ticket, "discarding superseded revision result");
        self.metrics.lock().await.record_superseded();
        RevisionOutcome::Superseded
    }

    async fn restore(&self, pending: Pending) {
        let mut slot = self.pending.lock().await;
        if slot.is_none() && !self.is_superseded(pending.ticket) {
            *slot = Some(pending);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::diff::TokenKind;
    use crate::session::testing::ScriptedService;
    use crate::session::{RecoveryCounter, Role, ServiceFailure, SessionState};
    use crate::target::WriteOutcome;
    use crate::transport::testing::RecordingTransport;

    async fn orchestrator(
        service: &ScriptedService,
        transport: RecordingTransport,
    ) -> RevisionOrchestrator<ScriptedService, RecordingTransport> {
        let mut session = InferenceSession::new(service.clone(), RecoveryCounter::new());
        session.load("tiny-model").await.expect("load should succeed");
        RevisionOrchestrator::new(
            Arc::new(Mutex::new(session)),
            transport,
            Arc::new(Mutex::new(RuntimeMetrics::new())),
        )
    }

    fn ready(outcome: RevisionOutcome) -> RevisionResult {
        match outcome {
            RevisionOutcome::Ready(result) => result,
            RevisionOutcome::Superseded => panic!("expected a ready result"),
        }
    }

    #[test]
    fn budget_has_floor_and_scales() {
        assert_eq!(generation_budget("short"), 128);
        assert_eq!(generation_budget(&"a".repeat(300)), 200);
        assert_eq!(generation_budget(&"a".repeat(301)), 201);
    }

    #[test]
    fn correction_prompt_is_few_shot() {
        let messages = RevisionMode::Correct.messages("i has a apple");
        let roles: Vec<Role> = messages.iter().map(|message| message.role).collect();

        assert_eq!(
            roles,
            vec![
                Role::System,
                Role::User,
                Role::Assistant,
                Role::User,
                Role::Assistant,
                Role::User
            ]
        );
        assert_eq!(messages[2].content, "Hello sword");
        assert_eq!(messages[5].content, "Correct this text:\n\ni has a apple");
    }

    #[tokio::test]
    async fn end_to_end_correction_produces_expected_diff() {
        let service = ScriptedService::new();
        service.push_completion(Ok("Corrected: I have an apple."));
        let orchestrator = orchestrator(&service, RecordingTransport::new()).await;

        let result = ready(
            orchestrator
                .revise("i has a apple", RevisionMode::Correct)
                .await
                .expect("revision should succeed"),
        );

        assert_eq!(result.corrected_text, "I have an apple.");
        let deleted: Vec<&str> = result
            .diff
            .iter()
            .filter(|token| token.kind == TokenKind::Deleted)
            .map(|token| token.text.as_str())
            .collect();
        let inserted: Vec<&str> = result
            .diff
            .iter()
            .filter(|token| token.kind == TokenKind::Inserted)
            .map(|token| token.text.as_str())
            .collect();
        assert_eq!(deleted, vec!["i", "has", "a"]);
        assert_eq!(inserted, vec!["I", "have", "an", "."]);

        let request = &service.requests()[0];
        assert_eq!(request.max_tokens, 128);
        assert_eq!(request.temperature, 0.0);
        assert_eq!(orchestrator.pending().await, Some(result));
    }

    #[tokio::test]
    async fn rewrite_uses_configured_temperature() {
        let service = ScriptedService::new();
        service.push_completion(Ok("I would like an apple."));
        let orchestrator = orchestrator(&service, RecordingTransport::new())
            .await
            .with_rewrite_temperature(0.9);

        orchestrator
            .revise("gimme apple", RevisionMode::Rewrite(RewriteStyle::Formal))
            .await
            .expect("rewrite should succeed");

        let request = &service.requests()[0];
        assert_eq!(request.temperature, 0.9);
        assert_eq!(request.messages.len(), 2);
        assert!(request.messages[0].content.contains("formal"));
    }

    #[tokio::test]
    async fn blank_input_is_rejected_without_a_call() {
        let service = ScriptedService::new();
        let orchestrator = orchestrator(&service, RecordingTransport::new()).await;

        let result = orchestrator.revise("  \n ", RevisionMode::Correct).await;

        assert!(matches!(result, Err(RevisionError::EmptyInput)));
        assert!(service.requests().is_empty());
    }

    #[tokio::test]
    async fn empty_cleanup_is_reported_distinctly() {
        let service = ScriptedService::new();
        service.push_completion(Ok("   \n  "));
        let orchestrator = orchestrator(&service, RecordingTransport::new()).await;

        let result = orchestrator.revise("ello sword", RevisionMode::Correct).await;

        let err = result.expect_err("empty cleanup should fail");
        assert!(matches!(err, RevisionError::EmptyResult));
        assert_eq!(
            err.to_string(),
            "Empty response. Try a different model or rephrase."
        );
        assert_eq!(orchestrator.pending().await, None);
    }

    #[tokio::test]
    async fn unloaded_session_surfaces_not_ready() {
        let service = ScriptedService::new();
        let session = InferenceSession::new(service.clone(), RecoveryCounter::new());
        let orchestrator = RevisionOrchestrator::new(
            Arc::new(Mutex::new(session)),
            RecordingTransport::new(),
            Arc::new(Mutex::new(RuntimeMetrics::new())),
        );

        let result = orchestrator.revise("ello sword", RevisionMode::Correct).await;

        assert!(matches!(
            result,
            Err(RevisionError::Session(SessionError::NotReady))
        ));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn device_loss_during_stale_reload_is_recovered_inside_revision() {
        let lost = ScriptedService::new();
        lost.push_load(Ok(()))
            .push_load(Err(ServiceFailure::DeviceLost))
            .push_completion(Err(ServiceFailure::Disposed));
        let replacement = ScriptedService::new();
        replacement.push_completion(Ok("Hello sword"));
        let recovery = RecoveryCounter::new();

        let rebuilt = replacement.clone();
        let mut session =
            InferenceSession::new(lost.clone(), recovery.clone()).with_rebuild(move || rebuilt.clone());
        session.load("tiny").await.expect("load should succeed");
        let orchestrator = RevisionOrchestrator::new(
            Arc::new(Mutex::new(session)),
            RecordingTransport::new(),
            Arc::new(Mutex::new(RuntimeMetrics::new())),
        );

        let result = ready(
            orchestrator
                .revise("ello sword", RevisionMode::Correct)
                .await
                .expect("revision should recover"),
        );

        assert_eq!(result.corrected_text, "Hello sword");
        assert_eq!(replacement.load_calls(), vec!["tiny"]);
        assert_eq!(recovery.attempts(), 0);
        let session = orchestrator.session();
        assert_eq!(session.lock().await.state(), SessionState::Ready);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn newer_request_supersedes_in_flight_one() {
        let service = ScriptedService::new().with_completion_delay(Duration::from_millis(200));
        service
            .push_completion(Ok("First answer."))
            .push_completion(Ok("Second answer."));
        let orchestrator = orchestrator(&service, RecordingTransport::new()).await;

        let (first, second) = tokio::join!(
            orchestrator.revise("first answr", RevisionMode::Correct),
            orchestrator.revise("second answr", RevisionMode::Correct),
        );

        assert_eq!(first.expect("first resolves"), RevisionOutcome::Superseded);
        let second = ready(second.expect("second resolves"));
        assert_eq!(second.corrected_text, "Second answer.");
        assert_eq!(
            orchestrator.pending().await.map(|result| result.corrected_text),
            Some("Second answer.".to_string())
        );
        assert_eq!(orchestrator.report().await.superseded_results, 1);
    }

    #[tokio::test]
    async fn accept_delivers_once() {
        let service = ScriptedService::new();
        service.push_completion(Ok("Hello sword"));
        let transport = RecordingTransport::new();
        let orchestrator = orchestrator(&service, transport.clone()).await;
        orchestrator
            .revise("ello sword", RevisionMode::Correct)
            .await
            .expect("revision should succeed");

        let delivery = orchestrator.accept().await.expect("accept should succeed");

        assert!(delivery.reached_target());
        assert_eq!(transport.applied(), vec!["Hello sword".to_string()]);
        assert!(matches!(
            orchestrator.accept().await,
            Err(RevisionError::NothingPending)
        ));
    }

    #[tokio::test]
    async fn unauthorized_page_keeps_result_pending() {
        let service = ScriptedService::new();
        service.push_completion(Ok("Hello sword"));
        let mut transport = RecordingTransport::new();
        transport.authorized = false;
        let orchestrator = orchestrator(&service, transport).await;
        orchestrator
            .revise("ello sword", RevisionMode::Correct)
            .await
            .expect("revision should succeed");

        let result = orchestrator.accept().await;

        assert!(matches!(result, Err(RevisionError::NoWritableTarget)));
        assert!(orchestrator.pending().await.is_some());
    }

    #[tokio::test]
    async fn skipped_everywhere_counts_as_no_target() {
        let service = ScriptedService::new();
        service.push_completion(Ok("Hello sword"));
        let mut transport = RecordingTransport::new();
        transport.outcome = WriteOutcome::Skipped;
        let orchestrator = orchestrator(&service, transport).await;
        orchestrator
            .revise("ello sword", RevisionMode::Correct)
            .await
            .expect("revision should succeed");

        assert!(matches!(
            orchestrator.accept().await,
            Err(RevisionError::NoWritableTarget)
        ));
    }

    #[tokio::test]
    async fn new_request_discards_pending_result() {
        let service = ScriptedService::new();
        service
            .push_completion(Ok("Hello sword"))
            .push_completion(Err(crate::session::ServiceFailure::Other(
                "bad request".to_string(),
            )));
        let orchestrator = orchestrator(&service, RecordingTransport::new()).await;
        orchestrator
            .revise("ello sword", RevisionMode::Correct)
            .await
            .expect("first revision should succeed");

        let second = orchestrator.revise("again", RevisionMode::Correct).await;

        assert!(matches!(
            second,
            Err(RevisionError::Session(SessionError::Unrecognized(_)))
        ));
        assert_eq!(orchestrator.pending().await, None);
    }
}

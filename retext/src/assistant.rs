use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::{DEFAULT_CHAT_MAX_TOKENS, DEFAULT_CHAT_TEMPERATURE, DEFAULT_PAGE_CHAR_BUDGET};
use crate::session::{
    ChatMessage, CompletionRequest, InferenceSession, ModelService, SessionError, SessionState,
};
use crate::transport::Transport;
use crate::utils::{collapse_whitespace, truncate_chars};

const CHAT_SYSTEM_PROMPT: &str = "You are a helpful AI assistant. Answer the user's question based on the provided Page Context. If the answer is not in the context, say so.";
pub const SUMMARY_QUESTION: &str = "Summarize this page in 3 bullet points.";

#[derive(Debug, Error)]
pub enum AssistantError {
    #[error("Ask a question first.")]
    EmptyQuestion,
    #[error("Could not read page. Try refreshing.")]
    PageUnavailable,
    #[error("No model selected; choose a model to load first.")]
    NoModel,
    #[error("Empty response. Try a different model or rephrase.")]
    EmptyResult,
    #[error(transparent)]
    Session(#[from] SessionError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscriptEntry {
    pub speaker: Speaker,
    pub text: String,
}

/// Answers questions about the current page using the shared session.
pub struct PageAssistant<M, T> {
    session: Arc<Mutex<InferenceSession<M>>>,
    transport: T,
    page_char_budget: usize,
    max_tokens: u32,
    temperature: f32,
    auto_load_model: Option<String>,
    transcript: Vec<TranscriptEntry>,
}

impl<M, T> PageAssistant<M, T>
where
    M: ModelService,
    T: Transport,
{
    pub fn new(session: Arc<Mutex<InferenceSession<M>>>, transport: T) -> Self {
        Self {
            session,
            transport,
            page_char_budget: DEFAULT_PAGE_CHAR_BUDGET,
            max_tokens: DEFAULT_CHAT_MAX_TOKENS,
            temperature: DEFAULT_CHAT_TEMPERATURE,
            auto_load_model: None,
            transcript: Vec::new(),
        }
    }

    pub fn with_limits(mut self, page_char_budget: usize, max_tokens: u32, temperature: f32) -> Self {
        self.page_char_budget = page_char_budget;
        self.max_tokens = max_tokens;
        self.temperature = temperature;
        self
    }

    /// Model loaded on demand when a question arrives before any load.
    pub fn set_auto_load_model(&mut self, model_id: Option<String>) {
        self.auto_load_model = model_id;
    }

    pub fn transcript(&self) -> &[TranscriptEntry] {
        &self.transcript
    }

    pub async fn summarize(&mut self) -> Result<String, AssistantError> {
        self.ask(SUMMARY_QUESTION).await
    }

    pub async fn ask(&mut self, question: &str) -> Result<String, AssistantError> {
        let question = question.trim();
        if question.is_empty() {
            return Err(AssistantError::EmptyQuestion);
        }

        match self.answer(question).await {
            Ok(answer) => {
                self.record(Speaker::Assistant, &answer);
                Ok(answer)
            }
            Err(err) => {
                self.record(Speaker::System, &format!("Error: {err}"));
                Err(err)
            }
        }
    }

    async fn answer(&mut self, question: &str) -> Result<String, AssistantError> {
        let context = self.page_context().await;
        if context.is_empty() {
            return Err(AssistantError::PageUnavailable);
        }
        self.record(Speaker::User, question);

        let request = CompletionRequest {
            messages: vec![
                ChatMessage::system(CHAT_SYSTEM_PROMPT),
                ChatMessage::user(format!("Page Context:\n{context}\n\nQuestion: {question}")),
            ],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        let session = Arc::clone(&self.session);
        let mut session = session.lock().await;
        if session.state() != SessionState::Ready {
            let model_id = session
                .model_id()
                .map(str::to_string)
                .or_else(|| self.auto_load_model.clone())
                .ok_or(AssistantError::NoModel)?;
            info!(%model_id, "loading model for page question");
            self.record(Speaker::System, &format!("Loading {model_id}..."));
            session.load(&model_id).await?;
        }

        let retries_before = session.stats().stale_retries;
        let answer = session.complete(&request).await?;
        if session.stats().stale_retries > retries_before {
            self.record(Speaker::System, "Connection lost. Reconnected.");
        }
        drop(session);

        let answer = answer.trim().to_string();
        if answer.is_empty() {
            return Err(AssistantError::EmptyResult);
        }
        Ok(answer)
    }

    /// Whitespace-collapsed page text capped to the character budget, empty
    /// when the page cannot be read.
    async fn page_context(&self) -> String {
        match self.transport.page_content().await {
            Ok(text) => truncate_chars(&collapse_whitespace(&text), self.page_char_budget).to_string(),
            Err(err) => {
                warn!("could not read page: {err}");
                String::new()
            }
        }
    }

    fn record(&mut self, speaker: Speaker, text: &str) {
        self.transcript.push(TranscriptEntry {
            speaker,
            text: text.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::ScriptedService;
    use crate::session::{RecoveryCounter, ServiceFailure};
    use crate::transport::testing::RecordingTransport;

    fn assistant(
        service: &ScriptedService,
        page: &str,
    ) -> PageAssistant<ScriptedService, RecordingTransport> {
        let session = InferenceSession::new(service.clone(), RecoveryCounter::new());
        let mut assistant = PageAssistant::new(
            Arc::new(Mutex::new(session)),
            RecordingTransport::new().with_page(page),
        );
        assistant.set_auto_load_model(Some("tiny-model".to_string()));
        assistant
    }

    fn speakers(assistant: &PageAssistant<ScriptedService, RecordingTransport>) -> Vec<Speaker> {
        assistant
            .transcript()
            .iter()
            .map(|entry| entry.speaker)
            .collect()
    }

    #[tokio::test]
    async fn question_is_grounded_in_normalized_page_text() {
        let service = ScriptedService::new();
        service.push_completion(Ok("  Yes, it is.  "));
        let mut assistant = assistant(&service, "  Rust   is\n\n fast. ");

        let answer = assistant.ask("Is Rust fast?").await.expect("ask should succeed");

        assert_eq!(answer, "Yes, it is.");
        let request = &service.requests()[0];
        assert_eq!(
            request.messages[1].content,
            "Page Context:\nRust is fast.\n\nQuestion: Is Rust fast?"
        );
        assert_eq!(request.max_tokens, 512);
        assert_eq!(request.temperature, 0.3);
        assert_eq!(service.load_calls(), vec!["tiny-model"]);
        assert_eq!(
            speakers(&assistant),
            vec![Speaker::User, Speaker::System, Speaker::Assistant]
        );
    }

    #[tokio::test]
    async fn page_text_is_capped_to_budget() {
        let service = ScriptedService::new();
        service.push_completion(Ok("ok"));
        let mut assistant = assistant(&service, &"word ".repeat(100)).with_limits(12, 64, 0.1);

        assistant.summarize().await.expect("summarize should succeed");

        let request = &service.requests()[0];
        assert_eq!(
            request.messages[1].content,
            format!("Page Context:\nword word wo\n\nQuestion: {SUMMARY_QUESTION}")
        );
        assert_eq!(request.max_tokens, 64);
    }

    #[tokio::test]
    async fn unreadable_page_is_reported_in_transcript() {
        let service = ScriptedService::new();
        let mut assistant = assistant(&service, " \n ");

        let result = assistant.ask("What is this?").await;

        assert!(matches!(result, Err(AssistantError::PageUnavailable)));
        assert!(service.requests().is_empty());
        assert_eq!(
            assistant.transcript(),
            &[TranscriptEntry {
                speaker: Speaker::System,
                text: "Error: Could not read page. Try refreshing.".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn no_model_to_load_is_reported() {
        let service = ScriptedService::new();
        let mut assistant = assistant(&service, "content");
        assistant.set_auto_load_model(None);

        let result = assistant.ask("What is this?").await;

        assert!(matches!(result, Err(AssistantError::NoModel)));
    }

    #[tokio::test]
    async fn reconnect_is_noted_in_transcript() {
        let service = ScriptedService::new();
        service
            .push_completion(Err(ServiceFailure::Disposed))
            .push_completion(Ok("Recovered answer."));
        let mut assistant = assistant(&service, "content");

        let answer = assistant.ask("Still there?").await.expect("retry should succeed");

        assert_eq!(answer, "Recovered answer.");
        assert!(
            assistant
                .transcript()
                .iter()
                .any(|entry| entry.text == "Connection lost. Reconnected.")
        );
    }
}

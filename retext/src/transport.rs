use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::target::{
    Interaction, Surface, SurfaceWriter, TargetTracker, WriteError, WriteOutcome,
};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("not allowed to access this page")]
    Unauthorized,
    #[error("page did not answer: {0}")]
    Unreachable(String),
    #[error(transparent)]
    Write(#[from] WriteError),
}

/// Message from the tool surface to a document context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ToolMessage {
    ApplyFix { text: String },
    GetPageContent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum AgentReply {
    Applied { outcome: WriteOutcome },
    PageContent { content: String },
}

/// Combined result of one `apply_fix` fanned out to every frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Delivery {
    pub outcomes: Vec<WriteOutcome>,
}

impl Delivery {
    pub fn reached_target(&self) -> bool {
        self.outcomes.iter().any(|outcome| outcome.reached_target())
    }

    pub fn copied_to_clipboard(&self) -> bool {
        self.outcomes.contains(&WriteOutcome::CopiedToClipboard)
    }

    /// Nothing was written anywhere; every frame skipped.
    pub fn is_noop(&self) -> bool {
        !self.reached_target() && !self.copied_to_clipboard()
    }
}

/// Channel from the tool surface to the document holding the target.
pub trait Transport: Send + Sync {
    fn apply_fix(&self, text: &str) -> impl Future<Output = Result<Delivery, TransportError>> + Send;

    fn page_content(&self) -> impl Future<Output = Result<String, TransportError>> + Send;
}

/// Per-document endpoint: keeps the target tracker fed and answers tool
/// messages.
pub struct DocumentAgent<S: Surface> {
    tracker: TargetTracker<S::Node>,
    writer: SurfaceWriter<S>,
}

impl<S> DocumentAgent<S>
where
    S: Surface + Send + 'static,
    S::Node: Send + 'static,
{
    pub fn new(surface: Arc<Mutex<S>>) -> Self {
        Self {
            tracker: TargetTracker::new(),
            writer: SurfaceWriter::new(surface),
        }
    }

    pub fn surface(&self) -> Arc<Mutex<S>> {
        self.writer.surface()
    }

    pub fn tracker(&self) -> &TargetTracker<S::Node> {
        &self.tracker
    }

    pub async fn observe(&mut self, interaction: Interaction<S::Node>) {
        let surface = self.writer.surface();
        let surface = surface.lock().await;
        self.tracker.observe(&*surface, interaction);
    }

    pub async fn handle(&self, message: ToolMessage) -> Result<AgentReply, WriteError> {
        match message {
            ToolMessage::ApplyFix { text } => {
                let target = {
                    let surface = self.writer.surface();
                    let surface = surface.lock().await;
                    self.tracker.current(&*surface)
                };
                debug!(kind = ?target.kind(), "applying fix");
                let outcome = self.writer.write(&target, &text).await?;
                Ok(AgentReply::Applied { outcome })
            }
            ToolMessage::GetPageContent => {
                let surface = self.writer.surface();
                let content = surface.lock().await.page_text();
                Ok(AgentReply::PageContent { content })
            }
        }
    }
}

pub struct Frame<S: Surface> {
    pub agent: Arc<Mutex<DocumentAgent<S>>>,
    /// False when the tool may not script this frame's document.
    pub authorized: bool,
}

impl<S: Surface> Clone for Frame<S> {
    fn clone(&self) -> Self {
        Self {
            agent: Arc::clone(&self.agent),
            authorized: self.authorized,
        }
    }
}

/// In-process transport that fans a message out to every frame of a page,
/// top-level frame first.
pub struct FrameTransport<S: Surface> {
    frames: Vec<Frame<S>>,
}

impl<S: Surface> Clone for FrameTransport<S> {
    fn clone(&self) -> Self {
        Self {
            frames: self.frames.clone(),
        }
    }
}

impl<S: Surface> FrameTransport<S> {
    pub fn new(frames: Vec<Frame<S>>) -> Self {
        Self { frames }
    }

    pub fn single(agent: Arc<Mutex<DocumentAgent<S>>>) -> Self {
        Self::new(vec![Frame {
            agent,
            authorized: true,
        }])
    }

    fn authorized_frames(&self) -> Result<impl Iterator<Item = &Frame<S>>, TransportError> {
        if !self.frames.iter().any(|frame| frame.authorized) {
            return Err(TransportError::Unauthorized);
        }
        Ok(self.frames.iter().filter(|frame| frame.authorized))
    }
}

impl<S> Transport for FrameTransport<S>
where
    S: Surface + Send + Sync + 'static,
    S::Node: Send + Sync + 'static,
{
    async fn apply_fix(&self, text: &str) -> Result<Delivery, TransportError> {
        let mut delivery = Delivery::default();
        for frame in self.authorized_frames()? {
            let agent = frame.agent.lock().await;
            let reply = agent
                .handle(ToolMessage::ApplyFix {
                    text: text.to_string(),
                })
                .await?;
            match reply {
                AgentReply::Applied { outcome } => delivery.outcomes.push(outcome),
                other => warn!(?other, "unexpected reply to apply_fix"),
            }
        }
        Ok(delivery)
    }

    async fn page_content(&self) -> Result<String, TransportError> {
        let Some(frame) = self.authorized_frames()?.next() else {
            return Err(TransportError::Unauthorized);
        };
        let agent = frame.agent.lock().await;
        match agent.handle(ToolMessage::GetPageContent).await? {
            AgentReply::PageContent { content } => Ok(content),
            other => Err(TransportError::Unreachable(format!(
                "unexpected reply to get_page_content: {other:?}"
            ))),
        }
    }
}

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::target::{Document, EditableTarget};

pub const ACKNOWLEDGEMENT_COLOR: &str = "#ccffcc";
pub const ACKNOWLEDGEMENT_TRANSITION: &str = "background-color 0.5s";
pub const ACKNOWLEDGEMENT_DURATION: Duration = Duration::from_millis(1000);

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("clipboard fallback failed: {0}")]
    Clipboard(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum WriteOutcome {
    /// Only the selected range of a plain field was replaced.
    RangeReplaced,
    /// The whole value of a plain field was replaced.
    ValueReplaced,
    /// Rich surface insertion at the live selection, undo history kept.
    Inserted,
    /// Rich surface content replaced as plain text; formatting is lost.
    ContentReplaced,
    CopiedToClipboard,
    /// No target and not the sole top-level frame; nothing was written.
    Skipped,
}

impl WriteOutcome {
    pub fn reached_target(self) -> bool {
        matches!(
            self,
            Self::RangeReplaced | Self::ValueReplaced | Self::Inserted | Self::ContentReplaced
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameContext {
    pub top_level: bool,
    pub child_frames: usize,
}

impl FrameContext {
    pub fn top_level_single_frame() -> Self {
        Self {
            top_level: true,
            child_frames: 0,
        }
    }

    pub fn nested() -> Self {
        Self {
            top_level: false,
            child_frames: 0,
        }
    }

    /// Clipboard writes are only allowed from a top-level document without
    /// child frames, so sibling frames never race each other.
    pub fn may_use_clipboard(&self) -> bool {
        self.top_level && self.child_frames == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HighlightStyle {
    pub background: Option<String>,
    pub transition: Option<String>,
}

/// Mutating side of a document, used to apply corrected text.
pub trait Surface: Document {
    /// Replaces the selected range of a plain field, inserting at the caret
    /// when the selection is collapsed. Returns false when the field has no
    /// range API.
    fn replace_field_range(&mut self, field: &Self::Node, text: &str) -> bool;

    fn set_field_value(&mut self, field: &Self::Node, text: &str);

    /// Formatting-preserving insertion at the live selection, recorded in
    /// the undo history. Returns false when the host refuses the command.
    fn insert_at_selection(&mut self, text: &str) -> bool;

    fn set_text_content(&mut self, node: &Self::Node, text: &str);

    fn frame(&self) -> FrameContext;

    fn write_clipboard(&mut self, text: &str) -> Result<(), String>;

    fn highlight(&self, node: &Self::Node) -> HighlightStyle;

    fn set_highlight(&mut self, node: &Self::Node, style: HighlightStyle);

    /// True when the live selection is anchored at or inside `node`.
    fn selection_within(&self, node: &Self::Node) -> bool {
        let mut current = self.selection_anchor();
        while let Some(candidate) = current {
            if &candidate == node {
                return true;
            }
            current = self.parent(&candidate);
        }
        false
    }
}

pub struct SurfaceWriter<S> {
    surface: Arc<Mutex<S>>,
    acknowledgement: Duration,
}

impl<S> SurfaceWriter<S>
where
    S: Surface + Send + 'static,
    S::Node: Send + 'static,
{
    pub fn new(surface: Arc<Mutex<S>>) -> Self {
        Self {
            surface,
            acknowledgement: ACKNOWLEDGEMENT_DURATION,
        }
    }

    pub fn surface(&self) -> Arc<Mutex<S>> {
        Arc::clone(&self.surface)
    }

    pub async fn write(
        &self,
        target: &EditableTarget<S::Node>,
        text: &str,
    ) -> Result<WriteOutcome, WriteError> {
        let mut surface = self.surface.lock().await;

        let outcome = match target {
            EditableTarget::PlainField(field) => {
                if surface.replace_field_range(field, text) {
                    WriteOutcome::RangeReplaced
                } else {
                    surface.set_field_value(field, text);
                    WriteOutcome::ValueReplaced
                }
            }
            EditableTarget::RichSurface(node) => {
                if surface.selection_within(node) && surface.insert_at_selection(text) {
                    WriteOutcome::Inserted
                } else {
                    surface.set_text_content(node, text);
                    WriteOutcome::ContentReplaced
                }
            }
            EditableTarget::None => {
                if !surface.frame().may_use_clipboard() {
                    debug!("no write target inside a nested or multi-frame document; skipping");
                    return Ok(WriteOutcome::Skipped);
                }
                surface
                    .write_clipboard(text)
                    .map_err(WriteError::Clipboard)?;
                info!("no editable target found; corrected text copied to clipboard");
                return Ok(WriteOutcome::CopiedToClipboard);
            }
        };

        if let Some(node) = target.node() {
            let previous = surface.highlight(node);
            surface.set_highlight(
                node,
                HighlightStyle {
                    background: Some(ACKNOWLEDGEMENT_COLOR.to_string()),
                    transition: Some(ACKNOWLEDGEMENT_TRANSITION.to_string()),
                },
            );
            drop(surface);
            self.schedule_revert(node.clone(), previous);
        }

        Ok(outcome)
    }

    fn schedule_revert(&self, node: S::Node, previous: HighlightStyle) {
        let surface = Arc::clone(&self.surface);
        let delay = self.acknowledgement;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut surface = surface.lock().await;
            if surface.element(&node).is_none() {
                warn!(?node, "acknowledged element disappeared before highlight revert");
                return;
            }
            surface.set_highlight(&node, previous);
        });
    }
}

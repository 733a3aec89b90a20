pub mod clipboard;
pub mod memory;
pub mod writer;

use std::fmt::Debug;

use serde::Serialize;
use tracing::debug;

pub use clipboard::{ClipboardSink, MemoryClipboard, SystemClipboard};
pub use memory::{ContentEditable, ElementSpec, MemoryDocument, NodeId};
pub use writer::{HighlightStyle, Surface, SurfaceWriter, WriteError, WriteOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldKind {
    SingleLine,
    MultiLine,
}

/// What the host knows about one element node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementFacts {
    /// Set for native single/multi-line text inputs.
    pub field: Option<FieldKind>,
    /// Effective content-editability, inheritance already applied.
    pub content_editable: bool,
    /// False once the element has been removed from the document.
    pub connected: bool,
}

impl ElementFacts {
    pub fn is_editable(&self) -> bool {
        self.connected && (self.field.is_some() || self.content_editable)
    }
}

/// Read-only view of a document the tracker can inspect.
pub trait Document {
    type Node: Clone + PartialEq + Debug;

    /// Facts for `node` when it is an element; `None` for text and other
    /// non-element nodes.
    fn element(&self, node: &Self::Node) -> Option<ElementFacts>;

    fn parent(&self, node: &Self::Node) -> Option<Self::Node>;

    /// Anchor of the live selection, `None` when the selection has no range.
    fn selection_anchor(&self) -> Option<Self::Node>;

    fn active_element(&self) -> Option<Self::Node>;

    /// True for the body and document element, which are never tracked.
    fn is_document_root(&self, node: &Self::Node) -> bool;

    /// Rendered text of the document body, used for page questions.
    fn page_text(&self) -> String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum InteractionKind {
    Focus,
    PointerDown,
    TextInput,
    PointerUp,
    KeyUp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interaction<N> {
    pub kind: InteractionKind,
    pub target: N,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetKind {
    PlainField,
    RichSurface,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditableTarget<N> {
    PlainField(N),
    RichSurface(N),
    None,
}

impl<N> EditableTarget<N> {
    pub fn kind(&self) -> TargetKind {
        match self {
            Self::PlainField(_) => TargetKind::PlainField,
            Self::RichSurface(_) => TargetKind::RichSurface,
            Self::None => TargetKind::None,
        }
    }

    pub fn node(&self) -> Option<&N> {
        match self {
            Self::PlainField(node) | Self::RichSurface(node) => Some(node),
            Self::None => None,
        }
    }
}

/// Remembers the element the user last interacted with in one document.
///
/// Opening the tool UI steals focus, so the tracker must be fed every
/// interaction continuously and consulted only when a write is requested.
#[derive(Debug, Clone)]
pub struct TargetTracker<N> {
    last_active: Option<N>,
}

impl<N> Default for TargetTracker<N> {
    fn default() -> Self {
        Self { last_active: None }
    }
}

impl<N: Clone + PartialEq + Debug> TargetTracker<N> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_active(&self) -> Option<&N> {
        self.last_active.as_ref()
    }

    pub fn observe<D>(&mut self, document: &D, interaction: Interaction<N>)
    where
        D: Document<Node = N>,
    {
        if document.is_document_root(&interaction.target) {
            return;
        }
        self.last_active = Some(interaction.target);
    }

    /// Resolves the write target: remembered element, then the element
    /// holding the live selection, then the focused element.
    pub fn current<D>(&self, document: &D) -> EditableTarget<N>
    where
        D: Document<Node = N>,
    {
        if let Some(remembered) = self.last_active.as_ref() {
            if let Some(target) = classify(document, remembered) {
                debug!(source = "tracked", "write target resolved");
                return target;
            }
        }

        if let Some(anchor) = document.selection_anchor() {
            if let Some(element) = nearest_element(document, anchor) {
                if let Some(target) = classify(document, &element) {
                    debug!(source = "selection", "write target resolved");
                    return target;
                }
            }
        }

        if let Some(focused) = document.active_element() {
            if let Some(target) = classify(document, &focused) {
                debug!(source = "focus", "write target resolved");
                return target;
            }
        }

        debug!("no editable write target");
        EditableTarget::None
    }
}

/// Walks from `node` up to the closest element node, `node` included.
pub fn nearest_element<D: Document>(document: &D, node: D::Node) -> Option<D::Node> {
    let mut current = Some(node);
    while let Some(candidate) = current {
        if document.element(&candidate).is_some() {
            return Some(candidate);
        }
        current = document.parent(&candidate);
    }
    None
}

pub fn is_editable<D: Document>(document: &D, node: &D::Node) -> bool {
    document
        .element(node)
        .is_some_and(|facts| facts.is_editable())
}

fn classify<D: Document>(document: &D, node: &D::Node) -> Option<EditableTarget<D::Node>> {
    let facts = document.element(node)?;
    if !facts.is_editable() {
        return None;
    }
    if facts.field.is_some() {
        Some(EditableTarget::PlainField(node.clone()))
    } else {
        Some(EditableTarget::RichSurface(node.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn click(tracker: &mut TargetTracker<NodeId>, document: &MemoryDocument, node: NodeId) {
        tracker.observe(
            document,
            Interaction {
                kind: InteractionKind::PointerDown,
                target: node,
            },
        );
    }

    #[test]
    fn tracked_field_wins() {
        let mut document = MemoryDocument::new();
        let body = document.body();
        let field = document.append_element(body, ElementSpec::text_area("draft"));
        let mut tracker = TargetTracker::new();
        click(&mut tracker, &document, field);

        assert_eq!(tracker.current(&document), EditableTarget::PlainField(field));
    }

    #[test]
    fn document_roots_are_not_tracked() {
        let mut document = MemoryDocument::new();
        let body = document.body();
        let field = document.append_element(body, ElementSpec::input("x"));
        let mut tracker = TargetTracker::new();
        click(&mut tracker, &document, field);
        click(&mut tracker, &document, body);

        assert_eq!(tracker.last_active(), Some(&field));
    }

    #[test]
    fn selection_anchor_climbs_to_editable_element() {
        let mut document = MemoryDocument::new();
        let body = document.body();
        let panel = document.append_element(body, ElementSpec::div());
        let editor = document.append_element(body, ElementSpec::rich_editor());
        let paragraph = document.append_element(editor, ElementSpec::div());
        let text = document.append_text(paragraph, "i has a apple");
        document.select_text(text, None);

        let mut tracker = TargetTracker::new();
        click(&mut tracker, &document, panel);

        assert_eq!(
            tracker.current(&document),
            EditableTarget::RichSurface(paragraph)
        );
    }

    #[test]
    fn focused_field_is_last_resort() {
        let mut document = MemoryDocument::new();
        let body = document.body();
        let field = document.append_element(body, ElementSpec::input("hello"));
        document.focus(field);
        let tracker = TargetTracker::new();

        assert_eq!(tracker.current(&document), EditableTarget::PlainField(field));
    }

    #[test]
    fn tracked_element_beats_newer_selection() {
        let mut document = MemoryDocument::new();
        let body = document.body();
        let first = document.append_element(body, ElementSpec::text_area("one"));
        let editor = document.append_element(body, ElementSpec::rich_editor());
        let text = document.append_text(editor, "two");
        let mut tracker = TargetTracker::new();
        click(&mut tracker, &document, first);
        document.select_text(text, None);

        assert_eq!(tracker.current(&document), EditableTarget::PlainField(first));
    }

    #[test]
    fn detached_tracked_element_falls_through() {
        let mut document = MemoryDocument::new();
        let body = document.body();
        let stale = document.append_element(body, ElementSpec::text_area("gone"));
        let live = document.append_element(body, ElementSpec::input("here"));
        let mut tracker = TargetTracker::new();
        click(&mut tracker, &document, stale);
        document.detach(stale);
        document.focus(live);

        assert_eq!(tracker.current(&document), EditableTarget::PlainField(live));
    }

    #[test]
    fn nothing_editable_resolves_to_none() {
        let mut document = MemoryDocument::new();
        let body = document.body();
        let heading = document.append_element(body, ElementSpec::div());
        let text = document.append_text(heading, "static");
        document.select_text(text, None);
        let mut tracker = TargetTracker::new();
        click(&mut tracker, &document, heading);

        let resolved = tracker.current(&document);
        assert_eq!(resolved, EditableTarget::None);
        assert_eq!(resolved.kind(), TargetKind::None);
    }

    #[test]
    fn content_editable_false_blocks_inheritance() {
        let mut document = MemoryDocument::new();
        let body = document.body();
        let editor = document.append_element(body, ElementSpec::rich_editor());
        let locked = document.append_element(
            editor,
            ElementSpec::div().with_content_editable(ContentEditable::False),
        );

        assert!(is_editable(&document, &editor));
        assert!(!is_editable(&document, &locked));
    }
}

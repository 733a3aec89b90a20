//! In-process element tree implementing [`Document`] and [`Surface`].
//!
//! Hosts without a real DOM (the terminal binary, tests) use it to model
//! fields, rich editors, selection, focus and frames.

use crate::target::clipboard::{ClipboardSink, MemoryClipboard};
use crate::target::writer::{FrameContext, HighlightStyle, Surface};
use crate::target::{Document, ElementFacts, FieldKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentEditable {
    #[default]
    Inherit,
    True,
    False,
}

#[derive(Debug, Clone)]
pub struct ElementSpec {
    field: Option<FieldKind>,
    content_editable: ContentEditable,
    value: String,
    range_api: bool,
}

impl ElementSpec {
    pub fn text_area(value: &str) -> Self {
        Self::field(FieldKind::MultiLine, value)
    }

    pub fn input(value: &str) -> Self {
        Self::field(FieldKind::SingleLine, value)
    }

    pub fn div() -> Self {
        Self {
            field: None,
            content_editable: ContentEditable::Inherit,
            value: String::new(),
            range_api: false,
        }
    }

    pub fn rich_editor() -> Self {
        Self::div().with_content_editable(ContentEditable::True)
    }

    pub fn with_content_editable(mut self, content_editable: ContentEditable) -> Self {
        self.content_editable = content_editable;
        self
    }

    /// Models input types such as `email` or `number` that reject range edits.
    pub fn without_range_api(mut self) -> Self {
        self.range_api = false;
        self
    }

    fn field(kind: FieldKind, value: &str) -> Self {
        Self {
            field: Some(kind),
            content_editable: ContentEditable::Inherit,
            value: value.to_string(),
            range_api: true,
        }
    }
}

#[derive(Debug)]
struct ElementData {
    spec: ElementSpec,
    selection: (usize, usize),
    highlight: HighlightStyle,
}

#[derive(Debug)]
enum NodeData {
    Element(ElementData),
    Text(String),
}

#[derive(Debug)]
struct Node {
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    detached: bool,
    data: NodeData,
}

#[derive(Debug, Clone, Copy)]
struct Selection {
    anchor: NodeId,
    range: Option<(usize, usize)>,
}

#[derive(Debug)]
struct UndoEntry {
    node: NodeId,
    previous: String,
}

#[derive(Debug)]
pub struct MemoryDocument<C = MemoryClipboard> {
    nodes: Vec<Node>,
    body: NodeId,
    focused: Option<NodeId>,
    selection: Option<Selection>,
    frame: FrameContext,
    clipboard: C,
    undo: Vec<UndoEntry>,
}

impl MemoryDocument<MemoryClipboard> {
    pub fn new() -> Self {
        Self::with_clipboard(MemoryClipboard::new())
    }
}

impl Default for MemoryDocument<MemoryClipboard> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: ClipboardSink> MemoryDocument<C> {
    pub fn with_clipboard(clipboard: C) -> Self {
        let body = Node {
            parent: None,
            children: Vec::new(),
            detached: false,
            data: NodeData::Element(ElementData {
                spec: ElementSpec::div(),
                selection: (0, 0),
                highlight: HighlightStyle::default(),
            }),
        };
        Self {
            nodes: vec![body],
            body: NodeId(0),
            focused: None,
            selection: None,
            frame: FrameContext::top_level_single_frame(),
            clipboard,
            undo: Vec::new(),
        }
    }

    pub fn body(&self) -> NodeId {
        self.body
    }

    pub fn set_frame(&mut self, frame: FrameContext) {
        self.frame = frame;
    }

    pub fn append_element(&mut self, parent: NodeId, spec: ElementSpec) -> NodeId {
        let caret = spec.value.chars().count();
        self.push_node(
            parent,
            NodeData::Element(ElementData {
                spec,
                selection: (caret, caret),
                highlight: HighlightStyle::default(),
            }),
        )
    }

    pub fn append_text(&mut self, parent: NodeId, text: &str) -> NodeId {
        self.push_node(parent, NodeData::Text(text.to_string()))
    }

    pub fn focus(&mut self, node: NodeId) {
        self.focused = Some(node);
    }

    /// Places the live selection in `node`, with an optional character range
    /// inside a text node. A backwards range is stored start-first.
    pub fn select_text(&mut self, node: NodeId, range: Option<(usize, usize)>) {
        self.selection = Some(Selection {
            anchor: node,
            range: range.map(|(anchor, focus)| (anchor.min(focus), anchor.max(focus))),
        });
    }

    pub fn select_field_range(&mut self, field: NodeId, start: usize, end: usize) {
        if let Some(element) = self.element_data_mut(field) {
            let len = element.spec.value.chars().count();
            let start = start.min(len);
            element.selection = (start, end.clamp(start, len));
        }
    }

    pub fn detach(&mut self, node: NodeId) {
        if let Some(entry) = self.nodes.get_mut(node.0) {
            entry.detached = true;
        }
        if self.focused.is_some_and(|focused| !self.is_connected(focused)) {
            self.focused = None;
        }
        if self
            .selection
            .is_some_and(|selection| !self.is_connected(selection.anchor))
        {
            self.selection = None;
        }
    }

    pub fn value(&self, field: NodeId) -> String {
        self.element_data(field)
            .map(|element| element.spec.value.clone())
            .unwrap_or_default()
    }

    pub fn text_content(&self, node: NodeId) -> String {
        let mut collected = String::new();
        self.collect_text(node, &mut collected);
        collected
    }

    pub fn undo_depth(&self) -> usize {
        self.undo.len()
    }

    /// Reverts the latest recorded rich-text insertion.
    pub fn undo(&mut self) -> bool {
        let Some(entry) = self.undo.pop() else {
            return false;
        };
        if let Some(Node {
            data: NodeData::Text(text),
            ..
        }) = self.nodes.get_mut(entry.node.0)
        {
            *text = entry.previous;
        }
        true
    }

    fn push_node(&mut self, parent: NodeId, data: NodeData) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            parent: Some(parent),
            children: Vec::new(),
            detached: false,
            data,
        });
        if let Some(parent_node) = self.nodes.get_mut(parent.0) {
            parent_node.children.push(id);
        }
        id
    }

    fn element_data(&self, node: NodeId) -> Option<&ElementData> {
        match self.nodes.get(node.0).map(|entry| &entry.data) {
            Some(NodeData::Element(element)) => Some(element),
            _ => None,
        }
    }

    fn element_data_mut(&mut self, node: NodeId) -> Option<&mut ElementData> {
        match self.nodes.get_mut(node.0).map(|entry| &mut entry.data) {
            Some(NodeData::Element(element)) => Some(element),
            _ => None,
        }
    }

    fn is_connected(&self, node: NodeId) -> bool {
        let mut current = Some(node);
        while let Some(id) = current {
            let Some(entry) = self.nodes.get(id.0) else {
                return false;
            };
            if entry.detached {
                return false;
            }
            current = entry.parent;
        }
        true
    }

    fn effective_content_editable(&self, node: NodeId) -> bool {
        let mut current = Some(node);
        while let Some(id) = current {
            let Some(entry) = self.nodes.get(id.0) else {
                return false;
            };
            if let NodeData::Element(element) = &entry.data {
                match element.spec.content_editable {
                    ContentEditable::True => return true,
                    ContentEditable::False => return false,
                    ContentEditable::Inherit => {}
                }
            }
            current = entry.parent;
        }
        false
    }

    fn collect_text(&self, node: NodeId, collected: &mut String) {
        let Some(entry) = self.nodes.get(node.0) else {
            return;
        };
        match &entry.data {
            NodeData::Text(text) => collected.push_str(text),
            NodeData::Element(_) => {
                for child in &entry.children {
                    self.collect_text(*child, collected);
                }
            }
        }
    }
}

impl<C: ClipboardSink> Document for MemoryDocument<C> {
    type Node = NodeId;

    fn element(&self, node: &NodeId) -> Option<ElementFacts> {
        let element = self.element_data(*node)?;
        Some(ElementFacts {
            field: element.spec.field,
            content_editable: self.effective_content_editable(*node),
            connected: self.is_connected(*node),
        })
    }

    fn parent(&self, node: &NodeId) -> Option<NodeId> {
        self.nodes.get(node.0).and_then(|entry| entry.parent)
    }

    fn selection_anchor(&self) -> Option<NodeId> {
        self.selection
            .map(|selection| selection.anchor)
            .filter(|anchor| self.is_connected(*anchor))
    }

    fn active_element(&self) -> Option<NodeId> {
        self.focused.filter(|focused| self.is_connected(*focused))
    }

    fn is_document_root(&self, node: &NodeId) -> bool {
        *node == self.body
    }

    fn page_text(&self) -> String {
        self.text_content(self.body)
    }
}

impl<C: ClipboardSink> Surface for MemoryDocument<C> {
    fn replace_field_range(&mut self, field: &NodeId, text: &str) -> bool {
        let Some(element) = self.element_data_mut(*field) else {
            return false;
        };
        if element.spec.field.is_none() || !element.spec.range_api {
            return false;
        }
        let (start, end) = element.selection;
        element.spec.value = splice_chars(&element.spec.value, start, end, text);
        let caret = start + text.chars().count();
        element.selection = (start, caret);
        true
    }

    fn set_field_value(&mut self, field: &NodeId, text: &str) {
        if let Some(element) = self.element_data_mut(*field) {
            element.spec.value = text.to_string();
            let caret = text.chars().count();
            element.selection = (caret, caret);
        }
    }

    fn insert_at_selection(&mut self, text: &str) -> bool {
        let Some(selection) = self.selection else {
            return false;
        };
        let editable = self
            .parent(&selection.anchor)
            .is_some_and(|parent| self.effective_content_editable(parent));
        if !editable {
            return false;
        }
        let Some(Node {
            data: NodeData::Text(current),
            ..
        }) = self.nodes.get_mut(selection.anchor.0)
        else {
            return false;
        };

        let len = current.chars().count();
        let (start, end) = selection.range.unwrap_or((len, len));
        let previous = current.clone();
        *current = splice_chars(&previous, start.min(len), end.min(len), text);
        self.undo.push(UndoEntry {
            node: selection.anchor,
            previous,
        });
        let caret = start.min(len) + text.chars().count();
        self.selection = Some(Selection {
            anchor: selection.anchor,
            range: Some((caret, caret)),
        });
        true
    }

    fn set_text_content(&mut self, node: &NodeId, text: &str) {
        let children = match self.nodes.get_mut(node.0) {
            Some(entry) => std::mem::take(&mut entry.children),
            None => return,
        };
        for child in children {
            if let Some(entry) = self.nodes.get_mut(child.0) {
                entry.detached = true;
            }
        }
        if self
            .selection
            .is_some_and(|selection| !self.is_connected(selection.anchor))
        {
            self.selection = None;
        }
        self.append_text(*node, text);
    }

    fn frame(&self) -> FrameContext {
        self.frame
    }

    fn write_clipboard(&mut self, text: &str) -> Result<(), String> {
        self.clipboard.write_text(text)
    }

    fn highlight(&self, node: &NodeId) -> HighlightStyle {
        self.element_data(*node)
            .map(|element| element.highlight.clone())
            .unwrap_or_default()
    }

    fn set_highlight(&mut self, node: &NodeId, style: HighlightStyle) {
        if let Some(element) = self.element_data_mut(*node) {
            element.highlight = style;
        }
    }
}

fn splice_chars(source: &str, start: usize, end: usize, replacement: &str) -> String {
    let mut spliced = String::with_capacity(source.len() + replacement.len());
    spliced.extend(source.chars().take(start));
    spliced.push_str(replacement);
    spliced.extend(source.chars().skip(end));
    spliced
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splice_respects_multibyte_characters() {
        assert_eq!(splice_chars("héllo wörld", 6, 11, "world"), "héllo world");
    }

    #[test]
    fn collapsed_field_selection_inserts_at_caret() {
        let mut document = MemoryDocument::new();
        let body = document.body();
        let field = document.append_element(body, ElementSpec::input("ab"));
        document.select_field_range(field, 1, 1);

        assert!(document.replace_field_range(&field, "X"));
        assert_eq!(document.value(field), "aXb");
    }

    #[test]
    fn insertion_outside_editable_region_is_refused() {
        let mut document = MemoryDocument::new();
        let body = document.body();
        let text = document.append_text(body, "static");
        document.select_text(text, Some((0, 6)));

        assert!(!document.insert_at_selection("changed"));
        assert_eq!(document.page_text(), "static");
    }

    #[test]
    fn undo_restores_text_before_insertion() {
        let mut document = MemoryDocument::new();
        let body = document.body();
        let editor = document.append_element(body, ElementSpec::rich_editor());
        let text = document.append_text(editor, "ello");
        document.select_text(text, Some((0, 4)));

        assert!(document.insert_at_selection("Hello"));
        assert_eq!(document.text_content(editor), "Hello");
        assert!(document.undo());
        assert_eq!(document.text_content(editor), "ello");
    }

    #[test]
    fn backwards_selection_replaces_the_same_span() {
        let mut document = MemoryDocument::new();
        let body = document.body();
        let editor = document.append_element(body, ElementSpec::rich_editor());
        let text = document.append_text(editor, "i has a apple");
        document.select_text(text, Some((5, 2)));

        assert!(document.insert_at_selection("have"));
        assert_eq!(document.text_content(editor), "i have a apple");
    }

    #[test]
    fn detaching_clears_focus_and_selection() {
        let mut document = MemoryDocument::new();
        let body = document.body();
        let editor = document.append_element(body, ElementSpec::rich_editor());
        let text = document.append_text(editor, "x");
        document.focus(editor);
        document.select_text(text, None);
        document.detach(editor);

        assert_eq!(document.active_element(), None);
        assert_eq!(document.selection_anchor(), None);
        assert!(!document.element(&editor).is_some_and(|facts| facts.is_editable()));
    }
}

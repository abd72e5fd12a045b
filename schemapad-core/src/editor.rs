//! Editor boundary: what the collaboration layer needs from a code editor
//! view, plus [`HeadlessEditor`], a display-less implementation used by
//! the demo binary and the tests.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::buffer::{ModelId, TextModel};
use crate::error::CoreResult;
use crate::listeners::{ListenerId, Listeners};
use crate::{ContentChange, Position, Selection};

pub type EditorId = u64;
pub type DecorationId = u64;

static NEXT_EDITOR_ID: AtomicU64 = AtomicU64::new(1);

const DEFAULT_LINE_HEIGHT: u32 = 19;

/// A styled range. Class names refer to installed [`StyleRule`]s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoration {
    pub start: Position,
    pub end: Position,
    pub class_name: String,
    /// Class of a zero-width marker drawn before the range.
    pub before_content_class: Option<String>,
    /// Class of a zero-width marker drawn after the range.
    pub after_content_class: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WidgetPlacement {
    Above,
    Below,
}

/// A small overlay anchored to a range, e.g. a collaborator's name tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentWidget {
    pub id: String,
    pub label: String,
    pub background: String,
    pub foreground: String,
    pub height: u32,
    pub start: Position,
    pub end: Position,
    pub placement: WidgetPlacement,
}

/// One CSS-like rule installed into the editor's style sheet.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StyleRule {
    pub selector: String,
    pub declarations: String,
}

/// A view onto a [`TextModel`].
pub trait EditorView {
    fn id(&self) -> EditorId;

    /// Model currently shown, if any.
    fn model_id(&self) -> Option<ModelId>;

    fn selection(&self) -> Option<Selection>;

    fn set_selection(&self, selection: Selection);

    fn on_did_change_selection(&self, callback: Box<dyn Fn(&Selection)>) -> ListenerId;

    fn remove_listener(&self, id: ListenerId) -> bool;

    /// Remove the decorations in `old` and add `new`, returning the ids of
    /// the added ones.
    fn delta_decorations(&self, old: &[DecorationId], new: Vec<Decoration>) -> Vec<DecorationId>;

    /// Add or replace (same id) a content widget.
    fn add_content_widget(&self, widget: ContentWidget);

    fn remove_content_widget(&self, id: &str);

    fn install_style_rules(&self, rules: &[StyleRule]);

    fn line_height(&self) -> u32;
}

// ───────────────────────────────────────────────────────────────────
// HeadlessEditor
// ───────────────────────────────────────────────────────────────────

/// An editor without a display. It keeps the selection, decorations,
/// widgets and style rules it is given so they can be inspected.
pub struct HeadlessEditor {
    id: EditorId,
    model: RefCell<Option<Rc<dyn TextModel>>>,
    selection: Cell<Option<Selection>>,
    decorations: RefCell<BTreeMap<DecorationId, Decoration>>,
    next_decoration: Cell<DecorationId>,
    widgets: RefCell<BTreeMap<String, ContentWidget>>,
    styles: RefCell<Vec<StyleRule>>,
    selection_listeners: Listeners<Selection>,
    line_height: u32,
}

impl HeadlessEditor {
    pub fn new(model: Rc<dyn TextModel>) -> Self {
        let editor = Self::detached();
        editor.set_model(Some(model));
        editor
    }

    /// An editor not showing any model.
    pub fn detached() -> Self {
        Self {
            id: NEXT_EDITOR_ID.fetch_add(1, Ordering::Relaxed),
            model: RefCell::new(None),
            selection: Cell::new(None),
            decorations: RefCell::new(BTreeMap::new()),
            next_decoration: Cell::new(1),
            widgets: RefCell::new(BTreeMap::new()),
            styles: RefCell::new(Vec::new()),
            selection_listeners: Listeners::new(),
            line_height: DEFAULT_LINE_HEIGHT,
        }
    }

    /// Switch the displayed model. The caret moves to the start.
    pub fn set_model(&self, model: Option<Rc<dyn TextModel>>) {
        let has_model = model.is_some();
        *self.model.borrow_mut() = model;
        self.selection.set(has_model.then(|| Selection::caret(Position::START)));
    }

    pub fn model(&self) -> Option<Rc<dyn TextModel>> {
        self.model.borrow().clone()
    }

    /// Select from byte offset `anchor` to byte offset `head`.
    pub fn select_offsets(&self, anchor: usize, head: usize) {
        let Some(model) = self.model() else {
            return;
        };
        let selection =
            Selection::from_anchor_head(model.position_at(anchor), model.position_at(head));
        self.set_selection(selection);
    }

    pub fn set_caret_offset(&self, offset: usize) {
        self.select_offsets(offset, offset);
    }

    /// Selection as `(start, end)` byte offsets.
    pub fn selection_offsets(&self) -> Option<(usize, usize)> {
        let model = self.model()?;
        let selection = self.selection.get()?;
        Some((model.offset_at(selection.start), model.offset_at(selection.end)))
    }

    /// Replace the selection with `text` the way typing does, leaving the
    /// caret after the inserted text.
    pub fn type_text(&self, text: &str) -> CoreResult<()> {
        let Some(model) = self.model() else {
            return Ok(());
        };
        let (start, end) = self.selection_offsets().unwrap_or((0, 0));
        let text = model.line_ending().normalize(text);
        model.apply_edits(&[ContentChange::replace(start, end - start, text.as_str())])?;
        self.set_caret_offset(start + text.len());
        Ok(())
    }

    pub fn decorations(&self) -> Vec<Decoration> {
        self.decorations.borrow().values().cloned().collect()
    }

    pub fn widgets(&self) -> Vec<ContentWidget> {
        self.widgets.borrow().values().cloned().collect()
    }

    pub fn style_rules(&self) -> Vec<StyleRule> {
        self.styles.borrow().clone()
    }
}

impl EditorView for HeadlessEditor {
    fn id(&self) -> EditorId {
        self.id
    }

    fn model_id(&self) -> Option<ModelId> {
        self.model.borrow().as_ref().map(|m| m.id())
    }

    fn selection(&self) -> Option<Selection> {
        self.selection.get()
    }

    fn set_selection(&self, selection: Selection) {
        self.selection.set(Some(selection));
        self.selection_listeners.emit(&selection);
    }

    fn on_did_change_selection(&self, callback: Box<dyn Fn(&Selection)>) -> ListenerId {
        self.selection_listeners.subscribe_boxed(callback)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.selection_listeners.unsubscribe(id)
    }

    fn delta_decorations(&self, old: &[DecorationId], new: Vec<Decoration>) -> Vec<DecorationId> {
        let mut decorations = self.decorations.borrow_mut();
        for id in old {
            decorations.remove(id);
        }
        new.into_iter()
            .map(|decoration| {
                let id = self.next_decoration.get();
                self.next_decoration.set(id + 1);
                decorations.insert(id, decoration);
                id
            })
            .collect()
    }

    fn add_content_widget(&self, widget: ContentWidget) {
        self.widgets.borrow_mut().insert(widget.id.clone(), widget);
    }

    fn remove_content_widget(&self, id: &str) {
        self.widgets.borrow_mut().remove(id);
    }

    fn install_style_rules(&self, rules: &[StyleRule]) {
        self.styles.borrow_mut().extend_from_slice(rules);
    }

    fn line_height(&self) -> u32 {
        self.line_height
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::TextBuffer;

    #[test]
    fn test_type_text_replaces_selection() {
        let model: Rc<dyn TextModel> = Rc::new(TextBuffer::new("type Query {}"));
        let editor = HeadlessEditor::new(model.clone());

        editor.select_offsets(10, 5);
        editor.type_text("Mutation").unwrap();

        assert_eq!(model.value(), "type Mutation {}");
        assert_eq!(editor.selection_offsets(), Some((13, 13)));
    }

    #[test]
    fn test_delta_decorations_replaces_old_ids() {
        let editor = HeadlessEditor::detached();
        let decoration = Decoration {
            start: Position::START,
            end: Position::new(1, 3),
            class_name: "x".into(),
            before_content_class: None,
            after_content_class: None,
        };
        let first = editor.delta_decorations(&[], vec![decoration.clone(), decoration.clone()]);
        assert_eq!(first.len(), 2);
        let second = editor.delta_decorations(&first, vec![decoration]);
        assert_eq!(editor.decorations().len(), 1);
        assert!(!first.contains(&second[0]));
    }

    #[test]
    fn test_selection_listener_fires() {
        let editor = HeadlessEditor::new(Rc::new(TextBuffer::new("abc")));
        let seen = Rc::new(Cell::new(None));
        let s = seen.clone();
        editor.on_did_change_selection(Box::new(move |sel| s.set(Some(*sel))));
        editor.set_caret_offset(2);
        assert_eq!(seen.get(), Some(Selection::caret(Position::new(1, 3))));
    }
}

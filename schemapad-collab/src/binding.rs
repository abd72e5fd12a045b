//! Two-way binding between the replicated text and a local buffer.
//!
//! ```text
//!            remote update                       user typing
//!                 │                                   │
//!                 ▼                                   ▼
//!   ReplicatedText::apply_update           TextModel content change
//!     ├─ before-remote hook: capture        ├─ capture selections
//!     │  editor selections                  └─ gate: one local-origin
//!     └─ text observer                         transaction, edits in
//!          └─ gate: replay ops into            descending offset order
//!             the buffer, restore selections
//! ```
//!
//! The [`SyncGate`] keeps each direction from echoing back: while the
//! binding replays remote ops, the buffer change events they cause are
//! ignored, and while it forwards a local edit, the resulting text
//! notification is ignored.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use schemapad_core::{
    ContentChange, ContentChangeEvent, CoreError, EditorId, EditorView, LineEnding, ListenerId,
    RelativePosition, ReplicatedText, Selection, SelectionDirection, TextModel, TextOp,
};
use thiserror::Error;
use yrs::{ReadTxn, Subscription, TransactionMut};

use crate::presence::PresenceTracker;
use crate::protocol::PeerSelection;
use crate::transport::{update_local_state, Room};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BindingError {
    #[error("protocol violation in text change: {0}")]
    Protocol(String),

    #[error("text change reaches offset {offset} but the buffer holds {len} bytes")]
    OutOfRange { offset: usize, len: usize },

    #[error("buffer rejected edit: {0}")]
    Buffer(#[from] CoreError),
}

// ───────────────────────────────────────────────────────────────────
// Reentrancy gate
// ───────────────────────────────────────────────────────────────────

/// A non-blocking mutual exclusion flag: a closure run while the gate is
/// held is skipped, not queued.
#[derive(Debug, Default)]
pub struct SyncGate {
    held: Cell<bool>,
}

struct GateGuard<'a>(&'a Cell<bool>);

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

impl SyncGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` unless the gate is already held. Returns `None` if skipped.
    pub fn run<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        if self.held.replace(true) {
            return None;
        }
        let _guard = GateGuard(&self.held);
        Some(f())
    }

    pub fn is_held(&self) -> bool {
        self.held.get()
    }

    pub fn reset(&self) {
        self.held.set(false);
    }
}

/// An editor selection anchored to content.
#[derive(Debug, Clone)]
pub struct RelativeSelection {
    pub start: RelativePosition,
    pub end: RelativePosition,
    pub direction: SelectionDirection,
}

/// Checks an op list against the buffer length it will be applied to.
pub fn validate_ops(ops: &[TextOp], len: usize) -> Result<(), BindingError> {
    let mut index = 0usize;
    let mut len = len;
    for op in ops {
        match op {
            TextOp::Retain(n) => {
                index += *n as usize;
                if index > len {
                    return Err(BindingError::OutOfRange { offset: index, len });
                }
            }
            TextOp::Insert(chunk) => {
                index += chunk.len();
                len += chunk.len();
            }
            TextOp::Delete(n) => {
                let end = index + *n as usize;
                if end > len {
                    return Err(BindingError::OutOfRange { offset: end, len });
                }
                len -= *n as usize;
            }
        }
    }
    Ok(())
}

// ───────────────────────────────────────────────────────────────────
// DocumentBinding
// ───────────────────────────────────────────────────────────────────

struct Attachments {
    _text_observer: Subscription,
    before_remote: ListenerId,
    content_listener: ListenerId,
    selection_listeners: Vec<(Rc<dyn EditorView>, ListenerId)>,
}

struct BindingInner {
    text: ReplicatedText,
    model: Rc<dyn TextModel>,
    editors: Vec<Rc<dyn EditorView>>,
    room: Option<Rc<dyn Room>>,
    gate: SyncGate,
    saved_selections: RefCell<HashMap<EditorId, RelativeSelection>>,
    presence: RefCell<Option<PresenceTracker>>,
    attachments: RefCell<Option<Attachments>>,
    last_error: RefCell<Option<BindingError>>,
    remote_passes: Cell<u64>,
}

/// Keeps one [`TextModel`] equal to one [`ReplicatedText`].
///
/// Dropping the binding disposes it.
pub struct DocumentBinding {
    inner: Rc<BindingInner>,
}

impl DocumentBinding {
    /// Attach `model` to `text`. The buffer is overwritten with the
    /// replicated content if they differ. With a `room`, editor selections
    /// are published into the local presence state.
    ///
    /// Selection-change handlers are registered on every editor; only
    /// those showing `model` take part in capture and restore.
    pub fn attach(
        text: ReplicatedText,
        model: Rc<dyn TextModel>,
        editors: Vec<Rc<dyn EditorView>>,
        room: Option<Rc<dyn Room>>,
    ) -> Self {
        let inner = Rc::new(BindingInner {
            text,
            model,
            editors,
            room,
            gate: SyncGate::new(),
            saved_selections: RefCell::new(HashMap::new()),
            presence: RefCell::new(None),
            attachments: RefCell::new(None),
            last_error: RefCell::new(None),
            remote_passes: Cell::new(0),
        });

        inner.model.set_line_ending(LineEnding::Lf);
        let current = inner.text.text();
        if inner.model.value() != current {
            log::debug!(
                "binding: replacing {} buffer bytes with {} replicated bytes",
                inner.model.len(),
                current.len()
            );
            inner.gate.run(|| inner.model.set_value(&current));
        }

        let weak = Rc::downgrade(&inner);
        let text_observer = inner.text.observe_text({
            let weak = weak.clone();
            move |txn, ops| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_text_change(txn, ops);
                }
            }
        });
        let before_remote = inner.text.on_before_remote({
            let weak = weak.clone();
            move |_| {
                if let Some(inner) = weak.upgrade() {
                    if !inner.gate.is_held() {
                        inner.capture_selections();
                    }
                }
            }
        });
        let content_listener = inner.model.on_did_change_content(Box::new({
            let weak = weak.clone();
            move |event| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_local_change(event);
                }
            }
        }));
        let selection_listeners = inner
            .editors
            .iter()
            .map(|editor| {
                let weak: Weak<BindingInner> = weak.clone();
                let editor_id = editor.id();
                let id = editor.on_did_change_selection(Box::new(move |selection| {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_selection_change(editor_id, selection);
                    }
                }));
                (editor.clone(), id)
            })
            .collect();

        *inner.attachments.borrow_mut() = Some(Attachments {
            _text_observer: text_observer,
            before_remote,
            content_listener,
            selection_listeners,
        });
        Self { inner }
    }

    /// Render remote selections through `presence` after every text change.
    pub fn set_presence(&self, presence: Option<PresenceTracker>) {
        *self.inner.presence.borrow_mut() = presence;
    }

    /// Replay an op list against the buffer as if it came from the
    /// replicated text. The list must be expressed against the current
    /// buffer content.
    pub fn apply_remote_ops(&self, ops: &[TextOp]) -> Result<(), BindingError> {
        let inner = &self.inner;
        let result = inner
            .text
            .with_read(|txn| inner.gate.run(|| inner.replay(txn, ops)))
            .flatten()
            .unwrap_or(Ok(()));
        if let Err(e) = &result {
            inner.fail(e.clone());
        }
        result
    }

    /// Error of the most recent failed sync pass.
    pub fn last_error(&self) -> Option<BindingError> {
        self.inner.last_error.borrow().clone()
    }

    pub fn take_error(&self) -> Option<BindingError> {
        self.inner.last_error.take()
    }

    /// Number of remote change passes replayed into the buffer.
    pub fn remote_passes(&self) -> u64 {
        self.inner.remote_passes.get()
    }

    pub fn text(&self) -> &ReplicatedText {
        &self.inner.text
    }

    pub fn model(&self) -> Rc<dyn TextModel> {
        self.inner.model.clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.attachments.borrow().is_none()
    }

    /// Detach every handler. Safe to call more than once.
    pub fn dispose(&self) {
        let inner = &self.inner;
        let Some(attachments) = inner.attachments.take() else {
            return;
        };
        inner.text.remove_before_remote(attachments.before_remote);
        inner.model.remove_listener(attachments.content_listener);
        for (editor, id) in &attachments.selection_listeners {
            editor.remove_listener(*id);
        }
        drop(attachments);
        inner.saved_selections.borrow_mut().clear();
        inner.presence.borrow_mut().take();
        inner.gate.reset();
        log::debug!("binding disposed");
    }
}

impl Drop for DocumentBinding {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl BindingInner {
    fn shows_model(&self, editor: &dyn EditorView) -> bool {
        editor.model_id() == Some(self.model.id())
    }

    fn editor(&self, id: EditorId) -> Option<&Rc<dyn EditorView>> {
        self.editors.iter().find(|e| e.id() == id)
    }

    fn fail(&self, error: BindingError) {
        log::error!("text sync pass failed: {error}");
        *self.last_error.borrow_mut() = Some(error);
    }

    fn capture_selections(&self) {
        let mut saved = HashMap::new();
        for editor in &self.editors {
            if !self.shows_model(editor.as_ref()) {
                continue;
            }
            let Some(selection) = editor.selection() else {
                continue;
            };
            let start = self.model.offset_at(selection.start) as u32;
            let end = self.model.offset_at(selection.end) as u32;
            if let [Some(start), Some(end)] = self.text.relative_positions(&[start, end]).as_slice()
            {
                saved.insert(
                    editor.id(),
                    RelativeSelection {
                        start: start.clone(),
                        end: end.clone(),
                        direction: selection.direction,
                    },
                );
            }
        }
        *self.saved_selections.borrow_mut() = saved;
    }

    fn on_text_change(&self, txn: &TransactionMut, ops: Result<Vec<TextOp>, CoreError>) {
        match ops {
            Ok(ops) => {
                if let Some(Err(e)) = self.gate.run(|| self.replay(txn, &ops)) {
                    self.fail(e);
                }
            }
            Err(e) => self.fail(BindingError::Protocol(e.to_string())),
        }
        let presence = self.presence.borrow().clone();
        if let Some(presence) = presence {
            presence.render_in(txn);
        }
    }

    /// One remote pass. Runs with the gate held.
    fn replay<T: ReadTxn>(&self, txn: &T, ops: &[TextOp]) -> Result<(), BindingError> {
        if self.model.line_ending() != LineEnding::Lf {
            let before = self.model.value();
            self.model.set_line_ending(LineEnding::Lf);
            if self.model.value() != before {
                log::warn!("buffer line endings rewritten, reloading replicated content");
                self.model.set_value(&self.text.text_in(txn));
                self.restore_selections(txn);
                return Ok(());
            }
        }

        validate_ops(ops, self.model.len())?;
        let mut index = 0usize;
        for op in ops {
            match op {
                TextOp::Retain(n) => index += *n as usize,
                TextOp::Insert(chunk) => {
                    self.model
                        .apply_edits(&[ContentChange::insert(index, chunk.as_str())])?;
                    index += chunk.len();
                }
                TextOp::Delete(n) => {
                    self.model
                        .apply_edits(&[ContentChange::delete(index, *n as usize)])?;
                }
            }
        }
        self.restore_selections(txn);
        self.remote_passes.set(self.remote_passes.get() + 1);
        Ok(())
    }

    fn restore_selections<T: ReadTxn>(&self, txn: &T) {
        let saved: Vec<(EditorId, RelativeSelection)> = self
            .saved_selections
            .borrow()
            .iter()
            .map(|(id, sel)| (*id, sel.clone()))
            .collect();
        for (editor_id, saved) in saved {
            let Some(editor) = self.editor(editor_id) else {
                continue;
            };
            if !self.shows_model(editor.as_ref()) {
                continue;
            }
            match (
                self.text.resolve(txn, &saved.start),
                self.text.resolve(txn, &saved.end),
            ) {
                (Some(start), Some(end)) => {
                    let start = self.model.position_at(start as usize);
                    let end = self.model.position_at(end as usize);
                    editor.set_selection(Selection::with_direction(start, end, saved.direction));
                }
                _ => log::trace!("selection of editor {editor_id} no longer resolves"),
            }
        }
    }

    fn on_local_change(&self, event: &ContentChangeEvent) {
        if self.gate.is_held() {
            return;
        }
        self.capture_selections();
        let mut changes = event.changes.clone();
        ContentChange::sort_descending(&mut changes);
        let result = self.gate.run(|| {
            self.text.edit_local(|edit| {
                for change in &changes {
                    if change.length > 0 {
                        edit.remove(change.offset, change.length)?;
                    }
                    if !change.text.is_empty() {
                        edit.insert(change.offset, &change.text)?;
                    }
                }
                Ok(())
            })
        });
        if let Some(Err(e)) = result {
            self.fail(e.into());
        }
    }

    fn on_selection_change(&self, editor_id: EditorId, selection: &Selection) {
        // restores made by a remote pass keep the published positions valid
        if self.gate.is_held() {
            return;
        }
        let Some(room) = &self.room else {
            return;
        };
        let Some(editor) = self.editor(editor_id) else {
            return;
        };
        if !self.shows_model(editor.as_ref()) {
            return;
        }
        let anchor = self.model.offset_at(selection.anchor()) as u32;
        let head = self.model.offset_at(selection.head()) as u32;
        let positions = self.text.relative_positions(&[anchor, head]);
        let [Some(anchor), Some(head)] = positions.as_slice() else {
            return;
        };
        let published = PeerSelection {
            anchor: anchor.to_bytes(),
            head: head.to_bytes(),
        };
        update_local_state(room.as_ref(), |state| state.selection = Some(published));
    }
}

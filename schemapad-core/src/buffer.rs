//! Local text buffer: the editor-side copy of the document.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::listeners::{ListenerId, Listeners};
use crate::{ContentChange, ContentChangeEvent, Position};

pub type ModelId = u64;

static NEXT_MODEL_ID: AtomicU64 = AtomicU64::new(1);

/// Line break convention of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LineEnding {
    #[default]
    Lf,
    CrLf,
}

impl LineEnding {
    pub fn as_str(&self) -> &'static str {
        match self {
            LineEnding::Lf => "\n",
            LineEnding::CrLf => "\r\n",
        }
    }

    /// Convention used by `text`: CRLF if it contains any `\r\n`.
    pub fn detect(text: &str) -> Self {
        if text.contains("\r\n") {
            LineEnding::CrLf
        } else {
            LineEnding::Lf
        }
    }

    /// Rewrite every line break of `text` to this convention.
    pub fn normalize(&self, text: &str) -> String {
        let lf = text.replace("\r\n", "\n");
        match self {
            LineEnding::Lf => lf,
            LineEnding::CrLf => lf.replace('\n', "\r\n"),
        }
    }
}

/// The editable text an editor displays.
///
/// Methods take `&self` so content-change listeners can read the model
/// while an event is being dispatched.
pub trait TextModel {
    fn id(&self) -> ModelId;

    fn value(&self) -> String;

    /// Length in bytes.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace the whole content.
    fn set_value(&self, text: &str);

    /// Apply non-overlapping edits expressed against the current content.
    /// Either every edit applies or none does.
    fn apply_edits(&self, edits: &[ContentChange]) -> CoreResult<()>;

    /// Byte offset of a position, clamped into the buffer.
    fn offset_at(&self, position: Position) -> usize;

    /// Position of a byte offset, clamped into the buffer.
    fn position_at(&self, offset: usize) -> Position;

    fn line_ending(&self) -> LineEnding;

    /// Switch convention and rewrite existing line breaks to it.
    fn set_line_ending(&self, line_ending: LineEnding);

    fn on_did_change_content(&self, callback: Box<dyn Fn(&ContentChangeEvent)>) -> ListenerId;

    fn remove_listener(&self, id: ListenerId) -> bool;
}

#[derive(Debug)]
struct BufferState {
    text: String,
    line_ending: LineEnding,
    version: u64,
}

/// In-memory [`TextModel`].
#[derive(Debug)]
pub struct TextBuffer {
    id: ModelId,
    state: RefCell<BufferState>,
    listeners: Listeners<ContentChangeEvent>,
}

impl TextBuffer {
    pub fn new(text: &str) -> Self {
        Self::with_line_ending(text, LineEnding::detect(text))
    }

    pub fn with_line_ending(text: &str, line_ending: LineEnding) -> Self {
        Self {
            id: NEXT_MODEL_ID.fetch_add(1, Ordering::Relaxed),
            state: RefCell::new(BufferState {
                text: text.to_string(),
                line_ending,
                version: 1,
            }),
            listeners: Listeners::new(),
        }
    }

    pub fn version(&self) -> u64 {
        self.state.borrow().version
    }

    pub fn line_count(&self) -> usize {
        self.state.borrow().text.matches('\n').count() + 1
    }

    fn replace_all(&self, text: String) {
        let event = {
            let mut state = self.state.borrow_mut();
            if state.text == text {
                return;
            }
            let old_len = state.text.len();
            state.text = text.clone();
            state.version += 1;
            ContentChangeEvent {
                changes: vec![ContentChange::replace(0, old_len, text)],
                version: state.version,
                is_flush: true,
            }
        };
        self.listeners.emit(&event);
    }
}

fn validate_edits(text: &str, edits: &[ContentChange]) -> CoreResult<()> {
    for edit in edits {
        if edit.end() > text.len() {
            return Err(CoreError::OffsetOutOfRange {
                offset: edit.end(),
                len: text.len(),
            });
        }
        for boundary in [edit.offset, edit.end()] {
            if !text.is_char_boundary(boundary) {
                return Err(CoreError::NotCharBoundary(boundary));
            }
        }
    }
    let mut ordered: Vec<&ContentChange> = edits.iter().collect();
    ordered.sort_by_key(|e| (e.offset, e.length));
    for pair in ordered.windows(2) {
        if pair[0].end() > pair[1].offset {
            return Err(CoreError::OverlappingEdits(pair[1].offset));
        }
    }
    Ok(())
}

impl TextModel for TextBuffer {
    fn id(&self) -> ModelId {
        self.id
    }

    fn value(&self) -> String {
        self.state.borrow().text.clone()
    }

    fn len(&self) -> usize {
        self.state.borrow().text.len()
    }

    fn set_value(&self, text: &str) {
        self.replace_all(text.to_string());
    }

    fn apply_edits(&self, edits: &[ContentChange]) -> CoreResult<()> {
        if edits.is_empty() {
            return Ok(());
        }
        let event = {
            let mut state = self.state.borrow_mut();
            validate_edits(&state.text, edits)?;
            let mut ordered = edits.to_vec();
            ContentChange::sort_descending(&mut ordered);
            for edit in &ordered {
                state.text.replace_range(edit.offset..edit.end(), &edit.text);
            }
            state.version += 1;
            ContentChangeEvent {
                changes: edits.to_vec(),
                version: state.version,
                is_flush: false,
            }
        };
        self.listeners.emit(&event);
        Ok(())
    }

    fn offset_at(&self, position: Position) -> usize {
        let state = self.state.borrow();
        let text = &state.text;
        let mut line_start = 0;
        for _ in 1..position.line.max(1) {
            match text[line_start..].find('\n') {
                Some(i) => line_start += i + 1,
                None => return text.len(),
            }
        }
        let line_end = text[line_start..]
            .find('\n')
            .map_or(text.len(), |i| line_start + i);
        let mut offset = (line_start + position.column.max(1) as usize - 1).min(line_end);
        while !text.is_char_boundary(offset) {
            offset -= 1;
        }
        offset
    }

    fn position_at(&self, offset: usize) -> Position {
        let state = self.state.borrow();
        let text = &state.text;
        let offset = offset.min(text.len());
        let before = &text.as_bytes()[..offset];
        let line = before.iter().filter(|b| **b == b'\n').count() + 1;
        let line_start = before
            .iter()
            .rposition(|b| *b == b'\n')
            .map_or(0, |i| i + 1);
        Position::new(line as u32, (offset - line_start + 1) as u32)
    }

    fn line_ending(&self) -> LineEnding {
        self.state.borrow().line_ending
    }

    fn set_line_ending(&self, line_ending: LineEnding) {
        let rewritten = {
            let mut state = self.state.borrow_mut();
            if state.line_ending == line_ending {
                return;
            }
            state.line_ending = line_ending;
            line_ending.normalize(&state.text)
        };
        self.replace_all(rewritten);
    }

    fn on_did_change_content(&self, callback: Box<dyn Fn(&ContentChangeEvent)>) -> ListenerId {
        self.listeners.subscribe_boxed(callback)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.unsubscribe(id)
    }
}

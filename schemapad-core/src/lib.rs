//! # schemapad-core: replicated text and local buffer primitives
//!
//! The building blocks the collaboration layer binds together:
//!
//! ```text
//! ┌──────────────────┐   TextOp list    ┌──────────────────┐
//! │ ReplicatedText   │ ───────────────► │ TextBuffer       │
//! │ (yrs Doc/Text)   │ ◄─────────────── │ (TextModel)      │
//! └──────────────────┘  ContentChange   └────────┬─────────┘
//!                                                │ shown by
//!                                                ▼
//!                                       ┌──────────────────┐
//!                                       │ HeadlessEditor   │
//!                                       │ (EditorView)     │
//!                                       └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`replicated`]: yrs wrapper: ops, relative positions, update streams
//! - [`buffer`]: in-memory text buffer with line/column addressing
//! - [`editor`]: editor boundary traits and a headless editor
//! - [`listeners`]: single-threaded callback registry
//! - [`error`]: core error type
//!
//! All offsets are UTF-8 byte offsets. Positions are 1-based line/column
//! pairs whose column counts bytes.

pub mod buffer;
pub mod editor;
pub mod error;
pub mod listeners;
pub mod replicated;

use serde::{Deserialize, Serialize};

pub use buffer::{LineEnding, ModelId, TextBuffer, TextModel};
pub use editor::{
    ContentWidget, Decoration, DecorationId, EditorId, EditorView, HeadlessEditor, StyleRule,
    WidgetPlacement,
};
pub use error::{CoreError, CoreResult};
pub use listeners::{ListenerId, Listeners};
pub use replicated::{
    text_ops, LocalEdit, RelativePosition, ReplicatedText, TextOp, UpdateOrigin, TEXT_NAME,
};

// ───────────────────────────────────────────────────────────────────
// Positions and selections
// ───────────────────────────────────────────────────────────────────

/// 1-based line/column position inside a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub column: u32,
}

impl Position {
    pub const START: Position = Position { line: 1, column: 1 };

    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

impl Default for Position {
    fn default() -> Self {
        Self::START
    }
}

/// Which end of a selection the caret sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SelectionDirection {
    /// Caret at the end (left-to-right drag).
    #[default]
    Forward,
    /// Caret at the start (right-to-left drag).
    Backward,
}

/// A selection range in an editor. `start <= end` always holds; the
/// direction tells where the caret (head) is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Selection {
    pub start: Position,
    pub end: Position,
    pub direction: SelectionDirection,
}

impl Selection {
    /// Empty selection (a caret) at `position`.
    pub fn caret(position: Position) -> Self {
        Self {
            start: position,
            end: position,
            direction: SelectionDirection::Forward,
        }
    }

    /// Selection from where the drag started (`anchor`) to the caret (`head`).
    pub fn from_anchor_head(anchor: Position, head: Position) -> Self {
        if head < anchor {
            Self {
                start: head,
                end: anchor,
                direction: SelectionDirection::Backward,
            }
        } else {
            Self {
                start: anchor,
                end: head,
                direction: SelectionDirection::Forward,
            }
        }
    }

    /// Selection with an explicit direction. The bounds are reordered if
    /// given backwards.
    pub fn with_direction(start: Position, end: Position, direction: SelectionDirection) -> Self {
        let (start, end) = if end < start { (end, start) } else { (start, end) };
        Self {
            start,
            end,
            direction,
        }
    }

    pub fn anchor(&self) -> Position {
        match self.direction {
            SelectionDirection::Forward => self.start,
            SelectionDirection::Backward => self.end,
        }
    }

    pub fn head(&self) -> Position {
        match self.direction {
            SelectionDirection::Forward => self.end,
            SelectionDirection::Backward => self.start,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

// ───────────────────────────────────────────────────────────────────
// Content changes
// ───────────────────────────────────────────────────────────────────

/// One replaced range of a buffer: `length` bytes at `offset` were
/// replaced by `text`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentChange {
    pub offset: usize,
    pub length: usize,
    pub text: String,
}

impl ContentChange {
    pub fn insert(offset: usize, text: impl Into<String>) -> Self {
        Self {
            offset,
            length: 0,
            text: text.into(),
        }
    }

    pub fn delete(offset: usize, length: usize) -> Self {
        Self {
            offset,
            length,
            text: String::new(),
        }
    }

    pub fn replace(offset: usize, length: usize, text: impl Into<String>) -> Self {
        Self {
            offset,
            length,
            text: text.into(),
        }
    }

    pub fn end(&self) -> usize {
        self.offset + self.length
    }

    /// Orders changes so that applying them one by one never shifts an
    /// offset that is still to be applied. At a shared offset the deletion
    /// goes first, and inserts go last to first so they end up in their
    /// original order.
    pub fn sort_descending(changes: &mut [ContentChange]) {
        changes.reverse();
        changes.sort_by(|a, b| b.offset.cmp(&a.offset).then(b.length.cmp(&a.length)));
    }
}

/// Emitted by a [`TextModel`] after its content changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentChangeEvent {
    /// Changes expressed against the content before the event.
    pub changes: Vec<ContentChange>,
    /// Buffer version after the change.
    pub version: u64,
    /// The whole content was replaced (`set_value`, line ending rewrite).
    pub is_flush: bool,
}

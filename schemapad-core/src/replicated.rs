//! Replicated text: a yrs document holding the shared schema source.
//!
//! Wraps a `Doc` with one `TextRef` and exposes exactly what the binding
//! layer needs:
//!
//! - change notifications as an ordered [`TextOp`] list,
//! - binary update streams tagged with their [`UpdateOrigin`],
//! - remote update application with "before remote transaction" hooks,
//! - [`RelativePosition`]s that survive concurrent edits.
//!
//! Offsets are UTF-8 byte offsets throughout. The document itself counts
//! in UTF-16 code units, which is what yrs uses for item clocks, and every
//! offset is converted at this boundary.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use yrs::types::Delta;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Any, Assoc, Doc, GetString, IndexScope, IndexedSequence, Observable, OffsetKind, Options,
    Origin, Out, ReadTxn, StateVector, StickyIndex, Subscription, Text, TextRef, Transact,
    Transaction, TransactionMut, Update,
};

use crate::error::{CoreError, CoreResult};
use crate::listeners::{ListenerId, Listeners};

/// Name of the shared text inside the document. Kept stable so stored
/// snapshots stay loadable.
pub const TEXT_NAME: &str = "monaco";

const LOCAL_ORIGIN: &str = "schemapad-local";
const REMOTE_ORIGIN: &str = "schemapad-remote";

/// One step of a text change, applied in order with a running offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextOp {
    /// Skip `n` bytes.
    Retain(u32),
    /// Insert text at the running offset.
    Insert(String),
    /// Remove `n` bytes at the running offset.
    Delete(u32),
}

/// Where a committed transaction came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOrigin {
    Local,
    Remote,
}

/// Converts a yrs delta into [`TextOp`]s with byte counts. `before` is the
/// content the delta applies to; retains and deletes walk it in UTF-16 code
/// units. Anything other than plain string inserts, retains and deletes is
/// rejected, as is a delta that does not fit `before`.
pub fn text_ops(deltas: &[Delta], before: &str) -> CoreResult<Vec<TextOp>> {
    let mut cursor = 0usize;
    let mut ops = Vec::with_capacity(deltas.len());
    for delta in deltas {
        match delta {
            Delta::Retain(n, _) | Delta::Deleted(n) => {
                let next = advance_utf16(before, cursor, *n).ok_or_else(|| {
                    CoreError::UnexpectedDelta(format!(
                        "{n} code units past byte {cursor} do not fit {} bytes",
                        before.len()
                    ))
                })?;
                let bytes = (next - cursor) as u32;
                cursor = next;
                ops.push(match delta {
                    Delta::Retain(..) => TextOp::Retain(bytes),
                    _ => TextOp::Delete(bytes),
                });
            }
            Delta::Inserted(Out::Any(Any::String(chunk)), _) => {
                ops.push(TextOp::Insert(chunk.to_string()))
            }
            Delta::Inserted(other, _) => {
                return Err(CoreError::UnexpectedDelta(format!(
                    "non-text insert {other:?}"
                )))
            }
        }
    }
    Ok(ops)
}

fn utf16_len(text: &str) -> u32 {
    text.encode_utf16().count() as u32
}

/// Byte offset `units` UTF-16 code units past byte `from`. `None` when the
/// text ends first or the count splits a surrogate pair.
fn advance_utf16(text: &str, from: usize, units: u32) -> Option<usize> {
    let mut remaining = units as usize;
    let mut offset = from;
    for ch in text.get(from..)?.chars() {
        if remaining == 0 {
            break;
        }
        remaining = remaining.checked_sub(ch.len_utf16())?;
        offset += ch.len_utf8();
    }
    (remaining == 0).then_some(offset)
}

/// Byte offset of a UTF-16 index, clamped to the text and floored to a
/// character boundary.
fn byte_offset(text: &str, units: u32) -> usize {
    let mut remaining = units as usize;
    for (offset, ch) in text.char_indices() {
        if ch.len_utf16() > remaining {
            return offset;
        }
        remaining -= ch.len_utf16();
    }
    text.len()
}

fn check_offset(content: &str, offset: usize) -> CoreResult<()> {
    if offset > content.len() {
        return Err(CoreError::OffsetOutOfRange {
            offset,
            len: content.len(),
        });
    }
    if !content.is_char_boundary(offset) {
        return Err(CoreError::NotCharBoundary(offset));
    }
    Ok(())
}

/// Byte-addressed edits inside one local transaction.
pub struct LocalEdit<'a, 'doc> {
    text: &'a TextRef,
    txn: &'a mut TransactionMut<'doc>,
    content: String,
}

impl LocalEdit<'_, '_> {
    pub fn insert(&mut self, offset: usize, chunk: &str) -> CoreResult<()> {
        check_offset(&self.content, offset)?;
        let index = utf16_len(&self.content[..offset]);
        self.text.insert(&mut *self.txn, index, chunk);
        self.content.insert_str(offset, chunk);
        Ok(())
    }

    pub fn remove(&mut self, offset: usize, len: usize) -> CoreResult<()> {
        let end = offset + len;
        check_offset(&self.content, offset)?;
        check_offset(&self.content, end)?;
        let index = utf16_len(&self.content[..offset]);
        let units = utf16_len(&self.content[offset..end]);
        self.text.remove_range(&mut *self.txn, index, units);
        self.content.replace_range(offset..end, "");
        Ok(())
    }

    /// Content with the edits made so far.
    pub fn content(&self) -> &str {
        &self.content
    }
}

// ───────────────────────────────────────────────────────────────────
// Relative positions
// ───────────────────────────────────────────────────────────────────

/// A position anchored to content rather than to an offset.
#[derive(Debug, Clone)]
pub struct RelativePosition(StickyIndex);

impl RelativePosition {
    /// Opaque wire form.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.encode_v1()
    }

    pub fn from_bytes(bytes: &[u8]) -> CoreResult<Self> {
        StickyIndex::decode_v1(bytes)
            .map(Self)
            .map_err(|e| CoreError::Decode(e.to_string()))
    }
}

// ───────────────────────────────────────────────────────────────────
// ReplicatedText
// ───────────────────────────────────────────────────────────────────

/// Cheap to clone; clones share the same document.
#[derive(Clone)]
pub struct ReplicatedText {
    doc: Doc,
    text: TextRef,
    before_remote: Rc<Listeners<()>>,
}

impl ReplicatedText {
    pub fn new() -> Self {
        let options = Options {
            offset_kind: OffsetKind::Utf16,
            ..Options::default()
        };
        let doc = Doc::with_options(options);
        let text = doc.get_or_insert_text(TEXT_NAME);
        Self {
            doc,
            text,
            before_remote: Rc::new(Listeners::new()),
        }
    }

    /// Rebuild a document from a stored snapshot.
    pub fn from_snapshot(snapshot: &[u8]) -> CoreResult<Self> {
        let replicated = Self::new();
        replicated.apply_update(snapshot)?;
        Ok(replicated)
    }

    /// Current content. Must not be called from inside a text observer;
    /// use [`ReplicatedText::text_in`] with the observer's transaction.
    pub fn text(&self) -> String {
        let txn = self.doc.transact();
        self.text.get_string(&txn)
    }

    pub fn text_in<T: ReadTxn>(&self, txn: &T) -> String {
        self.text.get_string(txn)
    }

    /// Length in bytes.
    pub fn len(&self) -> u32 {
        self.text().len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `f` with a read transaction. Returns `None` when a write
    /// transaction is active on this document.
    pub fn with_read<R>(&self, f: impl FnOnce(&Transaction) -> R) -> Option<R> {
        match self.doc.try_transact() {
            Ok(txn) => Some(f(&txn)),
            Err(e) => {
                log::trace!("read transaction unavailable: {e}");
                None
            }
        }
    }

    pub fn insert(&self, offset: u32, chunk: &str) -> CoreResult<()> {
        self.edit_local(|edit| edit.insert(offset as usize, chunk))
    }

    pub fn delete(&self, offset: u32, len: u32) -> CoreResult<()> {
        self.edit_local(|edit| edit.remove(offset as usize, len as usize))
    }

    /// Run several edits in one local-origin transaction. Edits made before
    /// an error are kept.
    pub fn edit_local<F>(&self, f: F) -> CoreResult<()>
    where
        F: FnOnce(&mut LocalEdit<'_, '_>) -> CoreResult<()>,
    {
        let mut txn = self
            .doc
            .try_transact_mut_with(LOCAL_ORIGIN)
            .map_err(|e| CoreError::Transaction(e.to_string()))?;
        let content = self.text.get_string(&txn);
        let mut edit = LocalEdit {
            text: &self.text,
            txn: &mut txn,
            content,
        };
        f(&mut edit)
    }

    /// Apply a v1 update received from a peer. Before-remote hooks run
    /// before the transaction opens.
    pub fn apply_update(&self, update: &[u8]) -> CoreResult<()> {
        let update = Update::decode_v1(update).map_err(|e| CoreError::Decode(e.to_string()))?;
        self.before_remote.emit(&());
        let mut txn = self
            .doc
            .try_transact_mut_with(REMOTE_ORIGIN)
            .map_err(|e| CoreError::Transaction(e.to_string()))?;
        txn.apply_update(update)
            .map_err(|e| CoreError::Apply(e.to_string()))
    }

    /// Full document state as a v1 update.
    pub fn encode_snapshot(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        self.snapshot_in(&txn)
    }

    pub fn snapshot_in<T: ReadTxn>(&self, txn: &T) -> Vec<u8> {
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Register a hook that runs right before each remote transaction.
    pub fn on_before_remote(&self, hook: impl Fn(&()) + 'static) -> ListenerId {
        self.before_remote.subscribe(hook)
    }

    pub fn remove_before_remote(&self, id: ListenerId) -> bool {
        self.before_remote.unsubscribe(id)
    }

    /// Observe content changes. The callback receives the committing
    /// transaction so it can resolve positions without opening a new one.
    /// Must not be called while a write transaction is open.
    pub fn observe_text<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&TransactionMut, CoreResult<Vec<TextOp>>) + 'static,
    {
        // content before each change, needed to turn UTF-16 counts into bytes
        let before = RefCell::new(self.with_read(|txn| self.text_in(txn)).unwrap_or_default());
        let text = self.text.clone();
        self.text.observe(move |txn, event| {
            let ops = text_ops(event.delta(txn), &before.borrow());
            *before.borrow_mut() = text.get_string(txn);
            callback(txn, ops);
        })
    }

    /// Observe committed binary updates of any origin.
    pub fn observe_updates<F>(&self, callback: F) -> CoreResult<Subscription>
    where
        F: Fn(UpdateOrigin, &[u8]) + 'static,
    {
        let remote = Origin::from(REMOTE_ORIGIN);
        self.doc
            .observe_update_v1(move |txn, event| {
                // an update with no structs and no deletions encodes as [0, 0]
                if event.update.len() <= 2 {
                    return;
                }
                let origin = if txn.origin() == Some(&remote) {
                    UpdateOrigin::Remote
                } else {
                    UpdateOrigin::Local
                };
                callback(origin, &event.update);
            })
            .map_err(|e| CoreError::Observe(format!("{e:?}")))
    }

    pub fn relative_position(&self, offset: u32) -> Option<RelativePosition> {
        self.relative_positions(&[offset]).pop().flatten()
    }

    /// Anchor several offsets in one transaction. Offsets past the end are
    /// clamped to the end and offsets inside a character snap to its start.
    /// The end itself is anchored to the text rather than to a character,
    /// so it keeps resolving to the end.
    pub fn relative_positions(&self, offsets: &[u32]) -> Vec<Option<RelativePosition>> {
        let mut txn = match self.doc.try_transact_mut() {
            Ok(txn) => txn,
            Err(e) => {
                log::trace!("cannot anchor positions: {e}");
                return vec![None; offsets.len()];
            }
        };
        let content = self.text.get_string(&txn);
        offsets
            .iter()
            .map(|offset| {
                let mut offset = (*offset as usize).min(content.len());
                while !content.is_char_boundary(offset) {
                    offset -= 1;
                }
                if offset == content.len() {
                    let scope = IndexScope::Root(Arc::from(TEXT_NAME));
                    return Some(RelativePosition(StickyIndex::new(scope, Assoc::After)));
                }
                let index = utf16_len(&content[..offset]);
                self.text
                    .sticky_index(&mut txn, index, Assoc::After)
                    .map(RelativePosition)
            })
            .collect()
    }

    /// Current byte offset of a relative position, or `None` if it no
    /// longer resolves in this document.
    pub fn resolve<T: ReadTxn>(&self, txn: &T, position: &RelativePosition) -> Option<u32> {
        let offset = position.0.get_offset(txn)?;
        let content = self.text.get_string(txn);
        Some(byte_offset(&content, offset.index) as u32)
    }

    pub fn resolve_now(&self, position: &RelativePosition) -> Option<u32> {
        self.with_read(|txn| self.resolve(txn, position)).flatten()
    }
}

impl Default for ReplicatedText {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn sync(from: &ReplicatedText, to: &ReplicatedText) {
        to.apply_update(&from.encode_snapshot()).unwrap();
    }

    #[test]
    fn test_insert_delete_and_snapshot() {
        let text = ReplicatedText::new();
        text.insert(0, "type Query {}").unwrap();
        text.delete(4, 6).unwrap();
        assert_eq!(text.text(), "type {}");

        let restored = ReplicatedText::from_snapshot(&text.encode_snapshot()).unwrap();
        assert_eq!(restored.text(), "type {}");
    }

    #[test]
    fn test_observe_text_reports_ops() {
        let a = ReplicatedText::new();
        a.insert(0, "hello world").unwrap();
        let b = ReplicatedText::from_snapshot(&a.encode_snapshot()).unwrap();

        let seen: Rc<RefCell<Vec<TextOp>>> = Rc::default();
        let s = seen.clone();
        let _sub = b.observe_text(move |_, ops| s.borrow_mut().extend(ops.unwrap()));

        a.edit_local(|edit| {
            edit.remove(0, 6)?;
            edit.insert(5, "!")
        })
        .unwrap();
        sync(&a, &b);

        assert_eq!(b.text(), "world!");
        let ops = seen.borrow().clone();
        assert_eq!(ops.first(), Some(&TextOp::Delete(6)));
        assert!(ops.contains(&TextOp::Insert("!".into())));
    }

    #[test]
    fn test_update_origins() {
        let a = ReplicatedText::new();
        let b = ReplicatedText::new();
        let origins: Rc<RefCell<Vec<UpdateOrigin>>> = Rc::default();
        let o = origins.clone();
        let _sub = b
            .observe_updates(move |origin, _| o.borrow_mut().push(origin))
            .unwrap();

        a.insert(0, "abc").unwrap();
        sync(&a, &b);
        b.insert(3, "d").unwrap();

        assert_eq!(
            *origins.borrow(),
            vec![UpdateOrigin::Remote, UpdateOrigin::Local]
        );
    }

    #[test]
    fn test_reapplying_update_changes_nothing() {
        let a = ReplicatedText::new();
        a.insert(0, "abc").unwrap();
        let b = ReplicatedText::new();
        let calls = Rc::new(std::cell::Cell::new(0));
        let c = calls.clone();
        let _sub = b.observe_text(move |_, _| c.set(c.get() + 1));

        let update = a.encode_snapshot();
        b.apply_update(&update).unwrap();
        b.apply_update(&update).unwrap();
        assert_eq!(b.text(), "abc");
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_before_remote_hook_runs_first() {
        let a = ReplicatedText::new();
        a.insert(0, "x").unwrap();
        let b = ReplicatedText::new();
        let log: Rc<RefCell<Vec<&'static str>>> = Rc::default();

        let l = log.clone();
        b.on_before_remote(move |_| l.borrow_mut().push("hook"));
        let l = log.clone();
        let _sub = b.observe_text(move |_, _| l.borrow_mut().push("change"));

        sync(&a, &b);
        assert_eq!(*log.borrow(), vec!["hook", "change"]);
    }

    #[test]
    fn test_relative_position_follows_content() {
        let a = ReplicatedText::new();
        a.insert(0, "hello world").unwrap();
        let b = ReplicatedText::from_snapshot(&a.encode_snapshot()).unwrap();

        let caret = b.relative_position(11).unwrap();
        let word = b.relative_position(6).unwrap();

        a.insert(0, "XX ").unwrap();
        sync(&a, &b);

        assert_eq!(b.resolve_now(&caret), Some(14));
        assert_eq!(b.resolve_now(&word), Some(9));

        let decoded = RelativePosition::from_bytes(&word.to_bytes()).unwrap();
        assert_eq!(a.resolve_now(&decoded), Some(9));
    }

    #[test]
    fn test_text_ops_rejects_embeds() {
        let deltas = vec![Delta::Inserted(Out::Any(Any::Number(1.0)), None)];
        assert!(matches!(
            text_ops(&deltas, ""),
            Err(CoreError::UnexpectedDelta(_))
        ));
    }

    #[test]
    fn test_text_ops_count_bytes() {
        let deltas = vec![
            Delta::Retain(2, None),
            Delta::Deleted(3),
            Delta::Inserted(Out::Any(Any::String("ü".into())), None),
        ];
        // "hé" is 2 units and 3 bytes, "🦀l" is 3 units and 5 bytes
        assert_eq!(
            text_ops(&deltas, "hé🦀lo").unwrap(),
            vec![
                TextOp::Retain(3),
                TextOp::Delete(5),
                TextOp::Insert("ü".into())
            ]
        );
        assert!(text_ops(&[Delta::Retain(9, None)], "hé").is_err());
        // half of the surrogate pair
        assert!(text_ops(&[Delta::Retain(1, None)], "🦀").is_err());
    }

    #[test]
    fn test_multibyte_edits_use_byte_offsets() {
        let a = ReplicatedText::new();
        a.insert(0, "héllo wörld").unwrap();
        assert_eq!(a.len(), 13);
        a.insert(13, "!").unwrap();
        a.delete(8, 3).unwrap();
        assert_eq!(a.text(), "héllo wld!");
        assert_eq!(a.insert(2, "x"), Err(CoreError::NotCharBoundary(2)));
        assert!(matches!(
            a.delete(10, 5),
            Err(CoreError::OffsetOutOfRange { .. })
        ));

        let b = ReplicatedText::new();
        let seen: Rc<RefCell<Vec<TextOp>>> = Rc::default();
        let s = seen.clone();
        let _sub = b.observe_text(move |_, ops| s.borrow_mut().extend(ops.unwrap()));
        sync(&a, &b);
        a.insert(10, "🦀").unwrap();
        sync(&a, &b);
        assert_eq!(b.text(), "héllo wld🦀!");
        assert_eq!(seen.borrow().last(), Some(&TextOp::Insert("🦀".into())));
        assert!(seen.borrow().contains(&TextOp::Retain(10)));
    }

    #[test]
    fn test_relative_positions_on_multibyte_text() {
        let a = ReplicatedText::new();
        a.insert(0, "héllo wörld").unwrap();
        let b = ReplicatedText::from_snapshot(&a.encode_snapshot()).unwrap();

        let offsets = [0, 1, 3, 7, 10, 12, 13];
        let anchored = b.relative_positions(&offsets);
        for (offset, position) in offsets.iter().zip(&anchored) {
            let position = position.as_ref().unwrap();
            assert_eq!(b.resolve_now(position), Some(*offset));
        }
        // inside "é" snaps back to its first byte
        let inside = b.relative_position(2).unwrap();
        assert_eq!(b.resolve_now(&inside), Some(1));

        a.insert(0, "XX ").unwrap();
        sync(&a, &b);
        let resolved: Vec<Option<u32>> = anchored
            .iter()
            .map(|p| b.resolve_now(p.as_ref().unwrap()))
            .collect();
        assert_eq!(
            resolved,
            vec![Some(3), Some(4), Some(6), Some(10), Some(13), Some(15), Some(16)]
        );
    }

    #[test]
    fn test_end_position_follows_appends() {
        let text = ReplicatedText::new();
        let end = text.relative_position(0).unwrap();
        text.insert(0, "type Café").unwrap();
        assert_eq!(text.resolve_now(&end), Some(10));

        let decoded = RelativePosition::from_bytes(&end.to_bytes()).unwrap();
        text.insert(0, "# ").unwrap();
        assert_eq!(text.resolve_now(&decoded), Some(12));
    }
}

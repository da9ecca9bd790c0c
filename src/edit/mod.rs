pub mod undo;

pub use undo::EditLog;

use crate::error::Result;
use crate::segment::{Document, Segment, SegmentId, Splice};

/// Identity of an action in history; survives undo/redo round trips
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActionId(u64);

impl ActionId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditKind {
    Append,
    Insert,
    Delete,
    Replace,
}

/// Represents a single edit operation
#[derive(Debug, Clone)]
pub struct Edit {
    kind: EditKind,
    /// Logical offset where the edit occurred
    position: u64,
    /// Bytes removed at `position`
    removed_len: u64,
    /// Bytes inserted at `position`
    inserted_len: u64,
    splice: Splice,
}

impl Edit {
    /// Append `data` at the end of `doc`
    pub fn append(doc: &mut Document, data: &[u8]) -> Self {
        let position = doc.len();
        let splice = doc.append(Segment::from_bytes(data));
        Self::new(EditKind::Append, position, 0, data.len() as u64, splice)
    }

    /// Insert `data` before logical `pos`
    pub fn insert(doc: &mut Document, pos: u64, data: &[u8]) -> Result<Self> {
        let splice = doc.insert(pos, vec![Segment::from_bytes(data)])?;
        Ok(Self::new(EditKind::Insert, pos, 0, data.len() as u64, splice))
    }

    /// Remove logical bytes `start..=end`
    pub fn delete(doc: &mut Document, start: u64, end: u64) -> Result<Self> {
        let splice = doc.delete(start, end)?;
        Ok(Self::new(EditKind::Delete, start, end - start + 1, 0, splice))
    }

    /// Replace logical bytes `start..=end` with `data`
    pub fn replace(doc: &mut Document, start: u64, end: u64, data: &[u8]) -> Result<Self> {
        let splice = doc.replace(start, end, vec![Segment::from_bytes(data)])?;
        Ok(Self::new(
            EditKind::Replace,
            start,
            end - start + 1,
            data.len() as u64,
            splice,
        ))
    }

    fn new(kind: EditKind, position: u64, removed_len: u64, inserted_len: u64, splice: Splice) -> Self {
        Self {
            kind,
            position,
            removed_len,
            inserted_len,
            splice,
        }
    }

    pub fn kind(&self) -> EditKind {
        self.kind
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn removed_len(&self) -> u64 {
        self.removed_len
    }

    pub fn inserted_len(&self) -> u64 {
        self.inserted_len
    }

    /// Change in buffer size caused by this edit
    pub fn size_delta(&self) -> i64 {
        self.inserted_len as i64 - self.removed_len as i64
    }

    /// Segments this edit removed or inserted
    pub fn segment_ids(&self) -> impl Iterator<Item = SegmentId> + '_ {
        self.splice
            .removed()
            .iter()
            .chain(self.splice.inserted())
            .copied()
    }
}

/// A reversible unit of history
#[derive(Debug, Clone)]
pub enum Action {
    Edit { id: ActionId, edit: Edit },
    /// Edits made while chaining, undone and redone together
    Composite { id: ActionId, children: Vec<Edit> },
}

impl Action {
    pub fn id(&self) -> ActionId {
        match self {
            Action::Edit { id, .. } | Action::Composite { id, .. } => *id,
        }
    }

    pub fn edits(&self) -> &[Edit] {
        match self {
            Action::Edit { edit, .. } => std::slice::from_ref(edit),
            Action::Composite { children, .. } => children,
        }
    }

    /// Apply all edits in order (redo)
    pub fn apply(&self, doc: &mut Document) {
        for edit in self.edits() {
            doc.apply(&edit.splice);
        }
    }

    /// Apply all edits in reverse (undo)
    pub fn apply_reverse(&self, doc: &mut Document) {
        for edit in self.edits().iter().rev() {
            doc.revert(&edit.splice);
        }
    }

    /// Every segment this action needs to undo or redo itself
    pub fn segment_ids(&self) -> impl Iterator<Item = SegmentId> + '_ {
        self.edits().iter().flat_map(Edit::segment_ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn text(doc: &Document) -> Vec<u8> {
        doc.snapshot().to_vec().unwrap()
    }

    #[test]
    fn test_edit_records_lengths() {
        let mut doc = Document::new();
        let append = Edit::append(&mut doc, b"abcdef");
        let replace = Edit::replace(&mut doc, 1, 3, b"XY").unwrap();

        assert_eq!(append.kind(), EditKind::Append);
        assert_eq!(replace.position(), 1);
        assert_eq!(replace.removed_len(), 3);
        assert_eq!(replace.inserted_len(), 2);
        assert_eq!(replace.size_delta(), -1);
        assert_eq!(text(&doc), b"aXYef");
    }

    #[test]
    fn test_composite_undoes_in_reverse() {
        let mut doc = Document::new();
        Edit::append(&mut doc, b"0123456789");
        let before = doc.segment_lengths();

        let children = vec![
            Edit::delete(&mut doc, 2, 4).unwrap(),
            Edit::insert(&mut doc, 2, b"abc").unwrap(),
            Edit::replace(&mut doc, 0, 0, b"Z").unwrap(),
        ];
        let action = Action::Composite {
            id: ActionId::new(1),
            children,
        };
        assert_eq!(text(&doc), b"Z1abc56789");

        action.apply_reverse(&mut doc);
        assert_eq!(text(&doc), b"0123456789");
        assert_eq!(doc.segment_lengths(), before);

        action.apply(&mut doc);
        assert_eq!(text(&doc), b"Z1abc56789");
    }

    #[test]
    fn test_action_lists_segments_of_every_edit() {
        let mut doc = Document::new();
        Edit::append(&mut doc, b"abcdef");
        let children = vec![
            Edit::delete(&mut doc, 1, 1).unwrap(),
            Edit::insert(&mut doc, 0, b"x").unwrap(),
        ];
        let action = Action::Composite {
            id: ActionId::new(7),
            children,
        };

        assert_eq!(action.id(), ActionId::new(7));
        // the split segment and its two outer parts, then the new byte
        assert_eq!(action.segment_ids().count(), 4);
    }
}

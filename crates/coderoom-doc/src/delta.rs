//! Local edit requests and the change notifications they produce.

use coderoom_core::ReplicaId;
use serde::{Deserialize, Serialize};

/// An edit gesture expressed in visible-text coordinates.
///
/// Positions past the end of the document are clamped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LocalEdit {
    Insert { position: usize, text: String },
    Delete { position: usize, len: usize },
    Replace { position: usize, len: usize, text: String },
}

/// One contiguous change to the visible text.
///
/// Changes in a [`TextDelta`] apply in order; each index refers to the text
/// as left by the previous change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TextChange {
    Insert { index: usize, text: String },
    Delete { index: usize, len: usize },
}

/// Who caused a change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeOrigin {
    Local,
    Remote(ReplicaId),
}

/// Visible-text delta delivered to document subscribers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextDelta {
    pub origin: ChangeOrigin,
    pub changes: Vec<TextChange>,
}

impl TextDelta {
    pub fn new(origin: ChangeOrigin, changes: Vec<TextChange>) -> Self {
        Self { origin, changes }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn is_local(&self) -> bool {
        self.origin == ChangeOrigin::Local
    }

    /// Replay the changes onto a plain string.
    pub fn apply_to(&self, text: &str) -> String {
        let mut chars: Vec<char> = text.chars().collect();
        for change in &self.changes {
            match change {
                TextChange::Insert { index, text } => {
                    let at = (*index).min(chars.len());
                    chars.splice(at..at, text.chars());
                }
                TextChange::Delete { index, len } => {
                    let start = (*index).min(chars.len());
                    let end = start.saturating_add(*len).min(chars.len());
                    chars.drain(start..end);
                }
            }
        }
        chars.into_iter().collect()
    }

    /// Shift a cursor position across this delta.
    pub fn transform_position(&self, mut position: usize) -> usize {
        for change in &self.changes {
            match change {
                TextChange::Insert { index, text } => {
                    if *index <= position {
                        position += text.chars().count();
                    }
                }
                TextChange::Delete { index, len } => {
                    if *index < position {
                        position -= (*len).min(position - index);
                    }
                }
            }
        }
        position
    }
}

/// Result of merging one remote operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Integrated; carries the visible change (possibly empty), including
    /// any buffered operations it released.
    Applied(TextDelta),
    /// Held until the operation it depends on arrives.
    Buffered,
    /// Already seen; nothing changed.
    Duplicate,
}

impl MergeOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, MergeOutcome::Applied(_))
    }
}

/// Tally of a batch merge.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub applied: usize,
    pub buffered: usize,
    pub duplicates: usize,
    pub rejected: usize,
}

/// Append a change, folding it into the previous one when contiguous.
pub(crate) fn push_change(changes: &mut Vec<TextChange>, change: TextChange) {
    match (changes.last_mut(), &change) {
        (Some(TextChange::Insert { index, text }), TextChange::Insert { index: next, text: more })
            if *index + text.chars().count() == *next =>
        {
            text.push_str(more);
            return;
        }
        (Some(TextChange::Delete { index, len }), TextChange::Delete { index: next, len: more })
            if *index == *next =>
        {
            *len += *more;
            return;
        }
        _ => {}
    }
    changes.push(change);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_change_coalesces() {
        let mut changes = Vec::new();
        push_change(&mut changes, TextChange::Insert { index: 2, text: "a".into() });
        push_change(&mut changes, TextChange::Insert { index: 3, text: "b".into() });
        push_change(&mut changes, TextChange::Delete { index: 0, len: 1 });
        push_change(&mut changes, TextChange::Delete { index: 0, len: 1 });
        assert_eq!(
            changes,
            vec![
                TextChange::Insert { index: 2, text: "ab".into() },
                TextChange::Delete { index: 0, len: 2 },
            ]
        );
    }

    #[test]
    fn test_apply_to() {
        let delta = TextDelta::new(
            ChangeOrigin::Local,
            vec![
                TextChange::Insert { index: 5, text: " world".into() },
                TextChange::Delete { index: 0, len: 1 },
            ],
        );
        assert_eq!(delta.apply_to("hello"), "ello world");
    }

    #[test]
    fn test_transform_position() {
        let delta = TextDelta::new(
            ChangeOrigin::Remote(ReplicaId::new("r2")),
            vec![TextChange::Insert { index: 0, text: "ab".into() }],
        );
        assert_eq!(delta.transform_position(3), 5);

        let delta = TextDelta::new(
            ChangeOrigin::Local,
            vec![TextChange::Delete { index: 1, len: 4 }],
        );
        assert_eq!(delta.transform_position(3), 1);
        assert_eq!(delta.transform_position(8), 4);
        assert_eq!(delta.transform_position(1), 1);
    }
}

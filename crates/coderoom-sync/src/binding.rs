//! Glue between an editor widget and a [`Session`].
//!
//! Text edits go straight to the document. Cursor moves are throttled: at
//! most one publication per presence interval, with the latest position
//! sent once the interval has passed.

use crate::session::Session;
use crate::transport::Transport;
use coderoom_core::{now_millis, ConnectionId};
use coderoom_doc::{CursorState, LocalEdit, PresenceEntry, ANONYMOUS_NAME};
use coderoom_sandbox::Language;
use std::sync::Arc;

/// Color of participants that have not claimed an identity yet.
pub const ANONYMOUS_COLOR: &str = "#cccccc";

/// A UI gesture, in visible-text character offsets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EditorEvent {
    Insert { position: usize, text: String },
    Delete { position: usize, len: usize },
    /// Caret or selection moved; `None` when the editor lost focus.
    Cursor(Option<CursorState>),
    /// The run button.
    Run,
    ClearOutput,
    LanguageSelected(Language),
}

/// Lets through at most one value per interval and keeps the newest
/// rejected one for [`flush`](Self::flush).
#[derive(Clone, Debug)]
pub struct RateLimiter<T> {
    interval_ms: u64,
    last_sent: Option<u64>,
    pending: Option<T>,
}

impl<T> RateLimiter<T> {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval_ms,
            last_sent: None,
            pending: None,
        }
    }

    fn is_due(&self, now: u64) -> bool {
        self.last_sent
            .map_or(true, |sent| now.saturating_sub(sent) >= self.interval_ms)
    }

    /// Returns the value if it may go out now; otherwise holds it.
    pub fn offer(&mut self, value: T, now: u64) -> Option<T> {
        if self.is_due(now) {
            self.last_sent = Some(now);
            self.pending = None;
            Some(value)
        } else {
            self.pending = Some(value);
            None
        }
    }

    /// The held value, once the interval has passed.
    pub fn flush(&mut self, now: u64) -> Option<T> {
        if self.pending.is_some() && self.is_due(now) {
            self.last_sent = Some(now);
            self.pending.take()
        } else {
            None
        }
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }
}

/// A decoration for another participant's caret.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteCursor {
    pub connection_id: ConnectionId,
    pub position: usize,
    pub selection: Option<(usize, usize)>,
    pub label: String,
    pub color: String,
}

/// Cursors to draw for everyone but `local`, ordered by connection id.
///
/// Expired and cursor-less entries are skipped; offsets are clamped to
/// `doc_len`.
pub fn remote_cursors<'a>(
    entries: impl IntoIterator<Item = &'a PresenceEntry>,
    local: &ConnectionId,
    now: u64,
    window_ms: u64,
    doc_len: usize,
) -> Vec<RemoteCursor> {
    let mut cursors: Vec<RemoteCursor> = entries
        .into_iter()
        .filter(|entry| entry.connection_id != *local && !entry.is_expired(now, window_ms))
        .filter_map(|entry| {
            let cursor = entry.cursor?.clamped(doc_len);
            let (label, color) = match &entry.identity {
                Some(identity) => (identity.name.clone(), identity.color.clone()),
                None => (ANONYMOUS_NAME.to_string(), ANONYMOUS_COLOR.to_string()),
            };
            Some(RemoteCursor {
                connection_id: entry.connection_id.clone(),
                position: cursor.position,
                selection: cursor.selection,
                label,
                color,
            })
        })
        .collect();
    cursors.sort_by(|a, b| a.connection_id.cmp(&b.connection_id));
    cursors
}

pub struct EditorBinding<T: Transport> {
    session: Arc<Session<T>>,
    cursor: RateLimiter<Option<CursorState>>,
}

impl<T: Transport> EditorBinding<T> {
    pub fn new(session: Arc<Session<T>>) -> Self {
        let interval = session.config().presence_interval_ms;
        Self {
            session,
            cursor: RateLimiter::new(interval),
        }
    }

    pub fn session(&self) -> &Arc<Session<T>> {
        &self.session
    }

    pub fn handle(&mut self, event: EditorEvent) {
        self.handle_at(event, now_millis());
    }

    pub fn handle_at(&mut self, event: EditorEvent, now: u64) {
        match event {
            EditorEvent::Insert { position, text } => {
                self.session.edit(LocalEdit::Insert { position, text });
            }
            EditorEvent::Delete { position, len } => {
                self.session.edit(LocalEdit::Delete { position, len });
            }
            EditorEvent::Cursor(cursor) => {
                if let Some(cursor) = self.cursor.offer(cursor, now) {
                    self.session.set_cursor(cursor);
                }
            }
            EditorEvent::Run => {
                self.session.run();
            }
            EditorEvent::ClearOutput => self.session.clear_output(),
            EditorEvent::LanguageSelected(language) => {
                self.session.set_language(language);
            }
        }
    }

    /// Publish a held cursor position if its interval has passed. Call
    /// from the editor's frame or idle callback.
    pub fn flush(&mut self) {
        self.flush_at(now_millis());
    }

    pub fn flush_at(&mut self, now: u64) {
        if let Some(cursor) = self.cursor.flush(now) {
            self.session.set_cursor(cursor);
        }
    }

    pub fn remote_cursors(&self) -> Vec<RemoteCursor> {
        self.session.remote_cursors()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coderoom_doc::Identity;

    fn entry(id: &str, cursor: Option<CursorState>, identity: Option<Identity>, last_seen: u64) -> PresenceEntry {
        PresenceEntry {
            connection_id: ConnectionId::new(id),
            clock: 1,
            cursor,
            identity,
            claimed_at: 0,
            last_seen,
        }
    }

    #[test]
    fn test_rate_limiter_holds_latest() {
        let mut limiter = RateLimiter::new(100);
        assert_eq!(limiter.offer(1, 1_000), Some(1));
        assert_eq!(limiter.offer(2, 1_010), None);
        assert_eq!(limiter.offer(3, 1_050), None);
        assert!(limiter.has_pending());
        assert_eq!(limiter.flush(1_090), None);
        assert_eq!(limiter.flush(1_100), Some(3));
        assert_eq!(limiter.flush(1_500), None);
        assert_eq!(limiter.offer(4, 1_150), None);
        assert_eq!(limiter.offer(5, 1_200), Some(5));
        assert!(!limiter.has_pending());
    }

    #[test]
    fn test_remote_cursors() {
        let now = 100_000;
        let entries = vec![
            entry("zed", Some(CursorState::at(50)), None, now),
            entry("me", Some(CursorState::at(1)), None, now),
            entry("amy", Some(CursorState::with_selection(8, 2)), Some(Identity::new("Hootsie", "#9AD1D4")), now),
            entry("gone", Some(CursorState::at(1)), None, now - 60_000),
            entry("idle", None, None, now),
        ];
        let cursors = remote_cursors(&entries, &ConnectionId::new("me"), now, 30_000, 10);

        assert_eq!(cursors.len(), 2);
        assert_eq!(cursors[0].connection_id, ConnectionId::new("amy"));
        assert_eq!(cursors[0].position, 2);
        assert_eq!(cursors[0].selection, Some((2, 8)));
        assert_eq!(cursors[0].label, "Hootsie");

        assert_eq!(cursors[1].connection_id, ConnectionId::new("zed"));
        assert_eq!(cursors[1].position, 10);
        assert_eq!(cursors[1].label, ANONYMOUS_NAME);
        assert_eq!(cursors[1].color, ANONYMOUS_COLOR);
    }
}

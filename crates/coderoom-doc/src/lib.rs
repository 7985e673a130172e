//! # coderoom-doc
//!
//! The state replicated inside one room:
//!
//! - [`text`] - the shared document, an RGA sequence of characters that
//!   converges whatever order operations are delivered in
//! - [`awareness`] - ephemeral per-connection presence (cursor, identity)
//!   with last-writer-wins merge and expiry
//! - [`identity`] - the display-name palette participants claim from
//! - [`output`] - the last executed code snapshot, shared room-wide
//!
//! None of these types does any I/O. Local edits produce [`Operation`]s that the
//! caller hands to a transport; remote operations are fed back through
//! [`ReplicatedText::merge`].

pub mod awareness;
pub mod delta;
pub mod error;
pub mod identity;
pub mod op;
pub mod output;
pub mod text;

pub use awareness::{
    AwarenessChange, AwarenessDelta, AwarenessTracker, CursorState, CursorUpdate, IdentityClaim,
    PresenceEntry, PresenceFields, DEFAULT_EXPIRY_MS,
};
pub use delta::{ChangeOrigin, LocalEdit, MergeOutcome, MergeSummary, TextChange, TextDelta};
pub use error::{DocError, Result};
pub use identity::{Identity, ANONYMOUS_NAME, PALETTE};
pub use op::Operation;
pub use output::{OutputUpdate, SharedOutput};
pub use text::{DocumentSnapshot, Item, ReplicatedText};

//! Client side of a room: a local replica kept in sync through a
//! [`Transport`].
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──WELCOME──▶ Synced
//!                                                     │ link lost
//!                              Synced ◀──resync── Reconnecting
//! ```
//!
//! Edits are applied locally first and never wait for the network. While no
//! link is up, operations collect in an outbox that is replayed after the
//! next resync; the hub drops what it already has. Sent operations stay in
//! the outbox until a `SYNC_RESPONSE` state vector shows the hub has them.
//!
//! Running shares the current code as the room's output; every member sees
//! the last run. Switching language empties both the code and the output.

use crate::binding::{remote_cursors, RemoteCursor};
use crate::config::{ClientConfig, SyncConfig};
use crate::error::{ProtocolError, Result, SyncError};
use crate::protocol::Message;
use crate::transport::{Connection, Transport};
use coderoom_core::{now_millis, ConnectionId, ReplicaId, RoomId};
use coderoom_doc::{
    AwarenessChange, AwarenessDelta, AwarenessTracker, CursorState, Identity, LocalEdit,
    Operation, OutputUpdate, PresenceEntry, PresenceFields, ReplicatedText, SharedOutput,
    TextDelta,
};
use coderoom_sandbox::Language;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Connection state of a [`Session`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Synced,
    Reconnecting,
}

/// Events emitted by a session.
#[derive(Clone, Debug)]
pub enum SessionEvent {
    StateChanged(SessionState),
    /// The visible text changed, locally or remotely.
    DocumentChanged(TextDelta),
    PresenceChanged(AwarenessChange),
    /// The room's run output was replaced; carries the code to execute,
    /// empty when cleared.
    OutputChanged(String),
}

/// Local operations not yet known to have reached the hub.
#[derive(Default)]
struct Outbox {
    /// Produced while no link was up.
    queued: Vec<Operation>,
    /// Handed to a link but not yet covered by a hub state vector.
    in_flight: Vec<Operation>,
}

struct Shared<T> {
    room: RoomId,
    transport: T,
    config: SyncConfig,
    client: ClientConfig,
    doc: Mutex<ReplicatedText>,
    awareness: Mutex<AwarenessTracker>,
    output: Mutex<SharedOutput>,
    language: Mutex<Language>,
    state: Mutex<SessionState>,
    link: Mutex<Option<tokio::sync::mpsc::Sender<Message>>>,
    outbox: Mutex<Outbox>,
    events: broadcast::Sender<SessionEvent>,
}

/// A collaborative editing session for one room.
pub struct Session<T: Transport> {
    shared: Arc<Shared<T>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Transport> Session<T> {
    pub fn new(room: RoomId, transport: T) -> Self {
        Self::with_config(room, transport, SyncConfig::default(), ClientConfig::default())
    }

    pub fn with_config(
        room: RoomId,
        transport: T,
        config: SyncConfig,
        client: ClientConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.channel_capacity.max(1));

        let replica = ReplicaId::generate();
        let mut doc = ReplicatedText::new(replica.clone());
        let doc_events = events.clone();
        doc.subscribe(move |delta: &TextDelta| {
            let _ = doc_events.send(SessionEvent::DocumentChanged(delta.clone()));
        });

        let mut awareness = AwarenessTracker::new(ConnectionId::generate())
            .with_expiry(config.presence_expiry_ms);
        let presence_events = events.clone();
        awareness.on_change(move |change: &AwarenessChange| {
            let _ = presence_events.send(SessionEvent::PresenceChanged(change.clone()));
        });

        Self {
            shared: Arc::new(Shared {
                room,
                transport,
                config,
                client,
                doc: Mutex::new(doc),
                awareness: Mutex::new(awareness),
                output: Mutex::new(SharedOutput::new(replica)),
                language: Mutex::new(Language::JavaScript),
                state: Mutex::new(SessionState::Disconnected),
                link: Mutex::new(None),
                outbox: Mutex::new(Outbox::default()),
                events,
            }),
            driver: Mutex::new(None),
        }
    }

    /// Start in `language` without touching the room, e.g. the one saved
    /// in [`Preferences`](crate::Preferences).
    pub fn with_language(self, language: Language) -> Self {
        *self.shared.language.lock() = language;
        self
    }

    /// Join the room. Failing to reach it here is reported; later outages
    /// are retried in the background.
    pub async fn connect(&self) -> Result<()> {
        if let Some(driver) = self.driver.lock().take() {
            driver.abort();
        }
        let shared = self.shared.clone();
        shared.set_state(SessionState::Connecting);
        let connection = match shared.establish().await {
            Ok(connection) => connection,
            Err(err) => {
                warn!(transport = %shared.transport.describe(), error = %err, "Initial connection failed");
                shared.set_state(SessionState::Disconnected);
                return Err(SyncError::NotConnected(err.to_string()));
            }
        };
        shared.set_state(SessionState::Synced);
        *self.driver.lock() = Some(tokio::spawn(drive(shared, connection)));
        Ok(())
    }

    /// Announce departure and stop syncing. Local state is kept.
    pub fn leave(&self) {
        if let Some(driver) = self.driver.lock().take() {
            driver.abort();
        }
        let connection_id = self.shared.awareness.lock().local_id().clone();
        self.shared.send(Message::PresenceLeave { connection_id });
        self.shared.link.lock().take();
        self.shared.set_state(SessionState::Disconnected);
        info!(room = %self.shared.room, "Left room");
    }

    /// Apply a local edit and publish it. Returns the new text.
    pub fn edit(&self, edit: LocalEdit) -> String {
        let (text, operations) = {
            let mut doc = self.shared.doc.lock();
            let text = doc.apply_local(edit);
            (text, doc.take_pending())
        };
        self.shared.publish(operations);
        text
    }

    /// Move the local cursor. Publication is immediate; rate limiting is
    /// left to [`EditorBinding`](crate::EditorBinding).
    pub fn set_cursor(&self, cursor: Option<CursorState>) {
        let len = self.shared.doc.lock().len();
        let delta = self
            .shared
            .awareness
            .lock()
            .set_cursor(cursor.map(|cursor| cursor.clamped(len)));
        self.shared.send(Message::AwarenessDelta { delta });
    }

    /// Pick a display identity explicitly, e.g. one restored from
    /// [`Preferences`](crate::Preferences).
    pub fn set_identity(&self, identity: Identity) {
        let delta = self
            .shared
            .awareness
            .lock()
            .set_local(PresenceFields::identity(identity, now_millis()));
        self.shared.send(Message::AwarenessDelta { delta });
    }

    /// Share the current code as the room's run output. Returns the code.
    pub fn run(&self) -> String {
        let code = self.text();
        let update = self.shared.output.lock().run(code.clone());
        self.shared.publish_output(update);
        code
    }

    /// Empty the run output for everyone in the room.
    pub fn clear_output(&self) {
        let update = self.shared.output.lock().clear();
        self.shared.publish_output(update);
    }

    /// Switch language. A change empties the shared code and run output;
    /// returns `false` when `language` was already selected.
    pub fn set_language(&self, language: Language) -> bool {
        {
            let mut current = self.shared.language.lock();
            if *current == language {
                return false;
            }
            *current = language;
        }
        info!(room = %self.shared.room, language = language.as_str(), "Language changed, clearing code and output");
        let len = self.len();
        if len > 0 {
            self.edit(LocalEdit::Delete { position: 0, len });
        }
        self.clear_output();
        true
    }

    pub fn language(&self) -> Language {
        *self.shared.language.lock()
    }

    /// Code last run in the room, empty when cleared or never run.
    pub fn output(&self) -> String {
        self.shared.output.lock().code().to_string()
    }

    pub fn text(&self) -> String {
        self.shared.doc.lock().text()
    }

    pub fn len(&self) -> usize {
        self.shared.doc.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.lock()
    }

    pub fn room(&self) -> &RoomId {
        &self.shared.room
    }

    pub fn config(&self) -> &SyncConfig {
        &self.shared.config
    }

    pub fn replica(&self) -> ReplicaId {
        self.shared.doc.lock().replica().clone()
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.shared.awareness.lock().local_id().clone()
    }

    pub fn identity(&self) -> Option<Identity> {
        self.shared
            .awareness
            .lock()
            .local_entry()
            .and_then(|entry| entry.identity.clone())
    }

    /// Every presence entry currently known, own entry included.
    pub fn presence(&self) -> Vec<PresenceEntry> {
        self.shared.awareness.lock().entries().cloned().collect()
    }

    /// Decorations for the other participants' cursors.
    pub fn remote_cursors(&self) -> Vec<RemoteCursor> {
        let len = self.len();
        let awareness = self.shared.awareness.lock();
        remote_cursors(
            awareness.entries(),
            awareness.local_id(),
            now_millis(),
            awareness.expiry_ms(),
            len,
        )
    }

    /// Local operations waiting for a link.
    pub fn queued_operations(&self) -> usize {
        self.shared.outbox.lock().queued.len()
    }

    /// Local operations the hub has not yet acknowledged, queued or sent.
    pub fn unacknowledged_operations(&self) -> usize {
        let outbox = self.shared.outbox.lock();
        outbox.queued.len() + outbox.in_flight.len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }
}

impl<T: Transport> Drop for Session<T> {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.get_mut().take() {
            driver.abort();
        }
    }
}

impl<T: Transport> Shared<T> {
    fn set_state(&self, next: SessionState) {
        let mut state = self.state.lock();
        if *state != next {
            debug!(room = %self.room, from = ?*state, to = ?next, "Session state changed");
            *state = next;
            let _ = self.events.send(SessionEvent::StateChanged(next));
        }
    }

    /// Best-effort send on the current link.
    fn send(&self, message: Message) -> bool {
        let link = self.link.lock().clone();
        match link {
            Some(tx) => tx.try_send(message).is_ok(),
            None => false,
        }
    }

    fn publish(&self, operations: Vec<Operation>) {
        for operation in operations {
            if self.send(Message::Update {
                operation: operation.clone(),
            }) {
                self.outbox.lock().in_flight.push(operation);
            } else {
                self.outbox.lock().queued.push(operation);
            }
        }
    }

    fn publish_output(&self, update: OutputUpdate) {
        let code = update.code.clone();
        if !self.send(Message::Output { output: update }) {
            debug!(room = %self.room, "Run output kept until the next join");
        }
        let _ = self.events.send(SessionEvent::OutputChanged(code));
    }

    /// Open a link, join, and apply the hub's welcome.
    async fn establish(&self) -> Result<Connection> {
        let mut connection = self.transport.connect().await?;
        let join = {
            let doc = self.doc.lock();
            Message::Join {
                room: self.room.clone(),
                replica_id: Some(doc.replica().clone()),
                state_vector: Some(doc.state_vector()),
            }
        };
        connection
            .outgoing
            .send(join)
            .await
            .map_err(|_| SyncError::ConnectionClosed)?;

        let timeout = Duration::from_millis(self.config.handshake_timeout_ms);
        let welcome = match tokio::time::timeout(timeout, connection.incoming.recv()).await {
            Ok(Some(welcome)) => welcome,
            Ok(None) => return Err(SyncError::ConnectionClosed),
            Err(_) => return Err(SyncError::Transport("timed out waiting for WELCOME".into())),
        };
        let (connection_id, replica_id, operations, presence, output) = match welcome {
            Message::Welcome {
                connection_id,
                replica_id,
                operations,
                presence,
                output,
            } => (connection_id, replica_id, operations, presence, output),
            other => return Err(ProtocolError::Unexpected(other.kind()).into()),
        };

        {
            let mut doc = self.doc.lock();
            if *doc.replica() != replica_id {
                if let Err(err) = doc.set_replica(replica_id.clone()) {
                    debug!(error = %err, "Keeping existing replica id");
                }
            }
            let summary = doc.merge_all(operations);
            debug!(
                room = %self.room,
                applied = summary.applied,
                buffered = summary.buffered,
                duplicates = summary.duplicates,
                "Applied resync diff"
            );
        }

        let announce = {
            let mut awareness = self.awareness.lock();
            awareness.rebind(connection_id.clone());
            for delta in &presence {
                awareness.apply_remote(delta);
            }
            if awareness
                .local_entry()
                .map_or(true, |entry| entry.identity.is_none())
            {
                awareness.claim_identity();
            }
            awareness.local_state()
        };

        // A run made while offline is pushed unless the room has a newer one.
        let (changed, unsent) = {
            let mut local = self.output.lock();
            local.set_replica(replica_id.clone());
            let changed = output
                .as_ref()
                .map_or(false, |update| local.apply_remote(update));
            let unsent = local
                .state()
                .filter(|update| update.replica == replica_id && Some(*update) != output.as_ref())
                .cloned();
            (changed.then(|| local.code().to_string()), unsent)
        };
        if let Some(code) = changed {
            let _ = self.events.send(SessionEvent::OutputChanged(code));
        }

        *self.link.lock() = Some(connection.outgoing.clone());
        if let Some(delta) = announce {
            self.send(Message::AwarenessDelta { delta });
        }
        if let Some(output) = unsent {
            self.send(Message::Output { output });
        }
        self.replay_outbox();
        info!(room = %self.room, connection = %connection_id, replica = %replica_id, "Joined room");
        Ok(connection)
    }

    fn replay_outbox(&self) {
        let pending = {
            let mut outbox = self.outbox.lock();
            let mut pending = std::mem::take(&mut outbox.in_flight);
            pending.append(&mut outbox.queued);
            pending
        };
        if !pending.is_empty() {
            debug!(room = %self.room, operations = pending.len(), "Replaying outbox");
        }
        self.publish(pending);
    }

    fn receive(&self, message: Message) {
        match message {
            Message::Update { operation } => {
                if let Err(err) = self.doc.lock().merge(operation) {
                    warn!(room = %self.room, error = %err, "Dropping malformed update");
                }
            }
            Message::SyncResponse {
                operations,
                state_vector,
            } => {
                let missing = {
                    let mut doc = self.doc.lock();
                    doc.merge_all(operations);
                    doc.diff_since(&state_vector)
                };
                self.outbox
                    .lock()
                    .in_flight
                    .retain(|operation| !state_vector.covers(operation.id()));
                if !missing.is_empty() {
                    debug!(room = %self.room, operations = missing.len(), "Pushing operations the hub lacks");
                    for operation in missing {
                        self.send(Message::Update { operation });
                    }
                }
            }
            Message::AwarenessDelta { delta } => self.apply_presence(&delta),
            Message::Output { output } => {
                let changed = {
                    let mut local = self.output.lock();
                    local.apply_remote(&output).then(|| local.code().to_string())
                };
                if let Some(code) = changed {
                    let _ = self.events.send(SessionEvent::OutputChanged(code));
                }
            }
            Message::PresenceLeave { connection_id } => {
                self.awareness.lock().remove(&connection_id);
            }
            Message::Ping => {
                self.send(Message::Pong);
            }
            Message::Pong => {}
            other => warn!(room = %self.room, kind = other.kind(), "Unexpected message dropped"),
        }
    }

    fn apply_presence(&self, delta: &AwarenessDelta) {
        let reselect = self.awareness.lock().apply_remote(delta);
        if let Some(delta) = reselect {
            info!(room = %self.room, "Identity taken by an earlier claim, reselected");
            self.send(Message::AwarenessDelta { delta });
        }
    }

    /// Anti-entropy round: pull what we may have missed and flush anything
    /// queued. The response retires acknowledged operations and triggers a
    /// push of whatever the hub still lacks.
    fn sync_round(&self) {
        let state_vector = self.doc.lock().state_vector();
        self.send(Message::SyncRequest { state_vector });
        let queued = std::mem::take(&mut self.outbox.lock().queued);
        self.publish(queued);
    }

    fn heartbeat(&self) {
        let (delta, expired) = {
            let mut awareness = self.awareness.lock();
            (awareness.heartbeat(), awareness.expire())
        };
        if !expired.is_empty() {
            debug!(room = %self.room, expired = expired.len(), "Expired silent peers");
        }
        self.send(Message::AwarenessDelta { delta });
    }

    /// Retry with backoff until a link is back or attempts run out.
    async fn reconnect(&self) -> Option<Connection> {
        self.link.lock().take();
        {
            let mut outbox = self.outbox.lock();
            let in_flight = std::mem::take(&mut outbox.in_flight);
            outbox.queued.splice(0..0, in_flight);
        }
        if !self.client.auto_reconnect {
            self.set_state(SessionState::Disconnected);
            return None;
        }
        self.set_state(SessionState::Reconnecting);
        for attempt in 0..self.client.max_reconnect_attempts {
            tokio::time::sleep(self.client.backoff(attempt)).await;
            match self.establish().await {
                Ok(connection) => {
                    self.set_state(SessionState::Synced);
                    return Some(connection);
                }
                Err(err) => {
                    debug!(room = %self.room, attempt, error = %err, "Reconnect attempt failed")
                }
            }
        }
        warn!(room = %self.room, attempts = self.client.max_reconnect_attempts, "Giving up on reconnecting");
        self.set_state(SessionState::Disconnected);
        None
    }
}

async fn drive<T: Transport>(shared: Arc<Shared<T>>, mut connection: Connection) {
    let mut sync_tick = interval(shared.config.sync_interval_ms);
    let mut heartbeat_tick = interval(shared.config.heartbeat_interval_ms);
    loop {
        tokio::select! {
            message = connection.incoming.recv() => match message {
                Some(message) => shared.receive(message),
                None => {
                    info!(room = %shared.room, "Connection lost");
                    match shared.reconnect().await {
                        Some(next) => connection = next,
                        None => return,
                    }
                }
            },
            _ = sync_tick.tick() => shared.sync_round(),
            _ = heartbeat_tick.tick() => shared.heartbeat(),
        }
    }
}

/// An interval whose first tick is one period away.
fn interval(ms: u64) -> tokio::time::Interval {
    let period = Duration::from_millis(ms.max(1));
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval
}

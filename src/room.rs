//! `DocumentRoom`: single-writer ownership of one document's CRDT and
//! subscriber set, per spec.md \S4.2.
//!
//! Grounded on the actor shape in `other_examples`' `shared_state`
//! service (an `mpsc`-driven loop over a command enum, `oneshot` replies,
//! `tokio::select!` against a periodic tick) generalized from "one actor
//! for every open document" to "one actor per document", since spec.md
//! \S4.2 requires a dedicated single-writer per `documentId` rather than
//! a shared lock. The debounced save timer lives inside this same
//! `select!` loop (spec.md \S9: "no orphan tasks").

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, sleep_until, Instant as TokioInstant};
use tracing::{info, instrument, warn};

use crate::codec::{self, ClientCursor, ServerCursor, ServerMessage};
use crate::config::Config;
use crate::connection::{Connection, ConnectionId};
use crate::crdt::{Applied, Operation, SequenceCRDT, SiteId};
use crate::error::{self, CoreResult};
use crate::persist;
use crate::store::DocumentStore;

const COMPACTION_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// The room lifecycle named in spec.md \S4.2.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RoomState {
    Hydrating = 0,
    Live = 1,
    Draining = 2,
    Retired = 3,
}

impl RoomState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => RoomState::Hydrating,
            1 => RoomState::Live,
            2 => RoomState::Draining,
            _ => RoomState::Retired,
        }
    }
}

/// Lock-free snapshot of room status the coordinator consults for LRU
/// eviction without routing through the room's own command queue (which
/// may be busy broadcasting). Updated by the room actor on every
/// state-affecting command.
#[derive(Debug)]
pub struct RoomShared {
    state: AtomicU8,
    subscriber_count: AtomicU64,
    last_activity_epoch_ms: AtomicU64,
}

impl RoomShared {
    fn new(epoch_ms: u64) -> Self {
        Self {
            state: AtomicU8::new(RoomState::Hydrating as u8),
            subscriber_count: AtomicU64::new(0),
            last_activity_epoch_ms: AtomicU64::new(epoch_ms),
        }
    }

    pub fn state(&self) -> RoomState {
        RoomState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn subscriber_count(&self) -> u64 {
        self.subscriber_count.load(Ordering::Acquire)
    }

    pub fn last_activity_epoch_ms(&self) -> u64 {
        self.last_activity_epoch_ms.load(Ordering::Acquire)
    }

    /// Evictable means empty of subscribers and not mid-hydrate: the two
    /// states named in spec.md \S4.3 (`Empty` in the spec's lifecycle
    /// corresponds to a room with zero subscribers; we never keep a
    /// registry entry around once it reaches that point except while
    /// draining, so `Draining` is the only empty-but-still-registered
    /// state worth evicting early).
    pub fn is_evictable(&self) -> bool {
        matches!(self.state(), RoomState::Draining) && self.subscriber_count() == 0
    }

    fn set_state(&self, s: RoomState) {
        self.state.store(s as u8, Ordering::Release);
    }

    fn set_subscribers(&self, n: usize) {
        self.subscriber_count.store(n as u64, Ordering::Release);
    }

    fn touch(&self, epoch_ms: u64) {
        self.last_activity_epoch_ms.store(epoch_ms, Ordering::Release);
    }
}

fn epoch_ms(instant: Instant, reference: Instant, reference_epoch_ms: u64) -> u64 {
    reference_epoch_ms + instant.saturating_duration_since(reference).as_millis() as u64
}

/// Outcome of `submit`, per spec.md \S4.2.
#[derive(Debug)]
pub enum SubmitOutcome {
    Ack,
    Reject(String),
}

enum RoomCommand {
    Subscribe {
        conn: Connection,
        reply: oneshot::Sender<CoreResult<ServerMessage>>,
    },
    Unsubscribe {
        id: ConnectionId,
    },
    Submit {
        conn_id: ConnectionId,
        op: Operation,
        reply: oneshot::Sender<SubmitOutcome>,
    },
    Cursor {
        conn_id: ConnectionId,
        cursor: ClientCursor,
    },
    Presence {
        conn_id: ConnectionId,
        payload: serde_json::Map<String, serde_json::Value>,
    },
    RequestState {
        conn_id: ConnectionId,
        reply: oneshot::Sender<ServerMessage>,
    },
    /// A forced, synchronous flush that does not affect the room's
    /// lifecycle state, used for the process-shutdown pass in spec.md
    /// \S4.4 ("forced flush ... on process shutdown").
    FlushNow {
        reply: oneshot::Sender<()>,
    },
}

/// A cheap, cloneable handle to a running room actor. Connections and the
/// coordinator talk to the room exclusively through this handle; nothing
/// outside `room.rs` ever touches the CRDT directly, which is how
/// spec.md \S4.2's "no lock-free concurrent mutation" invariant holds.
#[derive(Clone)]
pub struct RoomHandle {
    document_id: String,
    tx: mpsc::Sender<RoomCommand>,
    shared: Arc<RoomShared>,
}

impl RoomHandle {
    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn shared(&self) -> &Arc<RoomShared> {
        &self.shared
    }

    /// `subscribe(conn) -> SnapshotFrame`, per spec.md \S4.2.
    pub async fn subscribe(&self, conn: Connection) -> CoreResult<ServerMessage> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(RoomCommand::Subscribe { conn, reply }).await.is_err() {
            return error::UnavailableSnafu {
                document_id: self.document_id.clone(),
                reason: "room actor has shut down".to_string(),
            }
            .fail();
        }
        rx.await.unwrap_or_else(|_| {
            error::UnavailableSnafu {
                document_id: self.document_id.clone(),
                reason: "room actor dropped the reply".to_string(),
            }
            .fail()
        })
    }

    pub async fn unsubscribe(&self, id: ConnectionId) {
        let _ = self.tx.send(RoomCommand::Unsubscribe { id }).await;
    }

    /// `submit(conn, op) -> Ack | Reject(reason)`, per spec.md \S4.2.
    pub async fn submit(&self, conn_id: ConnectionId, op: Operation) -> SubmitOutcome {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(RoomCommand::Submit { conn_id, op, reply })
            .await
            .is_err()
        {
            return SubmitOutcome::Reject("room is no longer live".to_string());
        }
        rx.await.unwrap_or_else(|_| SubmitOutcome::Reject("room actor dropped the reply".to_string()))
    }

    pub async fn cursor(&self, conn_id: ConnectionId, cursor: ClientCursor) {
        let _ = self.tx.send(RoomCommand::Cursor { conn_id, cursor }).await;
    }

    /// `broadcastPresence(conn, kind, payload)`, per spec.md \S4.2: a
    /// best-effort fan-out that never touches the CRDT and never marks
    /// the room dirty.
    pub async fn presence(&self, conn_id: ConnectionId, payload: serde_json::Map<String, serde_json::Value>) {
        let _ = self.tx.send(RoomCommand::Presence { conn_id, payload }).await;
    }

    pub async fn request_state(&self, conn_id: ConnectionId) -> Option<ServerMessage> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(RoomCommand::RequestState { conn_id, reply }).await.ok()?;
        rx.await.ok()
    }

    /// Forces a synchronous flush without retiring the room, for process
    /// shutdown. Returns once the flush has completed or the actor is
    /// already gone.
    pub async fn flush_now(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(RoomCommand::FlushNow { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

struct Actor {
    document_id: String,
    config: Arc<Config>,
    store: Arc<dyn DocumentStore>,
    crdt: SequenceCRDT,
    subscribers: HashMap<ConnectionId, Connection>,
    dirty_since: Option<Instant>,
    shared: Arc<RoomShared>,
    rx: mpsc::Receiver<RoomCommand>,
    retired_tx: mpsc::UnboundedSender<String>,
    clock_reference: Instant,
    clock_reference_epoch_ms: u64,
}

/// Spawns a room actor for `document_id`, hydrating it from `store`. The
/// returned handle transitions to `Live` only once hydration succeeds; on
/// a load failure the actor retires immediately and every `subscribe`
/// against the returned handle fails with `Unavailable`, matching
/// spec.md \S4.2's `Empty -> Hydrating -> Retired` failure path.
pub fn spawn(
    document_id: String,
    site: SiteId,
    config: Arc<Config>,
    store: Arc<dyn DocumentStore>,
    retired_tx: mpsc::UnboundedSender<String>,
) -> RoomHandle {
    let (tx, rx) = mpsc::channel(256);
    let now_ms = 0;
    let shared = Arc::new(RoomShared::new(now_ms));
    let handle = RoomHandle {
        document_id: document_id.clone(),
        tx,
        shared: shared.clone(),
    };

    let actor = Actor {
        document_id,
        config,
        store,
        crdt: SequenceCRDT::new(site),
        subscribers: HashMap::new(),
        dirty_since: None,
        shared,
        rx,
        retired_tx,
        clock_reference: Instant::now(),
        clock_reference_epoch_ms: now_ms,
    };

    tokio::spawn(actor.run());
    handle
}

impl Actor {
    fn now_ms(&self, now: Instant) -> u64 {
        epoch_ms(now, self.clock_reference, self.clock_reference_epoch_ms)
    }

    fn touch(&self) {
        self.shared.touch(self.now_ms(Instant::now()));
    }

    #[instrument(level = "info", skip(self), fields(document_id = %self.document_id))]
    async fn run(mut self) {
        match self.hydrate().await {
            Ok(()) => self.shared.set_state(RoomState::Live),
            Err(reason) => {
                warn!(document_id = %self.document_id, %reason, "hydration failed; room will not start");
                self.shared.set_state(RoomState::Retired);
                let _ = self.retired_tx.send(self.document_id.clone());
                return;
            }
        }

        let save_delay = self.config.save_delay;
        let mut deadline = TokioInstant::now() + save_delay;
        let mut compaction_tick = interval(COMPACTION_CHECK_INTERVAL);

        loop {
            tokio::select! {
                cmd = self.rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            let (retire, dirtied) = self.handle_command(cmd).await;
                            if dirtied {
                                deadline = TokioInstant::now() + save_delay;
                            }
                            if retire {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = sleep_until(deadline), if self.dirty_since.is_some() => {
                    self.flush(false).await;
                    deadline = TokioInstant::now() + save_delay;
                }
                _ = compaction_tick.tick() => {
                    self.maybe_compact().await;
                }
            }
        }

        self.flush(true).await;
        self.shared.set_state(RoomState::Retired);
        let _ = self.retired_tx.send(self.document_id.clone());
        info!(document_id = %self.document_id, "room retired");
    }

    async fn hydrate(&mut self) -> Result<(), String> {
        match self.store.load_state(&self.document_id).await {
            Ok(Some(bytes)) => match SequenceCRDT::restore(&bytes) {
                Ok(crdt) => {
                    self.crdt = crdt;
                    Ok(())
                }
                Err(e) => Err(format!("corrupt persisted state: {e}")),
            },
            Ok(None) => Ok(()),
            Err(e) => Err(format!("store error: {e}")),
        }
    }

    /// Returns `(retire, dirtied)`: `retire` is `true` once the room has
    /// reached `Retired` and its actor loop should stop; `dirtied` is
    /// `true` only when this command just applied an operation to the
    /// CRDT, which is the sole trigger for restarting the debounce
    /// deadline (spec.md \S4.4 debounces on accepted ops, not on any
    /// traffic — cursor/presence chatter must not keep pushing the save
    /// window out forever).
    async fn handle_command(&mut self, cmd: RoomCommand) -> (bool, bool) {
        match cmd {
            RoomCommand::Subscribe { conn, reply } => {
                self.on_subscribe(conn, reply).await;
                (false, false)
            }
            RoomCommand::Unsubscribe { id } => (self.on_unsubscribe(id).await, false),
            RoomCommand::Submit { conn_id, op, reply } => {
                let dirtied = self.on_submit(conn_id, op, reply);
                (false, dirtied)
            }
            RoomCommand::Cursor { conn_id, cursor } => {
                self.on_cursor(conn_id, cursor);
                (false, false)
            }
            RoomCommand::Presence { conn_id, payload } => {
                self.on_presence(conn_id, payload);
                (false, false)
            }
            RoomCommand::RequestState { conn_id: _, reply } => {
                let _ = reply.send(self.initial_state_message());
                (false, false)
            }
            RoomCommand::FlushNow { reply } => {
                self.flush(true).await;
                let _ = reply.send(());
                (false, false)
            }
        }
    }

    fn initial_state_message(&self) -> ServerMessage {
        codec::build_initial_state(
            &self.document_id,
            &self.crdt.snapshot_json(),
            &self.crdt.text(),
            self.config.snapshot_compress_threshold,
            self.config.snapshot_preview_chars,
        )
    }

    async fn on_subscribe(&mut self, conn: Connection, reply: oneshot::Sender<CoreResult<ServerMessage>>) {
        if matches!(self.shared.state(), RoomState::Draining) {
            self.shared.set_state(RoomState::Live);
        }

        let id = conn.id;
        let username = conn.username().to_string();
        let user_id = conn.identity.user_id().map(str::to_string);
        let site_id = conn.site_id.clone();

        self.subscribers.insert(id, conn);
        self.shared.set_subscribers(self.subscribers.len());
        self.touch();

        let _ = reply.send(Ok(self.initial_state_message()));

        self.broadcast_except(
            id,
            ServerMessage::UserJoined {
                user_id,
                username,
                site_id,
            },
        );
    }

    /// Returns `true` if the room should retire (reached `Retired` with
    /// no further subscriber arriving during the drain window).
    async fn on_unsubscribe(&mut self, id: ConnectionId) -> bool {
        let Some(conn) = self.subscribers.remove(&id) else {
            return false;
        };
        self.shared.set_subscribers(self.subscribers.len());
        self.touch();

        self.broadcast_except(
            id,
            ServerMessage::UserLeft {
                user_id: conn.identity.user_id().map(str::to_string),
                username: conn.username().to_string(),
                site_id: conn.site_id,
            },
        );

        if !self.subscribers.is_empty() {
            return false;
        }

        self.shared.set_state(RoomState::Draining);
        self.flush(true).await;

        // A reconnect racing the drain shows up as a queued command
        // behind this one; drain the immediate backlog before
        // committing to retirement, per spec.md \S4.2.
        while let Ok(pending) = self.rx.try_recv() {
            match pending {
                RoomCommand::Subscribe { conn, reply } => {
                    self.on_subscribe(conn, reply).await;
                    self.shared.set_state(RoomState::Live);
                    return false;
                }
                RoomCommand::RequestState { reply, .. } => {
                    let _ = reply.send(self.initial_state_message());
                }
                RoomCommand::Submit { reply, .. } => {
                    let _ = reply.send(SubmitOutcome::Reject("room is draining".to_string()));
                }
                RoomCommand::Unsubscribe { .. }
                | RoomCommand::Cursor { .. }
                | RoomCommand::Presence { .. } => {}
            }
        }

        true
    }

    /// Returns `true` when the operation actually mutated the CRDT, the
    /// only case that should restart the room's debounce deadline.
    fn on_submit(&mut self, conn_id: ConnectionId, op: Operation, reply: oneshot::Sender<SubmitOutcome>) -> bool {
        match self.crdt.apply_remote(op.clone()) {
            Applied::Applied => {
                self.dirty_since = Some(Instant::now());
                self.touch();
                self.broadcast_except(conn_id, ServerMessage::Operation { operation: op });
                let _ = reply.send(SubmitOutcome::Ack);
                true
            }
            Applied::Duplicate | Applied::Deferred => {
                let _ = reply.send(SubmitOutcome::Ack);
                false
            }
            Applied::Invalid(reason) => {
                let _ = reply.send(SubmitOutcome::Reject(reason));
                false
            }
        }
    }

    fn on_cursor(&mut self, conn_id: ConnectionId, cursor: ClientCursor) {
        let Some(origin) = self.subscribers.get(&conn_id) else {
            return;
        };
        let message = ServerMessage::Cursor {
            cursor: ServerCursor {
                site_id: origin.site_id.clone(),
                user_id: origin.identity.user_id().map(str::to_string),
                username: origin.username().to_string(),
                position: cursor.position,
                selection_start: cursor.selection_start,
                selection_end: cursor.selection_end,
            },
        };
        self.broadcast_except(conn_id, message);
    }

    fn on_presence(&mut self, conn_id: ConnectionId, mut payload: serde_json::Map<String, serde_json::Value>) {
        let Some(origin) = self.subscribers.get(&conn_id) else {
            return;
        };
        payload.insert("siteId".to_string(), serde_json::Value::String(origin.site_id.clone()));
        if let Some(uid) = origin.identity.user_id() {
            payload.insert("userId".to_string(), serde_json::Value::String(uid.to_string()));
        }
        payload.insert("username".to_string(), serde_json::Value::String(origin.username().to_string()));
        self.broadcast_except(conn_id, ServerMessage::Presence { presence: payload });
    }

    /// Sends `message` to every subscriber except `origin`. A subscriber
    /// whose outbound queue is full is dropped here rather than allowed
    /// to stall this actor, per spec.md \S5.
    fn broadcast_except(&mut self, origin: ConnectionId, message: ServerMessage) {
        let mut dead = Vec::new();
        for (id, conn) in self.subscribers.iter() {
            if *id == origin {
                continue;
            }
            if !conn.try_send(message.clone()) {
                dead.push(*id);
            }
        }
        for id in dead {
            self.subscribers.remove(&id);
        }
        self.shared.set_subscribers(self.subscribers.len());
    }

    /// Sends `message` to every subscriber, for events with no single
    /// originating connection (e.g. post-compaction refresh notices).
    fn broadcast_all(&mut self, message: ServerMessage) {
        let mut dead = Vec::new();
        for (id, conn) in self.subscribers.iter() {
            if !conn.try_send(message.clone()) {
                dead.push(*id);
            }
        }
        for id in dead {
            self.subscribers.remove(&id);
        }
        self.shared.set_subscribers(self.subscribers.len());
    }

    async fn flush(&mut self, forced: bool) {
        if self.dirty_since.is_none() && !forced {
            return;
        }
        let bytes = match self.crdt.snapshot() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(document_id = %self.document_id, error = %e, "failed to serialize room state");
                return;
            }
        };
        let outcome = persist::flush(
            &self.store,
            &self.document_id,
            &bytes,
            self.config.max_persisted_bytes,
        )
        .await;
        if matches!(outcome, persist::FlushOutcome::Written) {
            self.dirty_since = None;
        }
    }

    async fn maybe_compact(&mut self) {
        let now = Instant::now();
        if !self.crdt.due_for_compaction(now) {
            return;
        }
        let removed = self.crdt.compact(self.config.compaction_age, now);
        if removed > 0 {
            info!(document_id = %self.document_id, removed, "compacted tombstones");
            self.broadcast_all(ServerMessage::RefreshRequired {});
        }
    }
}

//! The session broker: the relay's single source of truth.
//!
//! Each session is its own lock domain (`Arc<Mutex<Session>>` behind a
//! `DashMap`); cross-session operations collect the entries first and lock
//! one at a time. Outbound sends go through per-connection unbounded
//! channels and never block, so frames routed while a session guard is held
//! reach each viewer in producer receive order.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use porthole_proto::{
    ClientFrame, DaemonCommand, EncryptedFrame, KeyKind, OutputEvent, RelayFrame, SealedEnvelope,
    SessionSummary,
};
use porthole_sealing::epoch_millis;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bound on both history rings.
pub const HISTORY_CAP: usize = 100;
/// Control lock idle expiry, measured from the holder's last input.
pub const CONTROL_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
/// Grace period before an empty session is deleted.
pub const REAP_AFTER: Duration = Duration::from_secs(60);
/// How long a dispatched daemon command may stay unanswered.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// What a connection's writer task pulls from its outbox.
#[derive(Debug)]
pub enum Outbound {
    Frame(RelayFrame),
    /// Terminate the connection (used when a producer binding is replaced).
    Close,
}

/// Handle for sending to one connection. Sends are lossy once the peer is
/// gone; the writer task owns the actual socket.
#[derive(Clone, Debug)]
pub struct Outbox(mpsc::UnboundedSender<Outbound>);

impl Outbox {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(tx), rx)
    }

    pub fn send(&self, frame: RelayFrame) {
        let _ = self.0.send(Outbound::Frame(frame));
    }

    pub fn close(&self) {
        let _ = self.0.send(Outbound::Close);
    }
}

#[derive(Debug)]
struct ProducerBinding {
    conn_id: String,
    outbox: Outbox,
    /// Daemon-bound producers get `sessionId` on their routed frames.
    via_daemon: bool,
}

#[derive(Debug)]
struct Viewer {
    public_key: Option<String>,
    nickname: Option<String>,
    outbox: Outbox,
}

#[derive(Debug)]
struct ControlLock {
    holder_id: String,
    holder_nickname: Option<String>,
    /// Wall clock, epoch millis; carried on `control-status`.
    acquired_at: u64,
    last_input_at: Instant,
}

impl ControlLock {
    fn idle_expired(&self, now: Instant) -> bool {
        now.duration_since(self.last_input_at) >= CONTROL_IDLE_TIMEOUT
    }
}

pub struct Session {
    session_id: String,
    user_id: Option<String>,
    producer: Option<ProducerBinding>,
    producer_public_key: Option<String>,
    viewers: HashMap<String, Viewer>,
    last_output: Option<OutputEvent>,
    output_history: VecDeque<OutputEvent>,
    encrypted_history: VecDeque<EncryptedFrame>,
    encrypted: bool,
    control_lock: Option<ControlLock>,
    created_at: u64,
    /// Creation order tiebreaker for newest-first listings.
    ordinal: u64,
    last_seq: u64,
    /// Set when the last producer or viewer departs; drives reaping.
    empty_since: Option<Instant>,
}

impl Session {
    fn new(session_id: String, ordinal: u64) -> Self {
        Self {
            session_id,
            user_id: None,
            producer: None,
            producer_public_key: None,
            viewers: HashMap::new(),
            last_output: None,
            output_history: VecDeque::new(),
            encrypted_history: VecDeque::new(),
            encrypted: false,
            control_lock: None,
            created_at: epoch_millis(),
            ordinal,
            last_seq: 0,
            empty_since: None,
        }
    }

    fn broadcast(&self, frame: RelayFrame) {
        for viewer in self.viewers.values() {
            viewer.outbox.send(frame.clone());
        }
    }

    fn broadcast_control(&self) {
        let frame = match &self.control_lock {
            Some(lock) => RelayFrame::ControlStatus {
                locked: true,
                holder_id: Some(lock.holder_id.clone()),
                holder_nickname: lock.holder_nickname.clone(),
                acquired_at: Some(lock.acquired_at),
            },
            None => RelayFrame::ControlStatus {
                locked: false,
                holder_id: None,
                holder_nickname: None,
                acquired_at: None,
            },
        };
        self.broadcast(frame);
    }

    fn cli_status(&self) -> RelayFrame {
        RelayFrame::CliStatus {
            connected: self.producer.is_some(),
            public_key: self.producer_public_key.clone(),
            encrypted: self.encrypted,
        }
    }

    fn mark_if_empty(&mut self, now: Instant) {
        if self.producer.is_none() && self.viewers.is_empty() {
            self.empty_since = Some(now);
        }
    }

    fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id.clone(),
            connected: self.producer.is_some(),
            viewer_count: self.viewers.len(),
            last_seq: self.last_seq,
            encrypted: self.encrypted,
            locked: self.control_lock.is_some(),
            created_at: self.created_at,
        }
    }
}

struct DaemonHandle {
    user_id: Option<String>,
    outbox: Outbox,
    sessions: HashSet<String>,
}

/// Why a viewer handshake was refused; the connection is closed either way.
#[derive(Debug, PartialEq, Eq)]
pub enum ViewerRejected {
    /// Encrypted sessions require a viewer public key.
    PublicKeyRequired,
}

/// Daemon RPC failure modes surfaced to the HTTP caller.
#[derive(Debug)]
pub enum CommandError {
    NoDaemon,
    Timeout,
    Failed(String),
}

impl CommandError {
    pub fn message(&self) -> String {
        match self {
            CommandError::NoDaemon => "No CLI daemon connected".to_string(),
            CommandError::Timeout => "Command timeout".to_string(),
            CommandError::Failed(message) => message.clone(),
        }
    }
}

pub struct Broker {
    sessions: DashMap<String, Arc<Mutex<Session>>>,
    daemons: DashMap<String, DaemonHandle>,
    /// Registration order; "first available" daemon wins dispatch.
    daemon_order: Mutex<Vec<String>>,
    pending: Arc<DashMap<String, oneshot::Sender<Result<serde_json::Value, CommandError>>>>,
    next_ordinal: AtomicU64,
}

impl Broker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            daemons: DashMap::new(),
            daemon_order: Mutex::new(Vec::new()),
            pending: Arc::new(DashMap::new()),
            next_ordinal: AtomicU64::new(0),
        })
    }

    /// Periodically delete sessions that have sat empty past the grace
    /// period.
    pub fn spawn_reaper(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5));
            loop {
                ticker.tick().await;
                self.reap_expired().await;
            }
        });
    }

    fn session_cell(&self, session_id: &str) -> Arc<Mutex<Session>> {
        self.sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                let ordinal = self.next_ordinal.fetch_add(1, Ordering::Relaxed);
                debug!(session = %session_id, "session created");
                Arc::new(Mutex::new(Session::new(session_id.to_string(), ordinal)))
            })
            .clone()
    }

    fn existing_session(&self, session_id: &str) -> Option<Arc<Mutex<Session>>> {
        self.sessions.get(session_id).map(|cell| cell.value().clone())
    }

    // ---- producer lifecycle -------------------------------------------------

    pub async fn bind_producer(
        &self,
        session_id: &str,
        conn_id: &str,
        outbox: Outbox,
        public_key: Option<String>,
        encrypted: bool,
        user_id: Option<String>,
        via_daemon: bool,
    ) {
        let cell = self.session_cell(session_id);
        let mut session = cell.lock().await;

        if session.user_id.is_none() {
            session.user_id = user_id;
        }

        if let Some(prev) = session.producer.take() {
            if prev.conn_id != conn_id {
                info!(session = %session_id, "replacing producer binding");
                prev.outbox.close();
            }
        }
        session.producer = Some(ProducerBinding {
            conn_id: conn_id.to_string(),
            outbox,
            via_daemon,
        });
        session.producer_public_key = public_key;
        session.encrypted = encrypted;
        session.empty_since = None;

        let status = session.cli_status();
        session.broadcast(status);
    }

    pub async fn unbind_producer(&self, session_id: &str, conn_id: &str) {
        let Some(cell) = self.existing_session(session_id) else {
            return;
        };
        let mut session = cell.lock().await;
        let bound = session
            .producer
            .as_ref()
            .map_or(false, |p| p.conn_id == conn_id);
        if !bound {
            return;
        }
        session.producer = None;
        session.producer_public_key = None;
        // The control lock survives producer churn; it expires on idle.
        let status = session.cli_status();
        session.broadcast(status);
        session.mark_if_empty(Instant::now());
        info!(session = %session_id, "producer disconnected");
    }

    pub async fn producer_frame(&self, session_id: &str, conn_id: &str, frame: ClientFrame) {
        let Some(cell) = self.existing_session(session_id) else {
            return;
        };
        let mut session = cell.lock().await;
        let current = session
            .producer
            .as_ref()
            .map_or(false, |p| p.conn_id == conn_id);
        if !current {
            // A replaced binding may still drain frames; drop them.
            return;
        }

        match frame {
            ClientFrame::Output {
                seq,
                content,
                timestamp,
            } => {
                let event = OutputEvent {
                    seq,
                    content,
                    timestamp,
                };
                session.last_seq = seq;
                session.last_output = Some(event.clone());
                push_capped(&mut session.output_history, event.clone());
                session.broadcast(RelayFrame::Output {
                    seq: event.seq,
                    content: event.content,
                    timestamp: event.timestamp,
                });
            }
            ClientFrame::EncryptedOutput {
                viewer_id,
                encrypted,
                seq,
                timestamp,
            } => {
                session.last_seq = seq;
                match session.viewers.get(&viewer_id) {
                    Some(viewer) => viewer.outbox.send(RelayFrame::EncryptedOutput {
                        encrypted,
                        seq,
                        timestamp,
                    }),
                    None => debug!(
                        session = %session_id,
                        viewer = %viewer_id,
                        "encrypted frame for departed viewer dropped"
                    ),
                }
            }
            ClientFrame::OutputHistory {
                encrypted,
                seq,
                timestamp,
            } => {
                session.last_seq = seq;
                push_capped(
                    &mut session.encrypted_history,
                    EncryptedFrame {
                        encrypted,
                        seq,
                        timestamp,
                    },
                );
            }
            other => {
                warn!(session = %session_id, frame = ?other, "unexpected producer frame");
            }
        }
    }

    // ---- viewer lifecycle ---------------------------------------------------

    pub async fn add_viewer(
        &self,
        session_id: &str,
        outbox: Outbox,
        public_key: Option<String>,
        nickname: Option<String>,
    ) -> Result<String, ViewerRejected> {
        let cell = self.session_cell(session_id);
        let mut session = cell.lock().await;

        if session.encrypted && public_key.is_none() {
            return Err(ViewerRejected::PublicKeyRequired);
        }

        let viewer_id = Uuid::new_v4().to_string();
        session.viewers.insert(
            viewer_id.clone(),
            Viewer {
                public_key,
                nickname,
                outbox: outbox.clone(),
            },
        );
        session.empty_since = None;

        outbox.send(session.cli_status());

        if session.encrypted {
            let viewer_key = session
                .viewers
                .get(&viewer_id)
                .and_then(|viewer| viewer.public_key.clone());
            if let (Some(producer), Some(key)) = (&session.producer, viewer_key) {
                producer.outbox.send(RelayFrame::ViewerJoined {
                    session_id: producer.via_daemon.then(|| session_id.to_string()),
                    viewer_id: viewer_id.clone(),
                    public_key: key,
                });
            }
        } else if let Some(last) = &session.last_output {
            outbox.send(RelayFrame::Output {
                seq: last.seq,
                content: last.content.clone(),
                timestamp: last.timestamp,
            });
        }

        debug!(session = %session_id, viewer = %viewer_id, "viewer joined");
        Ok(viewer_id)
    }

    pub async fn remove_viewer(&self, session_id: &str, viewer_id: &str) {
        let Some(cell) = self.existing_session(session_id) else {
            return;
        };
        let mut session = cell.lock().await;
        if session.viewers.remove(viewer_id).is_none() {
            return;
        }

        let held_lock = session
            .control_lock
            .as_ref()
            .map_or(false, |lock| lock.holder_id == viewer_id);
        if held_lock {
            session.control_lock = None;
            session.broadcast_control();
        }

        if let Some(producer) = &session.producer {
            producer.outbox.send(RelayFrame::ViewerLeft {
                session_id: producer.via_daemon.then(|| session_id.to_string()),
                viewer_id: viewer_id.to_string(),
            });
        }

        session.mark_if_empty(Instant::now());
        debug!(session = %session_id, viewer = %viewer_id, "viewer left");
    }

    pub async fn viewer_frame(&self, session_id: &str, viewer_id: &str, frame: ClientFrame) {
        let Some(cell) = self.existing_session(session_id) else {
            return;
        };
        let mut session = cell.lock().await;
        if !session.viewers.contains_key(viewer_id) {
            return;
        }

        match frame {
            ClientFrame::Input { keys, kind } => {
                self.gated_input(&mut session, session_id, viewer_id, PlainOrSealed::Plain {
                    keys,
                    kind,
                });
            }
            ClientFrame::EncryptedInput { encrypted } => {
                self.gated_input(
                    &mut session,
                    session_id,
                    viewer_id,
                    PlainOrSealed::Sealed(encrypted),
                );
            }
            ClientFrame::RequestControl => {
                let now = Instant::now();
                let grantable = match &session.control_lock {
                    None => true,
                    Some(lock) => lock.holder_id == viewer_id || lock.idle_expired(now),
                };
                if grantable {
                    let nickname = session
                        .viewers
                        .get(viewer_id)
                        .and_then(|v| v.nickname.clone());
                    session.control_lock = Some(ControlLock {
                        holder_id: viewer_id.to_string(),
                        holder_nickname: nickname,
                        acquired_at: epoch_millis(),
                        last_input_at: now,
                    });
                    session.broadcast_control();
                } else if let (Some(lock), Some(viewer)) =
                    (&session.control_lock, session.viewers.get(viewer_id))
                {
                    viewer.outbox.send(RelayFrame::ControlDenied {
                        reason: "locked".to_string(),
                        holder_id: Some(lock.holder_id.clone()),
                        holder_nickname: lock.holder_nickname.clone(),
                    });
                }
            }
            ClientFrame::ReleaseControl => {
                let held = session
                    .control_lock
                    .as_ref()
                    .map_or(false, |lock| lock.holder_id == viewer_id);
                if held {
                    session.control_lock = None;
                    session.broadcast_control();
                }
            }
            ClientFrame::GetHistory => {
                let Some(viewer) = session.viewers.get(viewer_id) else {
                    return;
                };
                let batch = if session.encrypted {
                    RelayFrame::EncryptedHistory {
                        frames: session.encrypted_history.iter().cloned().collect(),
                    }
                } else {
                    RelayFrame::History {
                        events: session.output_history.iter().cloned().collect(),
                    }
                };
                viewer.outbox.send(batch);
            }
            other => {
                warn!(session = %session_id, frame = ?other, "unexpected viewer frame");
            }
        }
    }

    /// Input gating: a live lock held by someone else rejects the message; an
    /// idle-expired lock is cleared on the way through; the holder's own
    /// input refreshes the lock.
    fn gated_input(
        &self,
        session: &mut Session,
        session_id: &str,
        viewer_id: &str,
        input: PlainOrSealed,
    ) {
        let now = Instant::now();
        let mut expire = false;
        match session.control_lock.as_mut() {
            Some(lock) if lock.holder_id != viewer_id => {
                if !lock.idle_expired(now) {
                    if let Some(viewer) = session.viewers.get(viewer_id) {
                        viewer.outbox.send(RelayFrame::InputRejected {
                            reason: "not-controller".to_string(),
                        });
                    }
                    return;
                }
                expire = true;
            }
            Some(lock) => lock.last_input_at = now,
            None => {}
        }
        if expire {
            session.control_lock = None;
            session.broadcast_control();
        }

        match &session.producer {
            Some(producer) => {
                let routed_session = producer.via_daemon.then(|| session_id.to_string());
                let frame = match input {
                    PlainOrSealed::Plain { keys, kind } => RelayFrame::Input { keys, kind },
                    PlainOrSealed::Sealed(encrypted) => RelayFrame::EncryptedInput {
                        session_id: routed_session,
                        viewer_id: viewer_id.to_string(),
                        encrypted,
                    },
                };
                producer.outbox.send(frame);
            }
            None => {
                if let Some(viewer) = session.viewers.get(viewer_id) {
                    viewer.outbox.send(RelayFrame::Error {
                        message: "CLI not connected".to_string(),
                    });
                }
            }
        }
    }

    // ---- daemon registry & RPC ----------------------------------------------

    pub async fn register_daemon(&self, daemon_id: &str, user_id: Option<String>, outbox: Outbox) {
        self.daemons.insert(
            daemon_id.to_string(),
            DaemonHandle {
                user_id,
                outbox,
                sessions: HashSet::new(),
            },
        );
        self.daemon_order.lock().await.push(daemon_id.to_string());
        info!(daemon = %daemon_id, "daemon connected");
    }

    pub async fn remove_daemon(&self, daemon_id: &str) {
        let Some((_, handle)) = self.daemons.remove(daemon_id) else {
            return;
        };
        self.daemon_order.lock().await.retain(|id| id != daemon_id);
        for session_id in handle.sessions {
            self.unbind_producer(&session_id, daemon_id).await;
        }
        info!(daemon = %daemon_id, "daemon disconnected");
    }

    pub async fn daemon_frame(&self, daemon_id: &str, frame: ClientFrame) {
        match frame {
            ClientFrame::SessionAttached {
                session_id,
                public_key,
                encrypted,
            } => {
                self.attach_daemon_session(daemon_id, &session_id, public_key, encrypted)
                    .await;
            }
            ClientFrame::SessionDetached { session_id } => {
                if let Some(mut handle) = self.daemons.get_mut(daemon_id) {
                    handle.sessions.remove(&session_id);
                }
                self.unbind_producer(&session_id, daemon_id).await;
            }
            ClientFrame::ActiveSessions { sessions } => {
                for attached in sessions {
                    self.attach_daemon_session(
                        daemon_id,
                        &attached.session_id,
                        attached.public_key,
                        attached.encrypted,
                    )
                    .await;
                }
            }
            ClientFrame::CliResponse {
                command_id,
                success,
                data,
                error,
            } => {
                let Some((_, waiter)) = self.pending.remove(&command_id) else {
                    debug!(command = %command_id, "response for expired command dropped");
                    return;
                };
                let outcome = if success {
                    Ok(data.unwrap_or(serde_json::Value::Null))
                } else {
                    Err(CommandError::Failed(
                        error.unwrap_or_else(|| "Command failed".to_string()),
                    ))
                };
                let _ = waiter.send(outcome);
            }
            other => {
                warn!(daemon = %daemon_id, frame = ?other, "unexpected daemon frame");
            }
        }
    }

    async fn attach_daemon_session(
        &self,
        daemon_id: &str,
        session_id: &str,
        public_key: String,
        encrypted: bool,
    ) {
        let (outbox, user_id) = match self.daemons.get_mut(daemon_id) {
            Some(mut handle) => {
                handle.sessions.insert(session_id.to_string());
                (handle.outbox.clone(), handle.user_id.clone())
            }
            None => return,
        };
        self.bind_producer(
            session_id,
            daemon_id,
            outbox,
            Some(public_key),
            encrypted,
            user_id,
            true,
        )
        .await;
    }

    pub async fn dispatch_command(
        &self,
        command: DaemonCommand,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, CommandError> {
        let outbox = {
            let order = self.daemon_order.lock().await;
            order
                .iter()
                .find_map(|id| self.daemons.get(id).map(|handle| handle.outbox.clone()))
        };
        let Some(outbox) = outbox else {
            return Err(CommandError::NoDaemon);
        };

        let command_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(command_id.clone(), tx);
        outbox.send(RelayFrame::CliCommand {
            command_id: command_id.clone(),
            command,
            params,
        });

        // The entry must not outlive the timeout even if this caller is
        // cancelled mid-await.
        let pending = self.pending.clone();
        let expired_id = command_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(COMMAND_TIMEOUT).await;
            pending.remove(&expired_id);
        });

        match tokio::time::timeout(COMMAND_TIMEOUT, rx).await {
            Ok(Ok(outcome)) => outcome,
            // The daemon vanished before answering.
            Ok(Err(_)) => {
                self.pending.remove(&command_id);
                Err(CommandError::Timeout)
            }
            Err(_) => {
                self.pending.remove(&command_id);
                Err(CommandError::Timeout)
            }
        }
    }

    // ---- directory ----------------------------------------------------------

    pub async fn summaries(&self) -> Vec<SessionSummary> {
        self.collect_summaries(|_| true).await
    }

    pub async fn user_sessions(&self, user_id: &str) -> Vec<SessionSummary> {
        self.collect_summaries(|session| session.user_id.as_deref() == Some(user_id))
            .await
    }

    pub async fn summary(&self, session_id: &str) -> Option<SessionSummary> {
        let cell = self.existing_session(session_id)?;
        let session = cell.lock().await;
        Some(session.summary())
    }

    async fn collect_summaries<F>(&self, keep: F) -> Vec<SessionSummary>
    where
        F: Fn(&Session) -> bool,
    {
        let cells: Vec<Arc<Mutex<Session>>> =
            self.sessions.iter().map(|e| e.value().clone()).collect();
        let mut rows = Vec::new();
        for cell in cells {
            let session = cell.lock().await;
            if keep(&session) {
                rows.push((session.ordinal, session.summary()));
            }
        }
        // Newest first.
        rows.sort_by(|a, b| b.0.cmp(&a.0));
        rows.into_iter().map(|(_, summary)| summary).collect()
    }

    // ---- reaping ------------------------------------------------------------

    pub async fn reap_expired(&self) -> Vec<String> {
        let entries: Vec<(String, Arc<Mutex<Session>>)> = self
            .sessions
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let mut reaped = Vec::new();
        for (session_id, cell) in entries {
            let expired = {
                let session = cell.lock().await;
                session.producer.is_none()
                    && session.viewers.is_empty()
                    && session
                        .empty_since
                        .map_or(false, |since| since.elapsed() >= REAP_AFTER)
            };
            if expired {
                self.sessions.remove(&session_id);
                info!(session = %session_id, "empty session reaped");
                reaped.push(session_id);
            }
        }
        reaped
    }
}

enum PlainOrSealed {
    Plain { keys: String, kind: KeyKind },
    Sealed(SealedEnvelope),
}

fn push_capped<T>(ring: &mut VecDeque<T>, item: T) {
    ring.push_back(item);
    while ring.len() > HISTORY_CAP {
        ring.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn outbox() -> (Outbox, UnboundedReceiver<Outbound>) {
        Outbox::channel()
    }

    fn frame(rx: &mut UnboundedReceiver<Outbound>) -> RelayFrame {
        match rx.try_recv().expect("expected a frame") {
            Outbound::Frame(frame) => frame,
            Outbound::Close => panic!("unexpected close"),
        }
    }

    fn drain(rx: &mut UnboundedReceiver<Outbound>) {
        while rx.try_recv().is_ok() {}
    }

    fn output(seq: u64, content: &str) -> ClientFrame {
        ClientFrame::Output {
            seq,
            content: content.to_string(),
            timestamp: 1_000 + seq,
        }
    }

    fn envelope(tag: &str) -> SealedEnvelope {
        SealedEnvelope {
            nonce: format!("n-{tag}"),
            ciphertext: format!("c-{tag}"),
        }
    }

    async fn plain_producer(broker: &Broker, session: &str) -> UnboundedReceiver<Outbound> {
        let (tx, rx) = outbox();
        broker
            .bind_producer(session, "prod-conn", tx, None, false, None, false)
            .await;
        rx
    }

    async fn encrypted_producer(broker: &Broker, session: &str) -> UnboundedReceiver<Outbound> {
        let (tx, rx) = outbox();
        broker
            .bind_producer(
                session,
                "prod-conn",
                tx,
                Some("producer-pk".to_string()),
                true,
                None,
                false,
            )
            .await;
        rx
    }

    async fn viewer(
        broker: &Broker,
        session: &str,
        key: Option<&str>,
    ) -> (String, UnboundedReceiver<Outbound>) {
        let (tx, rx) = outbox();
        let id = broker
            .add_viewer(session, tx, key.map(str::to_string), None)
            .await
            .expect("viewer accepted");
        (id, rx)
    }

    #[tokio::test]
    async fn late_viewer_gets_status_then_last_output_on_plain_sessions() {
        let broker = Broker::new();
        let _prod = plain_producer(&broker, "demo").await;
        broker
            .producer_frame("demo", "prod-conn", output(1, "hello\n"))
            .await;

        let (_, mut rx) = viewer(&broker, "demo", None).await;
        match frame(&mut rx) {
            RelayFrame::CliStatus {
                connected,
                encrypted,
                ..
            } => {
                assert!(connected);
                assert!(!encrypted);
            }
            other => panic!("expected cli-status, got {other:?}"),
        }
        match frame(&mut rx) {
            RelayFrame::Output { seq, content, .. } => {
                assert_eq!(seq, 1);
                assert_eq!(content, "hello\n");
            }
            other => panic!("expected output, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn encrypted_join_pairs_viewer_with_producer() {
        let broker = Broker::new();
        let mut prod_rx = encrypted_producer(&broker, "demo").await;
        let (viewer_id, mut rx) = viewer(&broker, "demo", Some("viewer-pk")).await;

        match frame(&mut rx) {
            RelayFrame::CliStatus {
                connected,
                public_key,
                encrypted,
            } => {
                assert!(connected);
                assert!(encrypted);
                assert_eq!(public_key.as_deref(), Some("producer-pk"));
            }
            other => panic!("expected cli-status, got {other:?}"),
        }
        match frame(&mut prod_rx) {
            RelayFrame::ViewerJoined {
                session_id,
                viewer_id: joined,
                public_key,
            } => {
                assert_eq!(session_id, None);
                assert_eq!(joined, viewer_id);
                assert_eq!(public_key, "viewer-pk");
            }
            other => panic!("expected viewer-joined, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn encrypted_sessions_refuse_keyless_viewers() {
        let broker = Broker::new();
        let _prod = encrypted_producer(&broker, "demo").await;
        let (tx, _rx) = outbox();
        let refused = broker.add_viewer("demo", tx, None, None).await;
        assert_eq!(refused.unwrap_err(), ViewerRejected::PublicKeyRequired);
    }

    #[tokio::test]
    async fn output_fans_out_and_rings_stay_bounded() {
        let broker = Broker::new();
        let _prod = plain_producer(&broker, "demo").await;
        let (_, mut rx) = viewer(&broker, "demo", None).await;
        drain(&mut rx);

        for seq in 1..=150 {
            broker
                .producer_frame("demo", "prod-conn", output(seq, "frame"))
                .await;
        }

        let mut seen = 0;
        let mut last = 0;
        while let Ok(Outbound::Frame(RelayFrame::Output { seq, .. })) = rx.try_recv() {
            assert!(seq > last, "sequence regressed: {last} -> {seq}");
            last = seq;
            seen += 1;
        }
        assert_eq!(seen, 150);

        let cell = broker.existing_session("demo").unwrap();
        let session = cell.lock().await;
        assert_eq!(session.output_history.len(), HISTORY_CAP);
        assert_eq!(session.output_history.front().unwrap().seq, 51);
        assert_eq!(session.last_output.as_ref().unwrap().seq, 150);
        assert_eq!(session.last_seq, 150);
    }

    #[tokio::test]
    async fn encrypted_output_reaches_only_the_named_viewer() {
        let broker = Broker::new();
        let _prod = encrypted_producer(&broker, "demo").await;
        let (a, mut rx_a) = viewer(&broker, "demo", Some("pk-a")).await;
        let (_b, mut rx_b) = viewer(&broker, "demo", Some("pk-b")).await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        broker
            .producer_frame(
                "demo",
                "prod-conn",
                ClientFrame::EncryptedOutput {
                    viewer_id: a.clone(),
                    encrypted: envelope("a"),
                    seq: 3,
                    timestamp: 3,
                },
            )
            .await;

        match frame(&mut rx_a) {
            RelayFrame::EncryptedOutput { encrypted, seq, .. } => {
                assert_eq!(encrypted, envelope("a"));
                assert_eq!(seq, 3);
            }
            other => panic!("expected encrypted-output, got {other:?}"),
        }
        assert!(rx_b.try_recv().is_err(), "frame leaked to another viewer");
    }

    #[tokio::test]
    async fn control_lock_is_mutually_exclusive() {
        let broker = Broker::new();
        let mut prod_rx = encrypted_producer(&broker, "demo").await;
        let (a, mut rx_a) = viewer(&broker, "demo", Some("pk-a")).await;
        let (b, mut rx_b) = viewer(&broker, "demo", Some("pk-b")).await;
        drain(&mut prod_rx);
        drain(&mut rx_a);
        drain(&mut rx_b);

        broker
            .viewer_frame("demo", &a, ClientFrame::RequestControl)
            .await;
        match frame(&mut rx_a) {
            RelayFrame::ControlStatus {
                locked, holder_id, ..
            } => {
                assert!(locked);
                assert_eq!(holder_id.as_deref(), Some(a.as_str()));
            }
            other => panic!("expected control-status, got {other:?}"),
        }
        drain(&mut rx_b);

        broker
            .viewer_frame("demo", &b, ClientFrame::RequestControl)
            .await;
        match frame(&mut rx_b) {
            RelayFrame::ControlDenied {
                reason, holder_id, ..
            } => {
                assert_eq!(reason, "locked");
                assert_eq!(holder_id.as_deref(), Some(a.as_str()));
            }
            other => panic!("expected control-denied, got {other:?}"),
        }

        broker
            .viewer_frame(
                "demo",
                &b,
                ClientFrame::EncryptedInput {
                    encrypted: envelope("b"),
                },
            )
            .await;
        match frame(&mut rx_b) {
            RelayFrame::InputRejected { reason } => assert_eq!(reason, "not-controller"),
            other => panic!("expected input-rejected, got {other:?}"),
        }
        assert!(
            prod_rx.try_recv().is_err(),
            "non-holder input reached the producer"
        );

        broker
            .viewer_frame(
                "demo",
                &a,
                ClientFrame::EncryptedInput {
                    encrypted: envelope("a"),
                },
            )
            .await;
        match frame(&mut prod_rx) {
            RelayFrame::EncryptedInput { viewer_id, .. } => assert_eq!(viewer_id, a),
            other => panic!("expected encrypted-input, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn idle_lock_expires_and_lets_another_viewer_take_over() {
        let broker = Broker::new();
        let mut prod_rx = encrypted_producer(&broker, "demo").await;
        let (a, mut rx_a) = viewer(&broker, "demo", Some("pk-a")).await;
        let (b, mut rx_b) = viewer(&broker, "demo", Some("pk-b")).await;
        drain(&mut prod_rx);

        broker
            .viewer_frame("demo", &a, ClientFrame::RequestControl)
            .await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        tokio::time::advance(CONTROL_IDLE_TIMEOUT).await;

        broker
            .viewer_frame("demo", &b, ClientFrame::RequestControl)
            .await;
        match frame(&mut rx_b) {
            RelayFrame::ControlStatus {
                locked, holder_id, ..
            } => {
                assert!(locked);
                assert_eq!(holder_id.as_deref(), Some(b.as_str()));
            }
            other => panic!("expected control-status, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn idle_lock_is_cleared_in_line_by_a_foreign_input() {
        let broker = Broker::new();
        let mut prod_rx = encrypted_producer(&broker, "demo").await;
        let (a, _rx_a) = viewer(&broker, "demo", Some("pk-a")).await;
        let (b, mut rx_b) = viewer(&broker, "demo", Some("pk-b")).await;
        drain(&mut prod_rx);

        broker
            .viewer_frame("demo", &a, ClientFrame::RequestControl)
            .await;
        drain(&mut rx_b);

        tokio::time::advance(CONTROL_IDLE_TIMEOUT).await;

        broker
            .viewer_frame(
                "demo",
                &b,
                ClientFrame::EncryptedInput {
                    encrypted: envelope("b"),
                },
            )
            .await;

        // Expiry broadcast, then the input itself reaches the producer.
        match frame(&mut rx_b) {
            RelayFrame::ControlStatus { locked, .. } => assert!(!locked),
            other => panic!("expected unlock broadcast, got {other:?}"),
        }
        match frame(&mut prod_rx) {
            RelayFrame::EncryptedInput { viewer_id, .. } => assert_eq!(viewer_id, b),
            other => panic!("expected encrypted-input, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn only_the_holder_may_release() {
        let broker = Broker::new();
        let _prod = encrypted_producer(&broker, "demo").await;
        let (a, mut rx_a) = viewer(&broker, "demo", Some("pk-a")).await;
        let (b, mut rx_b) = viewer(&broker, "demo", Some("pk-b")).await;

        broker
            .viewer_frame("demo", &a, ClientFrame::RequestControl)
            .await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        broker
            .viewer_frame("demo", &b, ClientFrame::ReleaseControl)
            .await;
        assert!(rx_a.try_recv().is_err(), "foreign release broadcast a change");

        broker
            .viewer_frame("demo", &a, ClientFrame::ReleaseControl)
            .await;
        match frame(&mut rx_a) {
            RelayFrame::ControlStatus { locked, .. } => assert!(!locked),
            other => panic!("expected unlock broadcast, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn input_without_a_producer_reports_cli_not_connected() {
        let broker = Broker::new();
        let (a, mut rx_a) = viewer(&broker, "demo", None).await;
        drain(&mut rx_a);

        broker
            .viewer_frame(
                "demo",
                &a,
                ClientFrame::Input {
                    keys: "ls\n".to_string(),
                    kind: KeyKind::Text,
                },
            )
            .await;
        match frame(&mut rx_a) {
            RelayFrame::Error { message } => assert_eq!(message, "CLI not connected"),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn get_history_returns_the_matching_ring() {
        let broker = Broker::new();
        let _prod = plain_producer(&broker, "demo").await;
        broker
            .producer_frame("demo", "prod-conn", output(1, "one"))
            .await;
        broker
            .producer_frame("demo", "prod-conn", output(2, "two"))
            .await;

        let (a, mut rx_a) = viewer(&broker, "demo", None).await;
        drain(&mut rx_a);
        broker.viewer_frame("demo", &a, ClientFrame::GetHistory).await;
        match frame(&mut rx_a) {
            RelayFrame::History { events } => {
                assert_eq!(events.len(), 2);
                assert_eq!(events[0].seq, 1);
                assert_eq!(events[1].seq, 2);
            }
            other => panic!("expected history, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn encrypted_get_history_returns_the_encrypted_ring() {
        let broker = Broker::new();
        let _prod = encrypted_producer(&broker, "demo").await;
        broker
            .producer_frame(
                "demo",
                "prod-conn",
                ClientFrame::OutputHistory {
                    encrypted: envelope("h"),
                    seq: 4,
                    timestamp: 4,
                },
            )
            .await;

        let (a, mut rx_a) = viewer(&broker, "demo", Some("pk-a")).await;
        drain(&mut rx_a);
        broker.viewer_frame("demo", &a, ClientFrame::GetHistory).await;
        match frame(&mut rx_a) {
            RelayFrame::EncryptedHistory { frames } => {
                assert_eq!(frames.len(), 1);
                assert_eq!(frames[0].seq, 4);
            }
            other => panic!("expected encrypted-history, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn departing_lock_holder_frees_the_lock_and_notifies_producer() {
        let broker = Broker::new();
        let mut prod_rx = encrypted_producer(&broker, "demo").await;
        let (a, _rx_a) = viewer(&broker, "demo", Some("pk-a")).await;
        let (_b, mut rx_b) = viewer(&broker, "demo", Some("pk-b")).await;
        drain(&mut prod_rx);

        broker
            .viewer_frame("demo", &a, ClientFrame::RequestControl)
            .await;
        drain(&mut rx_b);

        broker.remove_viewer("demo", &a).await;
        match frame(&mut rx_b) {
            RelayFrame::ControlStatus { locked, .. } => assert!(!locked),
            other => panic!("expected unlock broadcast, got {other:?}"),
        }
        match frame(&mut prod_rx) {
            RelayFrame::ViewerLeft { viewer_id, .. } => assert_eq!(viewer_id, a),
            other => panic!("expected viewer-left, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn producer_disconnect_broadcasts_but_keeps_the_lock() {
        let broker = Broker::new();
        let _prod = encrypted_producer(&broker, "demo").await;
        let (a, mut rx_a) = viewer(&broker, "demo", Some("pk-a")).await;
        broker
            .viewer_frame("demo", &a, ClientFrame::RequestControl)
            .await;
        drain(&mut rx_a);

        broker.unbind_producer("demo", "prod-conn").await;
        match frame(&mut rx_a) {
            RelayFrame::CliStatus {
                connected,
                public_key,
                ..
            } => {
                assert!(!connected);
                assert_eq!(public_key, None);
            }
            other => panic!("expected cli-status, got {other:?}"),
        }

        let cell = broker.existing_session("demo").unwrap();
        assert!(cell.lock().await.control_lock.is_some());
    }

    #[tokio::test]
    async fn replacing_a_producer_closes_the_previous_binding() {
        let broker = Broker::new();
        let (first_tx, mut first_rx) = outbox();
        broker
            .bind_producer("demo", "conn-1", first_tx, None, false, None, false)
            .await;
        let (second_tx, _second_rx) = outbox();
        broker
            .bind_producer("demo", "conn-2", second_tx, None, false, None, false)
            .await;

        assert!(matches!(
            first_rx.try_recv(),
            Ok(Outbound::Close)
        ));

        // Frames from the replaced binding are dropped.
        broker
            .producer_frame("demo", "conn-1", output(9, "stale"))
            .await;
        let cell = broker.existing_session("demo").unwrap();
        assert_eq!(cell.lock().await.last_seq, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_sessions_are_reaped_after_the_grace_period() {
        let broker = Broker::new();
        let _prod = plain_producer(&broker, "dead").await;
        let (v, _rx) = viewer(&broker, "alive", None).await;
        let _ = v;

        broker.unbind_producer("dead", "prod-conn").await;
        tokio::time::advance(REAP_AFTER - Duration::from_secs(1)).await;
        assert!(broker.reap_expired().await.is_empty());

        tokio::time::advance(Duration::from_secs(1)).await;
        let reaped = broker.reap_expired().await;
        assert_eq!(reaped, vec!["dead".to_string()]);
        assert!(broker.existing_session("dead").is_none());
        assert!(broker.existing_session("alive").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn a_returning_viewer_cancels_reaping() {
        let broker = Broker::new();
        let _prod = plain_producer(&broker, "demo").await;
        broker.unbind_producer("demo", "prod-conn").await;
        tokio::time::advance(Duration::from_secs(30)).await;

        let (_v, _rx) = viewer(&broker, "demo", None).await;
        tokio::time::advance(REAP_AFTER).await;
        assert!(broker.reap_expired().await.is_empty());
    }

    #[tokio::test]
    async fn daemon_rpc_round_trips_through_the_broker() {
        let broker = Broker::new();
        let (tx, mut daemon_rx) = outbox();
        broker.register_daemon("d-1", None, tx).await;

        let dispatcher = {
            let broker = broker.clone();
            tokio::spawn(async move {
                broker
                    .dispatch_command(
                        DaemonCommand::CreateSession,
                        Some(serde_json::json!({"name": "x"})),
                    )
                    .await
            })
        };

        let command_id = loop {
            if let Some(out) = daemon_rx.recv().await {
                match out {
                    Outbound::Frame(RelayFrame::CliCommand {
                        command_id,
                        command,
                        params,
                    }) => {
                        assert_eq!(command, DaemonCommand::CreateSession);
                        assert_eq!(params.unwrap()["name"], "x");
                        break command_id;
                    }
                    other => panic!("expected cli-command, got {other:?}"),
                }
            }
        };

        broker
            .daemon_frame(
                "d-1",
                ClientFrame::CliResponse {
                    command_id,
                    success: true,
                    data: Some(serde_json::json!({"name": "x"})),
                    error: None,
                },
            )
            .await;

        let outcome = dispatcher.await.unwrap().unwrap();
        assert_eq!(outcome["name"], "x");
    }

    #[tokio::test]
    async fn dispatch_without_a_daemon_fails_fast() {
        let broker = Broker::new();
        let err = broker
            .dispatch_command(DaemonCommand::ListSessions, None)
            .await
            .unwrap_err();
        assert_eq!(err.message(), "No CLI daemon connected");
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_commands_time_out() {
        let broker = Broker::new();
        let (tx, _daemon_rx) = outbox();
        broker.register_daemon("d-1", None, tx).await;

        let err = broker
            .dispatch_command(DaemonCommand::ListSessions, None)
            .await
            .unwrap_err();
        assert_eq!(err.message(), "Command timeout");
        assert!(broker.pending.is_empty());
    }

    #[tokio::test]
    async fn user_sessions_come_back_newest_first() {
        let broker = Broker::new();
        let user = "hash-of-s".to_string();
        let (tx_a, _rx_a) = outbox();
        broker
            .bind_producer("a", "conn-a", tx_a, None, false, Some(user.clone()), false)
            .await;
        let (tx_b, _rx_b) = outbox();
        broker
            .bind_producer("b", "conn-b", tx_b, None, false, Some(user.clone()), false)
            .await;

        let mine = broker.user_sessions(&user).await;
        assert_eq!(
            mine.iter().map(|s| s.session_id.as_str()).collect::<Vec<_>>(),
            vec!["b", "a"]
        );
        assert!(broker.user_sessions("other-hash").await.is_empty());
    }

    #[tokio::test]
    async fn daemon_disconnect_detaches_every_bound_session() {
        let broker = Broker::new();
        let (tx, _daemon_rx) = outbox();
        broker.register_daemon("d-1", None, tx).await;
        broker
            .daemon_frame(
                "d-1",
                ClientFrame::SessionAttached {
                    session_id: "one".into(),
                    public_key: "pk-1".into(),
                    encrypted: true,
                },
            )
            .await;
        broker
            .daemon_frame(
                "d-1",
                ClientFrame::SessionAttached {
                    session_id: "two".into(),
                    public_key: "pk-2".into(),
                    encrypted: true,
                },
            )
            .await;

        let (_v, mut rx_v) = viewer(&broker, "one", Some("pk-v")).await;
        drain(&mut rx_v);

        broker.remove_daemon("d-1").await;
        match frame(&mut rx_v) {
            RelayFrame::CliStatus { connected, .. } => assert!(!connected),
            other => panic!("expected cli-status, got {other:?}"),
        }
        let two = broker.summary("two").await.unwrap();
        assert!(!two.connected);
    }
}

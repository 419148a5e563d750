//! Wire schema for the porthole relay protocol.
//!
//! Every message is one JSON object per WebSocket text frame, tagged by a
//! kebab-case `type` field with camelCase payload fields. The relay treats
//! these shapes as the contract with producers, daemons, and viewers; field
//! names here must not drift.

use serde::{Deserialize, Serialize};

/// A single full-pane snapshot emitted by a producer.
///
/// `seq` starts at 1 and increases by 1 per distinct frame within one
/// producer incarnation. `timestamp` is producer wall clock, epoch millis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputEvent {
    pub seq: u64,
    pub content: String,
    pub timestamp: u64,
}

/// An AEAD ciphertext plus its nonce, both base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedEnvelope {
    pub nonce: String,
    pub ciphertext: String,
}

/// An encrypted frame as retained in the relay's best-effort history ring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedFrame {
    pub encrypted: SealedEnvelope,
    pub seq: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyKind {
    /// Literal text, injected as-is.
    Text,
    /// A symbolic key name understood by the terminal backend
    /// (`Enter`, `Tab`, `Up`, `C-c`, ...).
    Special,
}

/// Plaintext of a viewer keystroke, also the decrypted payload of
/// `encrypted-input`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keystroke {
    pub keys: String,
    #[serde(rename = "type")]
    pub kind: KeyKind,
}

/// Role a connection declares in its handshake query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Producer,
    Daemon,
    Viewer,
}

/// Query parameters carried on the `/ws` upgrade request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectQuery {
    pub role: Role,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub user_secret: Option<String>,
}

/// RPC commands a daemon executes on behalf of the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DaemonCommand {
    ListSessions,
    CreateSession,
    AttachSession,
    DetachSession,
}

/// One session as a daemon announces it in `active-sessions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachedSession {
    pub session_id: String,
    pub public_key: String,
    pub encrypted: bool,
    pub viewer_count: usize,
}

/// Messages any client (producer, daemon, or viewer) may send to the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    /// Producer frame on the unencrypted path; fanned out to every viewer.
    Output {
        seq: u64,
        content: String,
        timestamp: u64,
    },
    /// Producer frame addressed to exactly one viewer; the relay routes it
    /// without decrypting or retaining it.
    EncryptedOutput {
        viewer_id: String,
        encrypted: SealedEnvelope,
        seq: u64,
        timestamp: u64,
    },
    /// Best-effort late-join context, appended to the encrypted history ring.
    OutputHistory {
        encrypted: SealedEnvelope,
        seq: u64,
        timestamp: u64,
    },
    /// Daemon binds itself as producer for a session.
    SessionAttached {
        session_id: String,
        public_key: String,
        encrypted: bool,
    },
    /// Daemon releases a session.
    SessionDetached { session_id: String },
    /// Daemon re-announces everything it still serves after a reconnect.
    ActiveSessions { sessions: Vec<AttachedSession> },
    /// Daemon's answer to a `cli-command`.
    CliResponse {
        command_id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Viewer keystroke on the unencrypted path. The sealed payload of
    /// `encrypted-input` keeps the original `{keys, type}` shape
    /// ([`Keystroke`]); here the kind travels as `kind` because `type` is
    /// taken by the frame discriminator.
    Input { keys: String, kind: KeyKind },
    /// Viewer keystroke sealed under the producer-viewer shared secret.
    EncryptedInput { encrypted: SealedEnvelope },
    RequestControl,
    ReleaseControl,
    GetHistory,
}

/// Messages the relay sends to producers, daemons, and viewers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum RelayFrame {
    Output {
        seq: u64,
        content: String,
        timestamp: u64,
    },
    EncryptedOutput {
        encrypted: SealedEnvelope,
        seq: u64,
        timestamp: u64,
    },
    /// The plaintext history ring, delivered as one batch.
    History { events: Vec<OutputEvent> },
    /// The encrypted history ring, delivered as one batch.
    EncryptedHistory { frames: Vec<EncryptedFrame> },
    /// Producer presence as seen by the relay.
    CliStatus {
        connected: bool,
        public_key: Option<String>,
        encrypted: bool,
    },
    ControlStatus {
        locked: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        holder_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        holder_nickname: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        acquired_at: Option<u64>,
    },
    ControlDenied {
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        holder_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        holder_nickname: Option<String>,
    },
    InputRejected { reason: String },
    Error { message: String },
    /// A viewer paired with the producer's session; `session_id` is present
    /// only when the producer side is a daemon.
    ViewerJoined {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        viewer_id: String,
        public_key: String,
    },
    ViewerLeft {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        viewer_id: String,
    },
    EncryptedInput {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        viewer_id: String,
        encrypted: SealedEnvelope,
    },
    Input { keys: String, kind: KeyKind },
    /// RPC dispatched to a daemon.
    CliCommand {
        command_id: String,
        command: DaemonCommand,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        params: Option<serde_json::Value>,
    },
}

/// Relay-side summary of a session, used by the HTTP directory endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub connected: bool,
    pub viewer_count: usize,
    pub last_seq: u64,
    pub encrypted: bool,
    pub locked: bool,
    pub created_at: u64,
}

/// Payload of a successful `list-sessions` daemon command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInventory {
    /// Every session the terminal backend knows about.
    pub all: Vec<String>,
    /// The subset currently attached to the daemon.
    pub active: Vec<String>,
    pub sessions: Vec<InventoryEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryEntry {
    pub name: String,
    pub attached: bool,
    pub viewer_count: usize,
}

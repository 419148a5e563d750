//! Per-session producer controller: capture polling, per-viewer sealing, and
//! input injection.
//!
//! One controller owns one key-pair incarnation. A transport reconnect tears
//! the incarnation down (fresh keys, empty secret map, sequence restarted) so
//! viewers always re-pair against current material.

use std::collections::HashMap;

use porthole_proto::{ClientFrame, KeyKind, Keystroke, OutputEvent, SealedEnvelope};
use porthole_sealing::{epoch_millis, KeyPair, SharedKey};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::pane::PaneBackend;

/// Frames bound for the relay. The link layer owns the socket; controllers
/// only ever see this sink.
pub type FrameSink = mpsc::UnboundedSender<ClientFrame>;

pub struct SessionController {
    session_id: String,
    /// tmux target the controller captures and injects into.
    target: String,
    keys: KeyPair,
    encrypted: bool,
    secrets: HashMap<String, SharedKey>,
    /// Viewer join order; the earliest still-present viewer keys the
    /// best-effort history copies.
    join_order: Vec<String>,
    seq: u64,
    last_content: Option<String>,
    last_event: Option<OutputEvent>,
}

impl SessionController {
    pub fn new(session_id: impl Into<String>, target: impl Into<String>, encrypted: bool) -> Self {
        Self {
            session_id: session_id.into(),
            target: target.into(),
            keys: KeyPair::generate(),
            encrypted,
            secrets: HashMap::new(),
            join_order: Vec::new(),
            seq: 0,
            last_content: None,
            last_event: None,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn public_key(&self) -> String {
        self.keys.public_base64()
    }

    pub fn encrypted(&self) -> bool {
        self.encrypted
    }

    pub fn viewer_count(&self) -> usize {
        self.secrets.len()
    }

    /// Start a new incarnation after a transport reconnect: fresh keys, no
    /// pairings, sequence numbering from scratch. The next poll republishes
    /// the current screen as seq 1.
    pub fn reset_incarnation(&mut self) {
        self.keys = KeyPair::generate();
        self.secrets.clear();
        self.join_order.clear();
        self.seq = 0;
        self.last_content = None;
        self.last_event = None;
    }

    /// One capture tick. A failed or overrunning capture drops this tick;
    /// the next one reads the latest screen anyway.
    pub async fn poll(&mut self, pane: &dyn PaneBackend, sink: &FrameSink) {
        match pane.capture(&self.target).await {
            Ok(content) => self.observe(content, sink),
            Err(err) => debug!(
                session = %self.session_id,
                %err,
                "capture tick dropped"
            ),
        }
    }

    /// Feed one snapshot through the diff gate. The initial non-empty
    /// snapshot always becomes seq 1; after that only changes emit.
    fn observe(&mut self, content: String, sink: &FrameSink) {
        if self.seq == 0 {
            if content.is_empty() {
                return;
            }
        } else if self.last_content.as_deref() == Some(content.as_str()) {
            return;
        }

        self.seq += 1;
        let event = OutputEvent {
            seq: self.seq,
            content,
            timestamp: epoch_millis(),
        };
        self.last_content = Some(event.content.clone());
        self.publish(&event, sink);
        self.last_event = Some(event);
    }

    fn publish(&self, event: &OutputEvent, sink: &FrameSink) {
        if !self.encrypted {
            let _ = sink.send(ClientFrame::Output {
                seq: event.seq,
                content: event.content.clone(),
                timestamp: event.timestamp,
            });
            return;
        }

        for viewer_id in &self.join_order {
            let Some(key) = self.secrets.get(viewer_id) else {
                continue;
            };
            if let Some(encrypted) = self.seal_event(event, key) {
                let _ = sink.send(ClientFrame::EncryptedOutput {
                    viewer_id: viewer_id.clone(),
                    encrypted,
                    seq: event.seq,
                    timestamp: event.timestamp,
                });
            }
        }

        // Best-effort late-join context, sealed for whichever viewer paired
        // first; the relay retains it opaquely.
        if let Some(first) = self.join_order.first() {
            if let Some(key) = self.secrets.get(first) {
                if let Some(encrypted) = self.seal_event(event, key) {
                    let _ = sink.send(ClientFrame::OutputHistory {
                        encrypted,
                        seq: event.seq,
                        timestamp: event.timestamp,
                    });
                }
            }
        }
    }

    fn seal_event(&self, event: &OutputEvent, key: &SharedKey) -> Option<SealedEnvelope> {
        let plaintext = match serde_json::to_vec(event) {
            Ok(plaintext) => plaintext,
            Err(err) => {
                warn!(session = %self.session_id, %err, "frame serialization failed");
                return None;
            }
        };
        match key.seal(&plaintext) {
            Ok(envelope) => Some(envelope),
            Err(err) => {
                warn!(session = %self.session_id, %err, "frame sealing failed");
                None
            }
        }
    }

    /// Pair with a viewer and immediately push the cached screen to it alone,
    /// so late joiners see the pane before the next diff.
    pub fn viewer_joined(&mut self, viewer_id: &str, viewer_public_key: &str, sink: &FrameSink) {
        let key = match self.keys.derive_shared(viewer_public_key) {
            Ok(key) => key,
            Err(err) => {
                warn!(
                    session = %self.session_id,
                    viewer = %viewer_id,
                    %err,
                    "viewer key rejected"
                );
                return;
            }
        };

        if let Some(event) = &self.last_event {
            if let Some(encrypted) = self.seal_event(event, &key) {
                let _ = sink.send(ClientFrame::EncryptedOutput {
                    viewer_id: viewer_id.to_string(),
                    encrypted,
                    seq: event.seq,
                    timestamp: event.timestamp,
                });
            }
        }

        self.secrets.insert(viewer_id.to_string(), key);
        self.join_order.push(viewer_id.to_string());
        debug!(session = %self.session_id, viewer = %viewer_id, "viewer paired");
    }

    pub fn viewer_left(&mut self, viewer_id: &str) {
        self.secrets.remove(viewer_id);
        self.join_order.retain(|id| id != viewer_id);
        debug!(session = %self.session_id, viewer = %viewer_id, "viewer unpaired");
    }

    /// Decrypt and inject a sealed keystroke. Every failure here is logged
    /// and dropped; nothing is reflected back through the relay.
    pub async fn handle_encrypted_input(
        &self,
        viewer_id: &str,
        envelope: &SealedEnvelope,
        pane: &dyn PaneBackend,
    ) {
        let Some(key) = self.secrets.get(viewer_id) else {
            warn!(
                session = %self.session_id,
                viewer = %viewer_id,
                "input from unpaired viewer dropped"
            );
            return;
        };
        let plaintext = match key.open(envelope) {
            Ok(plaintext) => plaintext,
            Err(err) => {
                warn!(session = %self.session_id, viewer = %viewer_id, %err, "input decrypt failed");
                return;
            }
        };
        let stroke: Keystroke = match serde_json::from_slice(&plaintext) {
            Ok(stroke) => stroke,
            Err(err) => {
                warn!(session = %self.session_id, viewer = %viewer_id, %err, "input parse failed");
                return;
            }
        };
        self.inject(&stroke, pane).await;
    }

    /// Unencrypted-path keystroke.
    pub async fn handle_plain_input(&self, keys: String, kind: KeyKind, pane: &dyn PaneBackend) {
        self.inject(&Keystroke { keys, kind }, pane).await;
    }

    async fn inject(&self, stroke: &Keystroke, pane: &dyn PaneBackend) {
        let result = match stroke.kind {
            KeyKind::Text => pane.send_text(&self.target, &stroke.keys).await,
            KeyKind::Special => pane.send_key(&self.target, &stroke.keys).await,
        };
        if let Err(err) = result {
            warn!(session = %self.session_id, %err, "input injection failed");
        }
    }
}

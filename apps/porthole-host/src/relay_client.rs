//! WebSocket link to the relay.
//!
//! One [`connect`] call is one link incarnation: a writer task drains the
//! outbound channel into the socket and a reader task parses inbound frames.
//! When either side dies the inbound channel closes, which is the caller's
//! signal to tear down the incarnation and reconnect with fresh keys.

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use porthole_proto::{ClientFrame, RelayFrame, Role};
use tokio::sync::mpsc;
use tokio::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

use crate::controller::FrameSink;

/// Reconnect pacing: base 1 s, doubling to a 5 s cap, unbounded attempts.
pub struct Backoff {
    delay: Duration,
}

impl Backoff {
    const BASE: Duration = Duration::from_secs(1);
    const CAP: Duration = Duration::from_secs(5);

    pub fn new() -> Self {
        Self { delay: Self::BASE }
    }

    pub fn next(&mut self) -> Duration {
        let current = self.delay;
        self.delay = (self.delay * 2).min(Self::CAP);
        current
    }

    pub fn reset(&mut self) {
        self.delay = Self::BASE;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

/// Handshake context serialized into the `/ws` query string.
pub struct Handshake<'a> {
    pub role: Role,
    pub session_id: Option<&'a str>,
    pub public_key: Option<&'a str>,
    pub user_secret: Option<&'a str>,
}

pub fn connect_url(server: &str, handshake: &Handshake<'_>) -> Result<Url> {
    let base = server.trim_end_matches('/');
    let mut url = Url::parse(&format!("{base}/ws")).context("invalid relay URL")?;
    {
        let mut pairs = url.query_pairs_mut();
        let role = match handshake.role {
            Role::Producer => "producer",
            Role::Daemon => "daemon",
            Role::Viewer => "viewer",
        };
        pairs.append_pair("role", role);
        if let Some(session_id) = handshake.session_id {
            pairs.append_pair("sessionId", session_id);
        }
        if let Some(public_key) = handshake.public_key {
            pairs.append_pair("publicKey", public_key);
        }
        if let Some(user_secret) = handshake.user_secret {
            pairs.append_pair("userSecret", user_secret);
        }
    }
    Ok(url)
}

/// Open one link incarnation. Returns the outbound sink and the inbound
/// frame stream; the stream ends when the connection is gone.
pub async fn connect(url: &Url) -> Result<(FrameSink, mpsc::UnboundedReceiver<RelayFrame>)> {
    let (ws_stream, _) = connect_async(url.as_str())
        .await
        .context("relay connection failed")?;
    let (mut ws_sink, mut ws_source) = ws_stream.split();

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ClientFrame>();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<RelayFrame>();

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let json = match serde_json::to_string(&frame) {
                Ok(json) => json,
                Err(err) => {
                    warn!(%err, "outbound frame serialization failed");
                    continue;
                }
            };
            if ws_sink.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    tokio::spawn(async move {
        while let Some(message) = ws_source.next().await {
            match message {
                Ok(Message::Text(text)) => match serde_json::from_str::<RelayFrame>(&text) {
                    Ok(frame) => {
                        if inbound_tx.send(frame).is_err() {
                            break;
                        }
                    }
                    Err(err) => debug!(%err, "unparseable relay frame dropped"),
                },
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
        // Dropping inbound_tx closes the stream, which the run loop treats
        // as a disconnect.
        writer.abort();
    });

    Ok((outbound_tx, inbound_rx))
}

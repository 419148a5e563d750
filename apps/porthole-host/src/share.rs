//! Single-session producer: one tmux target, one relay session, reconnect
//! forever.

use std::sync::Arc;

use anyhow::Result;
use porthole_proto::{RelayFrame, Role};
use porthole_sealing::PairingCode;
use tokio::time::{interval, sleep, Duration};
use tracing::{debug, info, warn};

use crate::controller::SessionController;
use crate::pane::PaneBackend;
use crate::relay_client::{self, Backoff, Handshake};

pub struct ShareOptions {
    pub server: String,
    pub session_id: String,
    pub target: String,
    pub interval: Duration,
    pub encrypted: bool,
    pub user_secret: Option<String>,
}

/// Run the producer until the process is killed. Each successful connection
/// is a fresh incarnation: new key pair, new pairing code, sequence restarted.
pub async fn run(options: ShareOptions, pane: Arc<dyn PaneBackend>) -> Result<()> {
    let mut backoff = Backoff::new();
    let mut reported_down = false;

    loop {
        let mut controller = SessionController::new(
            options.session_id.clone(),
            options.target.clone(),
            options.encrypted,
        );
        let public_key = options.encrypted.then(|| controller.public_key());
        let url = relay_client::connect_url(
            &options.server,
            &Handshake {
                role: Role::Producer,
                session_id: Some(&options.session_id),
                public_key: public_key.as_deref(),
                user_secret: options.user_secret.as_deref(),
            },
        )?;

        match relay_client::connect(&url).await {
            Ok((sink, mut inbound)) => {
                backoff.reset();
                reported_down = false;
                info!(session = %options.session_id, "connected to relay");
                if let Some(public_key) = &public_key {
                    let code = PairingCode::new(&options.session_id, public_key).encode();
                    println!("pairing code: {code}");
                }

                let mut ticker = interval(options.interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            controller.poll(pane.as_ref(), &sink).await;
                        }
                        frame = inbound.recv() => match frame {
                            Some(frame) => {
                                dispatch(&mut controller, frame, pane.as_ref(), &sink).await;
                            }
                            None => break,
                        },
                    }
                }
                warn!(session = %options.session_id, "relay connection lost; reconnecting");
            }
            Err(err) => {
                // Log the outage once, then keep retrying quietly.
                if !reported_down {
                    warn!(session = %options.session_id, %err, "relay unreachable; retrying");
                    reported_down = true;
                } else {
                    debug!(session = %options.session_id, %err, "retry failed");
                }
            }
        }

        sleep(backoff.next()).await;
    }
}

async fn dispatch(
    controller: &mut SessionController,
    frame: RelayFrame,
    pane: &dyn PaneBackend,
    sink: &crate::controller::FrameSink,
) {
    match frame {
        RelayFrame::ViewerJoined {
            viewer_id,
            public_key,
            ..
        } => controller.viewer_joined(&viewer_id, &public_key, sink),
        RelayFrame::ViewerLeft { viewer_id, .. } => controller.viewer_left(&viewer_id),
        RelayFrame::EncryptedInput {
            viewer_id,
            encrypted,
            ..
        } => {
            controller
                .handle_encrypted_input(&viewer_id, &encrypted, pane)
                .await
        }
        RelayFrame::Input { keys, kind } => controller.handle_plain_input(keys, kind, pane).await,
        RelayFrame::Error { message } => warn!(%message, "relay error"),
        other => debug!(frame = ?other, "ignored relay frame"),
    }
}

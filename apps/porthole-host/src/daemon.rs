//! Multi-session daemon: one relay connection serving many sessions, driven
//! by remote RPC commands.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use porthole_proto::{
    AttachedSession, ClientFrame, DaemonCommand, InventoryEntry, RelayFrame, Role,
    SessionInventory,
};
use porthole_sealing::PairingCode;
use serde_json::{json, Value};
use tokio::time::{interval, sleep, Duration};
use tracing::{debug, info, warn};

use crate::controller::{FrameSink, SessionController};
use crate::pane::PaneBackend;
use crate::relay_client::{self, Backoff, Handshake};

pub struct DaemonOptions {
    pub server: String,
    pub interval: Duration,
    pub user_secret: Option<String>,
}

pub struct Daemon {
    pane: Arc<dyn PaneBackend>,
    sessions: HashMap<String, SessionController>,
}

impl Daemon {
    pub fn new(pane: Arc<dyn PaneBackend>) -> Self {
        Self {
            pane,
            sessions: HashMap::new(),
        }
    }

    /// Poll every attached session once. Captures run sequentially; each is
    /// individually bounded by the pane backend.
    pub async fn poll_all(&mut self, sink: &FrameSink) {
        for controller in self.sessions.values_mut() {
            controller.poll(self.pane.as_ref(), sink).await;
        }
    }

    /// Fresh incarnations for every attached session, then the summary the
    /// relay uses to rebind them. Called on every (re)connect.
    pub fn announce(&mut self, sink: &FrameSink) {
        let mut sessions = Vec::new();
        for controller in self.sessions.values_mut() {
            controller.reset_incarnation();
            sessions.push(AttachedSession {
                session_id: controller.session_id().to_string(),
                public_key: controller.public_key(),
                encrypted: true,
                viewer_count: controller.viewer_count(),
            });
        }
        if !sessions.is_empty() {
            let _ = sink.send(ClientFrame::ActiveSessions { sessions });
        }
    }

    pub async fn handle_frame(&mut self, frame: RelayFrame, sink: &FrameSink) {
        match frame {
            RelayFrame::CliCommand {
                command_id,
                command,
                params,
            } => self.execute(command_id, command, params, sink).await,
            RelayFrame::ViewerJoined {
                session_id: Some(session_id),
                viewer_id,
                public_key,
            } => {
                if let Some(controller) = self.sessions.get_mut(&session_id) {
                    controller.viewer_joined(&viewer_id, &public_key, sink);
                }
            }
            RelayFrame::ViewerLeft {
                session_id: Some(session_id),
                viewer_id,
            } => {
                if let Some(controller) = self.sessions.get_mut(&session_id) {
                    controller.viewer_left(&viewer_id);
                }
            }
            RelayFrame::EncryptedInput {
                session_id: Some(session_id),
                viewer_id,
                encrypted,
            } => {
                if let Some(controller) = self.sessions.get(&session_id) {
                    controller
                        .handle_encrypted_input(&viewer_id, &encrypted, self.pane.as_ref())
                        .await;
                }
            }
            RelayFrame::Error { message } => warn!(%message, "relay error"),
            other => debug!(frame = ?other, "ignored relay frame"),
        }
    }

    /// Execute one RPC command. Failures are answered, never thrown; the
    /// relay's HTTP caller sees exactly what we return here.
    pub async fn execute(
        &mut self,
        command_id: String,
        command: DaemonCommand,
        params: Option<Value>,
        sink: &FrameSink,
    ) {
        let result = match command {
            DaemonCommand::ListSessions => self.list_sessions().await,
            DaemonCommand::CreateSession => match session_name(&params) {
                Ok(name) => self.create_session(&name).await,
                Err(err) => Err(err),
            },
            DaemonCommand::AttachSession => match session_name(&params) {
                Ok(name) => self.attach_session(&name, sink).await,
                Err(err) => Err(err),
            },
            DaemonCommand::DetachSession => match session_name(&params) {
                Ok(name) => self.detach_session(&name, sink),
                Err(err) => Err(err),
            },
        };

        let response = match result {
            Ok(data) => ClientFrame::CliResponse {
                command_id,
                success: true,
                data: Some(data),
                error: None,
            },
            Err(error) => ClientFrame::CliResponse {
                command_id,
                success: false,
                data: None,
                error: Some(error),
            },
        };
        let _ = sink.send(response);
    }

    async fn list_sessions(&self) -> Result<Value, String> {
        let all = self
            .pane
            .list_sessions()
            .await
            .map_err(|err| err.to_string())?;
        let active: Vec<String> = self.sessions.keys().cloned().collect();
        let sessions = all
            .iter()
            .map(|name| InventoryEntry {
                name: name.clone(),
                attached: self.sessions.contains_key(name),
                viewer_count: self
                    .sessions
                    .get(name)
                    .map_or(0, SessionController::viewer_count),
            })
            .collect();
        serde_json::to_value(SessionInventory {
            all,
            active,
            sessions,
        })
        .map_err(|err| err.to_string())
    }

    async fn create_session(&mut self, name: &str) -> Result<Value, String> {
        if self
            .pane
            .has_session(name)
            .await
            .map_err(|err| err.to_string())?
        {
            return Err(format!("Session already exists: {name}"));
        }
        self.pane
            .create_session(name)
            .await
            .map_err(|err| err.to_string())?;
        info!(session = %name, "terminal session created");
        Ok(json!({ "name": name }))
    }

    async fn attach_session(&mut self, name: &str, sink: &FrameSink) -> Result<Value, String> {
        if !self
            .pane
            .has_session(name)
            .await
            .map_err(|err| err.to_string())?
        {
            return Err(format!("Unknown session: {name}"));
        }
        if self.sessions.contains_key(name) {
            return Err(format!("Session already attached: {name}"));
        }

        let controller = SessionController::new(name, name, true);
        let public_key = controller.public_key();
        let _ = sink.send(ClientFrame::SessionAttached {
            session_id: name.to_string(),
            public_key: public_key.clone(),
            encrypted: true,
        });
        let pairing_code = PairingCode::new(name, &public_key).encode();
        self.sessions.insert(name.to_string(), controller);
        info!(session = %name, "session attached");

        Ok(json!({
            "name": name,
            "publicKey": public_key,
            "pairingCode": pairing_code,
        }))
    }

    fn detach_session(&mut self, name: &str, sink: &FrameSink) -> Result<Value, String> {
        if self.sessions.remove(name).is_none() {
            return Err(format!("Session not attached: {name}"));
        }
        let _ = sink.send(ClientFrame::SessionDetached {
            session_id: name.to_string(),
        });
        info!(session = %name, "session detached");
        Ok(json!({ "name": name }))
    }
}

fn session_name(params: &Option<Value>) -> Result<String, String> {
    params
        .as_ref()
        .and_then(|params| params.get("name"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| "Missing session name".to_string())
}

/// Run the daemon until the process is killed, reconnecting forever.
pub async fn run(options: DaemonOptions, pane: Arc<dyn PaneBackend>) -> Result<()> {
    let mut daemon = Daemon::new(pane);
    let mut backoff = Backoff::new();
    let mut reported_down = false;

    loop {
        let url = relay_client::connect_url(
            &options.server,
            &Handshake {
                role: Role::Daemon,
                session_id: None,
                public_key: None,
                user_secret: options.user_secret.as_deref(),
            },
        )?;

        match relay_client::connect(&url).await {
            Ok((sink, mut inbound)) => {
                backoff.reset();
                reported_down = false;
                info!("daemon connected to relay");
                daemon.announce(&sink);

                let mut ticker = interval(options.interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => daemon.poll_all(&sink).await,
                        frame = inbound.recv() => match frame {
                            Some(frame) => daemon.handle_frame(frame, &sink).await,
                            None => break,
                        },
                    }
                }
                warn!("relay connection lost; reconnecting");
            }
            Err(err) => {
                if !reported_down {
                    warn!(%err, "relay unreachable; retrying");
                    reported_down = true;
                } else {
                    debug!(%err, "retry failed");
                }
            }
        }

        sleep(backoff.next()).await;
    }
}

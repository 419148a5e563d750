//! Terminal pane backends.
//!
//! The controller only ever talks to a [`PaneBackend`]; the production
//! implementation shells out to tmux, and [`MemoryPane`] stands in for it in
//! tests and demos. Every subprocess invocation is bounded so a wedged tmux
//! drops a capture tick instead of stalling the poll loop.

use std::process::Output;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;

#[derive(Debug, Error)]
pub enum PaneError {
    #[error("terminal backend i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("tmux: {0}")]
    Backend(String),
    #[error("pane command timed out")]
    Timeout,
    #[error("pane emitted non-utf8 output")]
    InvalidUtf8,
}

#[async_trait]
pub trait PaneBackend: Send + Sync {
    /// Full snapshot of the pane's current screen.
    async fn capture(&self, target: &str) -> Result<String, PaneError>;
    /// Inject literal text.
    async fn send_text(&self, target: &str, text: &str) -> Result<(), PaneError>;
    /// Inject a symbolic key name (`Enter`, `Tab`, `Up`, `C-c`, ...).
    async fn send_key(&self, target: &str, key: &str) -> Result<(), PaneError>;
    async fn list_sessions(&self) -> Result<Vec<String>, PaneError>;
    async fn has_session(&self, name: &str) -> Result<bool, PaneError>;
    async fn create_session(&self, name: &str) -> Result<(), PaneError>;
}

/// The tmux adapter. One subprocess per operation, each bounded by
/// `command_timeout`.
pub struct TmuxPane {
    command_timeout: Duration,
}

impl TmuxPane {
    pub fn new() -> Self {
        Self {
            command_timeout: Duration::from_secs(2),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<Output, PaneError> {
        let output = timeout(self.command_timeout, Command::new("tmux").args(args).output())
            .await
            .map_err(|_| PaneError::Timeout)??;
        Ok(output)
    }

    async fn run_checked(&self, args: &[&str]) -> Result<Output, PaneError> {
        let output = self.run(args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(PaneError::Backend(stderr));
        }
        Ok(output)
    }
}

impl Default for TmuxPane {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PaneBackend for TmuxPane {
    async fn capture(&self, target: &str) -> Result<String, PaneError> {
        let output = self
            .run_checked(&["capture-pane", "-p", "-e", "-t", target])
            .await?;
        String::from_utf8(output.stdout).map_err(|_| PaneError::InvalidUtf8)
    }

    async fn send_text(&self, target: &str, text: &str) -> Result<(), PaneError> {
        self.run_checked(&["send-keys", "-t", target, "-l", text])
            .await?;
        Ok(())
    }

    async fn send_key(&self, target: &str, key: &str) -> Result<(), PaneError> {
        self.run_checked(&["send-keys", "-t", target, key]).await?;
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<String>, PaneError> {
        let output = self
            .run(&["list-sessions", "-F", "#{session_name}"])
            .await?;
        if !output.status.success() {
            // tmux exits non-zero when no server is running; that simply
            // means there are no sessions.
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("no server running") {
                return Ok(Vec::new());
            }
            return Err(PaneError::Backend(stderr.trim().to_string()));
        }
        let listing = String::from_utf8(output.stdout).map_err(|_| PaneError::InvalidUtf8)?;
        Ok(listing.lines().map(str::to_string).collect())
    }

    async fn has_session(&self, name: &str) -> Result<bool, PaneError> {
        // `=` forces exact-name matching; bare targets are prefix matches.
        let exact = format!("={name}");
        let output = self.run(&["has-session", "-t", &exact]).await?;
        Ok(output.status.success())
    }

    async fn create_session(&self, name: &str) -> Result<(), PaneError> {
        self.run_checked(&["new-session", "-d", "-s", name]).await?;
        Ok(())
    }
}

/// In-memory pane used by tests and local demos: a scripted screen plus a
/// record of everything injected into it.
#[derive(Default)]
pub struct MemoryPane {
    state: std::sync::Mutex<MemoryPaneState>,
}

#[derive(Default)]
struct MemoryPaneState {
    screen: String,
    sessions: Vec<String>,
    injected: Vec<InjectedKeys>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectedKeys {
    pub target: String,
    pub keys: String,
    pub literal: bool,
}

impl MemoryPane {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sessions<I: IntoIterator<Item = S>, S: Into<String>>(sessions: I) -> Self {
        let pane = Self::default();
        pane.state.lock().unwrap().sessions = sessions.into_iter().map(Into::into).collect();
        pane
    }

    pub fn set_screen(&self, screen: &str) {
        self.state.lock().unwrap().screen = screen.to_string();
    }

    pub fn injected(&self) -> Vec<InjectedKeys> {
        self.state.lock().unwrap().injected.clone()
    }
}

#[async_trait]
impl PaneBackend for MemoryPane {
    async fn capture(&self, _target: &str) -> Result<String, PaneError> {
        Ok(self.state.lock().unwrap().screen.clone())
    }

    async fn send_text(&self, target: &str, text: &str) -> Result<(), PaneError> {
        self.state.lock().unwrap().injected.push(InjectedKeys {
            target: target.to_string(),
            keys: text.to_string(),
            literal: true,
        });
        Ok(())
    }

    async fn send_key(&self, target: &str, key: &str) -> Result<(), PaneError> {
        self.state.lock().unwrap().injected.push(InjectedKeys {
            target: target.to_string(),
            keys: key.to_string(),
            literal: false,
        });
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<String>, PaneError> {
        Ok(self.state.lock().unwrap().sessions.clone())
    }

    async fn has_session(&self, name: &str) -> Result<bool, PaneError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .sessions
            .iter()
            .any(|s| s == name))
    }

    async fn create_session(&self, name: &str) -> Result<(), PaneError> {
        let mut state = self.state.lock().unwrap();
        if state.sessions.iter().any(|s| s == name) {
            return Err(PaneError::Backend(format!("duplicate session: {name}")));
        }
        state.sessions.push(name.to_string());
        Ok(())
    }
}

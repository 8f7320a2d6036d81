use tokio::sync::{RwLock, broadcast};
use tracing::debug;

use crate::config::ResponderConfig;
use crate::error::AutopilotError;
use crate::session::{AutopilotEvent, Session, SessionState, SessionSummary};

/// Runs one child process at a time and answers it with a canned response.
pub struct AutoResponder {
    config: ResponderConfig,
    event_tx: broadcast::Sender<AutopilotEvent>,
    session: RwLock<Option<Session>>,
}

impl AutoResponder {
    pub fn new(config: ResponderConfig) -> Self {
        let (event_tx, _) = broadcast::channel(1024);
        Self {
            config,
            event_tx,
            session: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &ResponderConfig {
        &self.config
    }

    /// Subscribe to events from this responder's sessions.
    ///
    /// Subscribe before `start` to see every line the child prints.
    pub fn subscribe(&self) -> broadcast::Receiver<AutopilotEvent> {
        self.event_tx.subscribe()
    }

    /// Spawn `command` (program followed by its arguments) and start responding.
    ///
    /// Fails with [`AutopilotError::AlreadyRunning`] while a previous session
    /// has not reached `Stopped`.
    pub async fn start(&self, command: &[String]) -> Result<(), AutopilotError> {
        let mut slot = self.session.write().await;
        if slot
            .as_ref()
            .is_some_and(|s| s.state() != SessionState::Stopped)
        {
            return Err(AutopilotError::AlreadyRunning);
        }

        let session = Session::spawn(command, &self.config, self.event_tx.clone())?;
        *slot = Some(session);
        Ok(())
    }

    /// Stop the current session. Returns once the child has exited, or after
    /// the grace period if it could not be reaped. No-op when nothing runs.
    pub async fn stop(&self) {
        match self.current().await {
            Some(session) => session.stop().await,
            None => debug!("stop() with no session"),
        }
    }

    /// Wait for the current session to stop on its own or via `stop()`.
    ///
    /// Returns None if no session was ever started.
    pub async fn wait(&self) -> Option<SessionSummary> {
        let session = self.current().await?;
        Some(session.wait().await)
    }

    /// State of the current session; `Stopped` if none was started.
    pub async fn state(&self) -> SessionState {
        self.current()
            .await
            .map(|s| s.state())
            .unwrap_or(SessionState::Stopped)
    }

    pub async fn pid(&self) -> Option<u32> {
        self.current().await.and_then(|s| s.pid())
    }

    /// Write counts and exit code of the current session so far.
    pub async fn summary(&self) -> Option<SessionSummary> {
        let session = self.current().await?;
        Some(session.summary().await)
    }

    // Cloned out so no lock is held while waiting on the session
    async fn current(&self) -> Option<Session> {
        self.session.read().await.clone()
    }
}

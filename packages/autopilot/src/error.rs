use std::io;

/// Errors surfaced by the autopilot
#[derive(Debug, thiserror::Error)]
pub enum AutopilotError {
    /// The child process could not be launched (not found, permission denied, ...)
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    /// No program was given to run
    #[error("no command to run")]
    EmptyCommand,

    /// A session is already active on this responder
    #[error("a session is already running")]
    AlreadyRunning,

    /// The child's input stream is gone (session stopping, child exited)
    #[error("child stream closed")]
    StreamClosed,

    /// Writing the response to the child's stdin failed
    #[error("failed to write to child: {0}")]
    WriteFailed(#[source] io::Error),

    /// Configuration could not be loaded
    #[error("invalid configuration: {0}")]
    Config(#[from] Box<figment::Error>),
}

impl AutopilotError {
    /// Errors that end a session quietly instead of being reported as failures.
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::StreamClosed | Self::WriteFailed(_))
    }
}

impl From<figment::Error> for AutopilotError {
    fn from(err: figment::Error) -> Self {
        Self::Config(Box::new(err))
    }
}

//! Autopilot - keep an interactive program moving without a human at the keyboard
//!
//! An [`AutoResponder`] spawns a child process with piped stdio and writes a
//! canned response (`"1\n"` by default) into its stdin:
//!
//! - on a fixed interval, regardless of what the child prints, and
//! - immediately, whenever a line of child output contains a trigger phrase.
//!
//! # Example
//!
//! ```no_run
//! use autopilot::{AutoResponder, AutopilotEvent, ResponderConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), autopilot::AutopilotError> {
//!     let responder = AutoResponder::new(ResponderConfig::default());
//!     let mut events = responder.subscribe();
//!
//!     responder.start(&["claude".to_string(), "code".to_string()]).await?;
//!
//!     while let Ok(event) = events.recv().await {
//!         match event {
//!             AutopilotEvent::Output(line) => println!("{}", line.text),
//!             AutopilotEvent::Exited { .. } => break,
//!             _ => {}
//!         }
//!     }
//!
//!     responder.stop().await;
//!     Ok(())
//! }
//! ```

pub mod config;
mod error;
mod responder;
pub mod session;
pub mod triggers;

pub use config::{FileConfig, ResponderConfig};
pub use error::AutopilotError;
pub use responder::AutoResponder;
pub use session::{
    AutopilotEvent, OutputLine, OutputStream, ResponseReason, SessionState, SessionSummary,
};
pub use triggers::TriggerSet;

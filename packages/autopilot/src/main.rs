use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use autopilot::{
    AutoResponder, AutopilotEvent, FileConfig, OutputStream, ResponderConfig, ResponseReason,
};

#[derive(Parser)]
#[command(name = "autopilot")]
#[command(about = "Runs an interactive program and keeps answering its prompts")]
struct Args {
    /// Command to run, with its arguments (default: `claude code`)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,

    /// Config file (missing file is fine)
    #[arg(short, long, default_value = "autopilot.toml")]
    config: PathBuf,

    /// Milliseconds between timed responses (0 disables the timer)
    #[arg(long)]
    interval_ms: Option<u64>,

    /// Milliseconds a terminated child gets before it is killed
    #[arg(long)]
    grace_ms: Option<u64>,

    /// Trigger phrase, repeatable; replaces the configured list
    #[arg(short, long = "trigger")]
    triggers: Vec<String>,

    /// Keystrokes to send; a newline is appended if missing
    #[arg(short, long)]
    response: Option<String>,

    /// Don't echo the child's output
    #[arg(short, long)]
    quiet: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

impl Args {
    fn apply(self, fc: &mut FileConfig) {
        if !self.command.is_empty() {
            fc.command = self.command;
        }
        if let Some(interval_ms) = self.interval_ms {
            fc.interval_ms = interval_ms;
        }
        if let Some(grace_ms) = self.grace_ms {
            fc.grace_ms = grace_ms;
        }
        if !self.triggers.is_empty() {
            fc.triggers = self.triggers;
        }
        if let Some(mut response) = self.response {
            if !response.ends_with('\n') {
                response.push('\n');
            }
            fc.response = response;
        }
        if self.quiet {
            fc.echo = false;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr so echoed child output owns stdout
    let default_directive = if args.debug {
        "autopilot=debug"
    } else {
        "autopilot=info"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let mut file_config = FileConfig::load(&args.config).context("Failed to load config")?;
    args.apply(&mut file_config);

    let responder = AutoResponder::new(ResponderConfig::from_file(&file_config));

    info!("Starting autopilot for: {:?}", file_config.command);
    info!(
        "Will answer with {:?} every {} ms and on {} trigger phrases",
        file_config.response,
        file_config.interval_ms,
        responder.config().triggers.phrases().len()
    );
    info!("Press Ctrl+C to stop");

    let mut events = responder.subscribe();
    let echo = file_config.echo;
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(AutopilotEvent::Output(line)) if echo => match line.stream {
                    OutputStream::Stdout => println!("{}", line.text),
                    OutputStream::Stderr => eprintln!("{}", line.text),
                },
                Ok(AutopilotEvent::Responded {
                    reason: ResponseReason::Trigger(phrase),
                    ..
                }) => {
                    info!("Auto-responding to prompt (matched {:?})", phrase);
                }
                Ok(AutopilotEvent::Exited { .. }) => break,
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => warn!("Output printer lagged, skipped {} events", n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    responder
        .start(&file_config.command)
        .await
        .context("Failed to start session")?;

    let interrupted = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        summary = responder.wait() => {
            if let Some(summary) = summary {
                info!(
                    "Child exited with code {:?} ({} timed, {} triggered responses)",
                    summary.exit_code, summary.timer_writes, summary.trigger_writes
                );
            }
        }
        _ = interrupted => {
            info!("Stopping autopilot...");
            responder.stop().await;
        }
    }

    // The printer ends on the session's Exited event
    if tokio::time::timeout(std::time::Duration::from_secs(1), printer)
        .await
        .is_err()
    {
        warn!("Output printer did not finish");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_command_with_flags() {
        let args =
            Args::try_parse_from(["autopilot", "--interval-ms", "500", "claude", "--resume"])
                .unwrap();
        assert_eq!(args.command, vec!["claude", "--resume"]);
        assert_eq!(args.interval_ms, Some(500));
    }

    #[test]
    fn apply_overrides() {
        let args = Args::try_parse_from([
            "autopilot", "-t", "Approve?", "-t", "y/n", "-r", "y", "-q", "sh",
        ])
        .unwrap();
        let mut fc = FileConfig::default();
        args.apply(&mut fc);

        assert_eq!(fc.command, vec!["sh"]);
        assert_eq!(fc.triggers, vec!["Approve?", "y/n"]);
        assert_eq!(fc.response, "y\n");
        assert!(!fc.echo);
        assert_eq!(fc.interval_ms, 2000);
    }

    #[test]
    fn no_args_keeps_config() {
        let args = Args::try_parse_from(["autopilot"]).unwrap();
        let mut fc = FileConfig::default();
        args.apply(&mut fc);
        assert_eq!(fc, FileConfig::default());
    }
}

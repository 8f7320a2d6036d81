//! One run of the monitored child process, from spawn to exit.
//!
//! A session owns three tasks besides the supervisor:
//!
//! - the timer, writing the response every interval,
//! - the stdout reader, surfacing lines and answering trigger phrases,
//! - the stderr reader, surfacing lines (and answering triggers if enabled).
//!
//! A stop request ends the timer at once. The readers keep draining until the
//! child is reaped, then for a bounded time after.
//!
//! All writes to the child's stdin go through [`Shared::respond`], which holds
//! the session lock for the duration of the write and refuses to write unless
//! the session is `Running`. Moving out of `Running` drops stdin under the
//! same lock, so once a stop has begun no further write can happen.

use std::fmt;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ResponderConfig;
use crate::error::AutopilotError;
use crate::triggers::TriggerSet;

/// Upper bound on a single response write; a child that stops draining its
/// stdin must not wedge the session lock.
const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// How long readers may keep draining after a terminated child is reaped.
const OUTPUT_DRAIN: Duration = Duration::from_millis(250);

/// Extra time `stop()` allows on top of the grace period for tasks to wind down.
const STOP_SLACK: Duration = Duration::from_secs(2);

/// Lifecycle of a session
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Running => write!(f, "running"),
            SessionState::Stopping => write!(f, "stopping"),
            SessionState::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputStream::Stdout => write!(f, "stdout"),
            OutputStream::Stderr => write!(f, "stderr"),
        }
    }
}

/// A line of child output, without its line terminator
#[derive(Clone, Debug)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
    pub timestamp: i64,
}

/// Why a response was written
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResponseReason {
    Timer,
    /// Carries the phrase that matched
    Trigger(String),
}

/// Events emitted while a session runs
#[derive(Clone, Debug)]
pub enum AutopilotEvent {
    Output(OutputLine),
    Responded {
        reason: ResponseReason,
        timestamp: i64,
    },
    StateChanged(SessionState),
    /// Always the last event of a session
    Exited { exit_code: Option<i32> },
}

/// What happened during a session
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SessionSummary {
    /// None if the child was killed by a signal or never reaped
    pub exit_code: Option<i32>,
    pub timer_writes: usize,
    pub trigger_writes: usize,
}

struct Inner {
    state: SessionState,
    stdin: Option<ChildStdin>,
    summary: SessionSummary,
}

/// State shared by the session's tasks; `inner` is the single synchronization point.
struct Shared {
    inner: Mutex<Inner>,
    state_tx: watch::Sender<SessionState>,
    events: broadcast::Sender<AutopilotEvent>,
    response: String,
}

impl Shared {
    /// Write the response to the child's stdin if the session is running.
    async fn respond(&self, reason: ResponseReason) -> Result<(), AutopilotError> {
        let mut inner = self.inner.lock().await;
        if inner.state != SessionState::Running {
            return Err(AutopilotError::StreamClosed);
        }
        let stdin = inner.stdin.as_mut().ok_or(AutopilotError::StreamClosed)?;

        let write = async {
            stdin.write_all(self.response.as_bytes()).await?;
            stdin.flush().await
        };
        match timeout(WRITE_TIMEOUT, write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(AutopilotError::WriteFailed(e)),
            Err(_) => {
                return Err(AutopilotError::WriteFailed(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "child is not reading its input",
                )));
            }
        }

        match reason {
            ResponseReason::Timer => inner.summary.timer_writes += 1,
            ResponseReason::Trigger(_) => inner.summary.trigger_writes += 1,
        }
        drop(inner);

        debug!("Wrote response ({:?})", reason);
        let _ = self.events.send(AutopilotEvent::Responded {
            reason,
            timestamp: chrono::Utc::now().timestamp_millis(),
        });
        Ok(())
    }

    /// Leave `Running` and close the child's stdin. No-op unless running.
    async fn begin_stopping(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state != SessionState::Running {
            return;
        }
        inner.state = SessionState::Stopping;
        inner.stdin = None;
        drop(inner);
        self.publish_state(SessionState::Stopping);
    }

    async fn finish(&self, exit_code: Option<i32>) {
        let mut inner = self.inner.lock().await;
        inner.state = SessionState::Stopped;
        inner.stdin = None;
        inner.summary.exit_code = exit_code;
        drop(inner);
        self.publish_state(SessionState::Stopped);
        let _ = self.events.send(AutopilotEvent::Exited { exit_code });
    }

    fn publish_state(&self, state: SessionState) {
        debug!("Session state -> {}", state);
        self.state_tx.send_replace(state);
        let _ = self.events.send(AutopilotEvent::StateChanged(state));
    }
}

/// Handle to a running (or finished) session
#[derive(Clone)]
pub(crate) struct Session {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    state_rx: watch::Receiver<SessionState>,
    pid: Option<u32>,
    grace_period: Duration,
}

impl Session {
    /// Spawn `argv` with piped stdio and start the session's tasks.
    pub(crate) fn spawn(
        argv: &[String],
        config: &ResponderConfig,
        events: broadcast::Sender<AutopilotEvent>,
    ) -> Result<Self, AutopilotError> {
        let (program, args) = argv.split_first().ok_or(AutopilotError::EmptyCommand)?;

        info!("Spawning command: {} with args: {:?}", program, args);

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| {
                error!("Failed to spawn command '{}': {}", program, source);
                AutopilotError::Spawn {
                    command: argv.join(" "),
                    source,
                }
            })?;

        let pid = child.id();
        info!("Child process started with PID: {:?}", pid);

        let stdin = child.stdin.take().ok_or(AutopilotError::StreamClosed)?;
        let stdout = child.stdout.take().ok_or(AutopilotError::StreamClosed)?;
        let stderr = child.stderr.take().ok_or(AutopilotError::StreamClosed)?;

        let (state_tx, state_rx) = watch::channel(SessionState::Running);
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                state: SessionState::Running,
                stdin: Some(stdin),
                summary: SessionSummary::default(),
            }),
            state_tx,
            events,
            response: config.response.clone(),
        });
        let _ = shared
            .events
            .send(AutopilotEvent::StateChanged(SessionState::Running));

        let cancel = CancellationToken::new();
        let output_closed = CancellationToken::new();
        let abandon_output = CancellationToken::new();

        let mut readers = JoinSet::new();
        {
            let shared = shared.clone();
            let triggers = config.triggers.clone();
            let output_closed = output_closed.clone();
            let abandon_output = abandon_output.clone();
            readers.spawn(async move {
                scan_output(
                    &shared,
                    stdout,
                    OutputStream::Stdout,
                    Some(&triggers),
                    &output_closed,
                    &abandon_output,
                )
                .await;
                output_closed.cancel();
            });
        }
        {
            let shared = shared.clone();
            let triggers = config.scan_stderr.then(|| config.triggers.clone());
            let output_closed = output_closed.clone();
            let abandon_output = abandon_output.clone();
            readers.spawn(async move {
                scan_output(
                    &shared,
                    stderr,
                    OutputStream::Stderr,
                    triggers.as_ref(),
                    &output_closed,
                    &abandon_output,
                )
                .await;
            });
        }

        // A zero period would make tokio's interval panic; treat it as "no timer"
        let timer = config.interval.filter(|p| !p.is_zero()).map(|period| {
            let shared = shared.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                run_timer(&shared, period, &cancel).await;
            })
        });

        tokio::spawn(supervise(
            child,
            shared.clone(),
            SessionTasks {
                cancel: cancel.clone(),
                output_closed,
                abandon_output,
                readers,
                timer,
            },
            config.grace_period,
        ));

        Ok(Self {
            shared,
            cancel,
            state_rx,
            pid,
            grace_period: config.grace_period,
        })
    }

    pub(crate) fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    pub(crate) fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Stop the session and wait (bounded) for it to reach `Stopped`.
    pub(crate) async fn stop(&self) {
        if self.state() == SessionState::Stopped {
            return;
        }
        info!("Stopping session (PID: {:?})", self.pid);

        self.shared.begin_stopping().await;
        self.cancel.cancel();

        let bound = self.grace_period + STOP_SLACK;
        let mut state_rx = self.state_rx.clone();
        if timeout(bound, state_rx.wait_for(|s| *s == SessionState::Stopped))
            .await
            .is_err()
        {
            warn!("Session did not stop within {:?}", bound);
        }
    }

    /// Wait for the session to reach `Stopped`.
    pub(crate) async fn wait(&self) -> SessionSummary {
        let mut state_rx = self.state_rx.clone();
        // The sender lives in `shared`, which we hold, so this only returns once stopped
        let _ = state_rx.wait_for(|s| *s == SessionState::Stopped).await;
        self.summary().await
    }

    pub(crate) async fn summary(&self) -> SessionSummary {
        self.shared.inner.lock().await.summary
    }
}

/// Write the response every `period` until cancelled or a write fails.
async fn run_timer(shared: &Shared, period: Duration, cancel: &CancellationToken) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = shared.respond(ResponseReason::Timer).await {
                    if e.is_benign() {
                        debug!("Timer stopping: {}", e);
                    } else {
                        warn!("Timer stopping: {}", e);
                    }
                    break;
                }
            }
        }
    }
    debug!("Timer task exiting");
}

/// Read `reader` line by line, surfacing each line and answering trigger phrases.
///
/// Reads until end of stream, a read error, or `abandon`. A failed trigger
/// response fires `end_session` and turns off answering, but lines keep being
/// surfaced so whatever the child prints while shutting down is not lost.
async fn scan_output<R>(
    shared: &Shared,
    reader: R,
    stream: OutputStream,
    triggers: Option<&TriggerSet>,
    end_session: &CancellationToken,
    abandon: &CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(256);
    let mut triggers = triggers;

    loop {
        buf.clear();
        let read = tokio::select! {
            _ = abandon.cancelled() => break,
            read = reader.read_until(b'\n', &mut buf) => read,
        };

        match read {
            Ok(0) => {
                info!("Child {} closed", stream);
                break;
            }
            Ok(_) => {
                let text = decode_line(&buf);
                let phrase = triggers.and_then(|t| t.find(&text)).map(str::to_string);

                let _ = shared.events.send(AutopilotEvent::Output(OutputLine {
                    stream,
                    text,
                    timestamp: chrono::Utc::now().timestamp_millis(),
                }));

                if let Some(phrase) = phrase {
                    info!("Prompt matched {:?}, auto-responding", phrase);
                    if let Err(e) = shared.respond(ResponseReason::Trigger(phrase)).await {
                        if e.is_benign() {
                            debug!("Trigger response failed on {}: {}", stream, e);
                        } else {
                            warn!("Trigger response failed on {}: {}", stream, e);
                        }
                        triggers = None;
                        end_session.cancel();
                    }
                }
            }
            Err(e) => {
                warn!("Error reading child {}: {}", stream, e);
                break;
            }
        }
    }
    debug!("{} reader exiting", stream);
}

fn decode_line(buf: &[u8]) -> String {
    let mut end = buf.len();
    if end > 0 && buf[end - 1] == b'\n' {
        end -= 1;
        if end > 0 && buf[end - 1] == b'\r' {
            end -= 1;
        }
    }
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// Tokens and tasks the supervisor winds down once the child is gone.
struct SessionTasks {
    /// Stop requested; also stops the timer
    cancel: CancellationToken,
    /// Stdout ended or a trigger response failed
    output_closed: CancellationToken,
    /// Readers give up on pipes still held open by grandchildren
    abandon_output: CancellationToken,
    readers: JoinSet<()>,
    timer: Option<JoinHandle<()>>,
}

/// Owns the child: reaps it, or terminates it on request or when its output closes.
async fn supervise(mut child: Child, shared: Arc<Shared>, tasks: SessionTasks, grace: Duration) {
    let SessionTasks {
        cancel,
        output_closed,
        abandon_output,
        mut readers,
        timer,
    } = tasks;
    let mut exited_on_its_own = false;

    let status = tokio::select! {
        status = child.wait() => {
            exited_on_its_own = true;
            status.ok()
        }
        _ = cancel.cancelled() => terminate(&mut child, grace).await,
        _ = output_closed.cancelled() => {
            debug!("Child output closed, waiting up to {:?} for exit", grace);
            tokio::select! {
                status = timeout(grace, child.wait()) => match status {
                    Ok(status) => {
                        exited_on_its_own = true;
                        status.ok()
                    }
                    Err(_) => terminate(&mut child, grace).await,
                },
                _ = cancel.cancelled() => terminate(&mut child, grace).await,
            }
        }
    };
    info!("Child process exited with status: {:?}", status);

    shared.begin_stopping().await;
    cancel.cancel();
    if let Some(timer) = timer {
        log_join(timer.await);
    }

    // Let the readers drain what the child printed before exiting; a grandchild
    // holding a pipe open must not keep the session alive.
    let drain = if exited_on_its_own {
        grace
    } else {
        OUTPUT_DRAIN.min(grace)
    };
    let drained = timeout(drain, async {
        while let Some(result) = readers.join_next().await {
            log_join(result);
        }
    })
    .await;
    if drained.is_err() {
        debug!("Child output still open after exit, abandoning it");
        abandon_output.cancel();
        while let Some(result) = readers.join_next().await {
            log_join(result);
        }
    }

    shared.finish(status.and_then(|s| s.code())).await;
    info!("Session stopped");
}

fn log_join(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        if !e.is_cancelled() {
            error!("Session task failed: {}", e);
        }
    }
}

/// Ask the child to exit, killing it if it is still around after `grace`.
async fn terminate(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    if let Ok(Some(status)) = child.try_wait() {
        return Some(status);
    }

    request_termination(child);

    match timeout(grace, child.wait()).await {
        Ok(status) => status.ok(),
        Err(_) => {
            warn!("Child did not exit within {:?}, killing it", grace);
            if let Err(e) = child.kill().await {
                error!("Failed to kill child: {}", e);
            }
            child.wait().await.ok()
        }
    }
}

fn request_termination(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            debug!("Sending SIGTERM to PID {}", pid);
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                warn!("Failed to send SIGTERM to PID {}: {}", pid, e);
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = child.start_kill() {
            warn!("Failed to terminate child: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_strips_terminators() {
        assert_eq!(decode_line(b"Continue?\n"), "Continue?");
        assert_eq!(decode_line(b"Continue?\r\n"), "Continue?");
        assert_eq!(decode_line(b"no newline"), "no newline");
        assert_eq!(decode_line(b"\n"), "");
        assert_eq!(decode_line(b""), "");
    }

    #[test]
    fn decode_is_lossy() {
        assert_eq!(decode_line(b"ok \xff\n"), "ok \u{fffd}");
    }

    fn shared_without_stdin(state: SessionState) -> Shared {
        let (state_tx, _) = watch::channel(state);
        let (events, _) = broadcast::channel(16);
        Shared {
            inner: Mutex::new(Inner {
                state,
                stdin: None,
                summary: SessionSummary::default(),
            }),
            state_tx,
            events,
            response: "1\n".to_string(),
        }
    }

    #[tokio::test]
    async fn respond_refuses_unless_running() {
        for state in [SessionState::Stopping, SessionState::Stopped] {
            let shared = shared_without_stdin(state);
            let err = shared.respond(ResponseReason::Timer).await.unwrap_err();
            assert!(matches!(err, AutopilotError::StreamClosed));
        }
    }

    #[tokio::test]
    async fn respond_without_stdin_is_stream_closed() {
        let shared = shared_without_stdin(SessionState::Running);
        let err = shared
            .respond(ResponseReason::Trigger("press 1".to_string()))
            .await
            .unwrap_err();
        assert!(err.is_benign());
        assert_eq!(shared.inner.lock().await.summary.trigger_writes, 0);
    }

    #[tokio::test]
    async fn begin_stopping_only_from_running() {
        let shared = shared_without_stdin(SessionState::Running);
        let mut events = shared.events.subscribe();

        shared.begin_stopping().await;
        shared.begin_stopping().await;

        assert_eq!(*shared.state_tx.borrow(), SessionState::Stopping);
        assert!(matches!(
            events.try_recv(),
            Ok(AutopilotEvent::StateChanged(SessionState::Stopping))
        ));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn cancelled_timer_never_writes() {
        let shared = shared_without_stdin(SessionState::Running);
        let cancel = CancellationToken::new();
        cancel.cancel();

        run_timer(&shared, Duration::from_millis(10), &cancel).await;

        assert_eq!(shared.inner.lock().await.summary.timer_writes, 0);
    }

    #[tokio::test]
    async fn failed_response_ends_session_but_keeps_reading() {
        // No stdin: the trigger response fails
        let shared = shared_without_stdin(SessionState::Running);
        let mut events = shared.events.subscribe();
        let triggers = TriggerSet::default();
        let end_session = CancellationToken::new();
        let abandon = CancellationToken::new();

        let input: &[u8] = b"hello\r\nPress 1 to go\nContinue?\nbye\n";
        scan_output(
            &shared,
            input,
            OutputStream::Stdout,
            Some(&triggers),
            &end_session,
            &abandon,
        )
        .await;

        assert!(end_session.is_cancelled());
        let mut lines = Vec::new();
        let mut last_timestamp = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                AutopilotEvent::Output(line) => {
                    assert_eq!(line.stream, OutputStream::Stdout);
                    assert!(line.timestamp >= last_timestamp);
                    last_timestamp = line.timestamp;
                    lines.push(line.text);
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
        assert_eq!(lines, vec!["hello", "Press 1 to go", "Continue?", "bye"]);
        assert!(last_timestamp > 0);
    }

    #[tokio::test]
    async fn scan_output_without_triggers_reads_to_end() {
        let shared = shared_without_stdin(SessionState::Running);
        let mut events = shared.events.subscribe();
        let end_session = CancellationToken::new();
        let abandon = CancellationToken::new();

        let input: &[u8] = b"Continue?\nlast line without newline";
        scan_output(
            &shared,
            input,
            OutputStream::Stderr,
            None,
            &end_session,
            &abandon,
        )
        .await;

        assert!(!end_session.is_cancelled());
        let mut lines = Vec::new();
        while let Ok(event) = events.try_recv() {
            match event {
                AutopilotEvent::Output(line) => lines.push(line.text),
                other => panic!("unexpected event: {:?}", other),
            }
        }
        assert_eq!(lines, vec!["Continue?", "last line without newline"]);
    }

    #[tokio::test]
    async fn abandoned_reader_returns_with_pipe_still_open() {
        let shared = shared_without_stdin(SessionState::Running);
        let end_session = CancellationToken::new();
        let abandon = CancellationToken::new();
        // Writer half stays alive, so the reader never sees end of stream
        let (_writer, reader) = tokio::io::duplex(64);

        abandon.cancel();
        timeout(
            Duration::from_secs(1),
            scan_output(
                &shared,
                reader,
                OutputStream::Stdout,
                None,
                &end_session,
                &abandon,
            ),
        )
        .await
        .unwrap();
    }
}

//! Interactive Magik session engine.
//!
//! A [`MagikSession`] owns one REPL process. A dedicated reader thread
//! reassembles its stdout into lines and correlates them with the single
//! in-flight [`Execution`]: every line up to the next `Magik>` prompt belongs
//! to the command that was submitted last. Lines that arrive while nothing is
//! in flight (the startup banner, for instance) are published as
//! [`SessionEvent::Output`].
//!
//! The global-creation prompt suspends the reader thread until the
//! collaborator answers the [`ConfirmationRequest`]; unread process output
//! stays in the pipe meanwhile.

use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::Child;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::SessionError;
use crate::lines::LineAssembler;
use crate::patterns::confirmation_question;
use crate::style::style_line;
use crate::transport::{self, ProcessCommand};

const SECTION_BUFFER_FILE: &str = "sessionBuffer.magik";
const KILL_QUESTION: &str = "Are you sure you want to stop the Magik session?";
const CONFIRMATION_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Leading token of the REPL prompt.
    pub prompt: String,
    /// Appended to every command and confirmation answer.
    pub line_terminator: String,
    pub interrupt_token: String,
    pub affirmative: String,
    pub negative: String,
    /// Trimmed lines that are never shown to the user.
    pub housekeeping_lines: Vec<String>,
    pub housekeeping_prefixes: Vec<String>,
    /// Whether output lines get ANSI highlighting.
    pub styled: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            prompt: "Magik>".to_string(),
            line_terminator: "\r\n".to_string(),
            interrupt_token: "\x03".to_string(),
            affirmative: "y".to_string(),
            negative: "n".to_string(),
            housekeeping_lines: vec!["Magik>".to_string(), ".".to_string(), "True 0".to_string()],
            housekeeping_prefixes: vec!["Loading ".to_string()],
            styled: true,
        }
    }
}

impl SessionConfig {
    pub fn is_prompt(&self, line: &str) -> bool {
        line.trim_start().starts_with(&self.prompt)
    }

    pub fn is_housekeeping(&self, line: &str) -> bool {
        let trimmed = line.trim();
        self.housekeeping_lines.iter().any(|l| l == trimmed)
            || self
                .housekeeping_prefixes
                .iter()
                .any(|p| trimmed.starts_with(p.as_str()))
    }

    fn render(&self, line: &str) -> String {
        if self.styled {
            style_line(line)
        } else {
            line.to_string()
        }
    }
}

/// Receives the output of one command, line by line.
///
/// Sinks run on the reader thread while the session state is locked, so they
/// must not call back into the session.
pub trait OutputSink: Send {
    fn append_line(&mut self, line: &str);
}

impl OutputSink for Sender<String> {
    fn append_line(&mut self, line: &str) {
        let _ = self.send(line.to_string());
    }
}

impl OutputSink for Arc<Mutex<Vec<String>>> {
    fn append_line(&mut self, line: &str) {
        if let Ok(mut lines) = self.lock() {
            lines.push(line.to_string());
        }
    }
}

struct NullSink;

impl OutputSink for NullSink {
    fn append_line(&mut self, _line: &str) {}
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionOutcome {
    pub id: u64,
    pub command: String,
    pub elapsed_ms: u64,
    /// Raw output lines, housekeeping removed, before styling.
    pub lines: Vec<String>,
    pub cancelled: bool,
}

/// One submitted command, open until the next prompt boundary.
struct Execution {
    id: u64,
    command: String,
    started: Instant,
    sink: Box<dyn OutputSink>,
    suppress_output: bool,
    cancelled: Arc<AtomicBool>,
    lines: Vec<String>,
    done: Sender<Result<ExecutionOutcome, SessionError>>,
}

impl Execution {
    fn deliver(&mut self, line: &str, config: &SessionConfig) {
        self.lines.push(line.to_string());
        if !self.suppress_output {
            self.sink.append_line(&config.render(line));
        }
    }

    fn complete(mut self) {
        if !self.suppress_output {
            self.sink.append_line("\n");
        }
        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        tracing::debug!(id = self.id, elapsed_ms, "execution finished");
        let outcome = ExecutionOutcome {
            id: self.id,
            command: self.command,
            elapsed_ms,
            lines: self.lines,
            cancelled: self.cancelled.load(Ordering::Relaxed),
        };
        let _ = self.done.send(Ok(outcome));
    }

    fn abort(self, error: SessionError) {
        tracing::warn!(id = self.id, command = %self.command, "execution aborted: {error}");
        let _ = self.done.send(Err(error));
    }
}

enum SessionState {
    Idle,
    Busy(Execution),
    AwaitingConfirmation(Option<Execution>),
    Killed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Idle,
    Busy,
    AwaitingConfirmation,
    Killed,
}

/// Pending yes/no question from the session. The reader thread stays
/// suspended until [`ConfirmationRequest::answer`] is called.
#[derive(Debug)]
pub struct ConfirmationRequest {
    question: String,
    reply: Sender<bool>,
}

impl ConfirmationRequest {
    pub fn question(&self) -> &str {
        &self.question
    }

    pub fn answer(self, yes: bool) {
        let _ = self.reply.send(yes);
    }
}

#[derive(Debug)]
pub enum SessionEvent {
    /// Output that arrived while no command was in flight.
    Output(String),
    Stderr(String),
    Confirmation(ConfirmationRequest),
    Notice(String),
    /// The process is gone; no further events follow.
    Exited,
}

struct Shared {
    config: SessionConfig,
    writer: Mutex<Box<dyn Write + Send>>,
    state: Mutex<SessionState>,
    alive: AtomicBool,
    /// Set by kill and drop; releases a reader parked on a confirmation.
    shutdown: AtomicBool,
    ready: Mutex<bool>,
    ready_signal: Condvar,
    next_id: AtomicU64,
    events: Sender<SessionEvent>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn write_raw(&self, text: &str) -> Result<(), SessionError> {
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        writer.write_all(text.as_bytes())?;
        writer.flush()?;
        Ok(())
    }

    fn write_line(&self, text: &str) -> Result<(), SessionError> {
        self.write_raw(&format!("{text}{}", self.config.line_terminator))
    }

    fn publish(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn mark_ready(&self) {
        let mut ready = self.ready.lock().unwrap_or_else(|e| e.into_inner());
        if !*ready {
            *ready = true;
            tracing::info!("session reached its first prompt");
            self.ready_signal.notify_all();
        }
    }

    fn process_line(&self, line: &str) {
        if let Some(question) = confirmation_question(line) {
            self.await_confirmation(question);
            return;
        }
        if self.config.is_prompt(line) {
            self.mark_ready();
            self.finish_execution();
            return;
        }
        if self.config.is_housekeeping(line) {
            return;
        }

        let mut state = self.state();
        if let SessionState::Busy(execution) = &mut *state {
            execution.deliver(line, &self.config);
            return;
        }
        drop(state);
        self.publish(SessionEvent::Output(self.config.render(line)));
    }

    fn finish_execution(&self) {
        let mut state = self.state();
        match std::mem::replace(&mut *state, SessionState::Idle) {
            SessionState::Busy(execution) => {
                drop(state);
                execution.complete();
            }
            SessionState::Idle => tracing::trace!("prompt while idle"),
            other => *state = other,
        }
    }

    fn await_confirmation(&self, question: &str) {
        let (tx, rx) = mpsc::channel();
        {
            let mut state = self.state();
            let suspended = match std::mem::replace(&mut *state, SessionState::Idle) {
                SessionState::Busy(execution) => SessionState::AwaitingConfirmation(Some(execution)),
                SessionState::Idle => SessionState::AwaitingConfirmation(None),
                other => other,
            };
            *state = suspended;
        }

        tracing::info!(question, "waiting for confirmation");
        self.publish(SessionEvent::Confirmation(ConfirmationRequest {
            question: question.to_string(),
            reply: tx,
        }));

        match self.wait_for_answer(&rx) {
            Some(yes) => {
                let token = if yes {
                    &self.config.affirmative
                } else {
                    &self.config.negative
                };
                if let Err(e) = self.write_line(token) {
                    tracing::warn!(error = %e, "failed to answer confirmation");
                }
            }
            None => tracing::warn!(question, "confirmation left without an answer"),
        }

        let mut state = self.state();
        let resumed = match std::mem::replace(&mut *state, SessionState::Idle) {
            SessionState::AwaitingConfirmation(Some(execution)) => SessionState::Busy(execution),
            SessionState::AwaitingConfirmation(None) => SessionState::Idle,
            other => other,
        };
        *state = resumed;
    }

    /// `None` when the request was dropped or the session is shutting down.
    fn wait_for_answer(&self, rx: &Receiver<bool>) -> Option<bool> {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return None;
            }
            match rx.recv_timeout(CONFIRMATION_POLL) {
                Ok(yes) => return Some(yes),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    fn mark_exited(&self) {
        self.alive.store(false, Ordering::SeqCst);
        let previous = std::mem::replace(&mut *self.state(), SessionState::Killed);
        match previous {
            SessionState::Busy(execution)
            | SessionState::AwaitingConfirmation(Some(execution)) => {
                execution.abort(SessionError::NotActive)
            }
            _ => {}
        }
        let _ready = self.ready.lock().unwrap_or_else(|e| e.into_inner());
        self.ready_signal.notify_all();
    }
}

/// Handle to a submitted command.
pub struct ExecutionHandle {
    id: u64,
    rx: Receiver<Result<ExecutionOutcome, SessionError>>,
    cancelled: Arc<AtomicBool>,
    shared: Arc<Shared>,
}

impl ExecutionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Blocks until the prompt boundary, or fails if the process exits first.
    pub fn wait(self) -> Result<ExecutionOutcome, SessionError> {
        self.rx.recv().map_err(|_| SessionError::NotActive)?
    }

    /// Returns `None` while the command is still running.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<ExecutionOutcome, SessionError>> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(SessionError::NotActive)),
        }
    }

    /// Sends the interrupt token if this execution is still in flight and
    /// returns whether it did. The execution still ends at the next prompt
    /// the process prints.
    pub fn cancel(&self) -> Result<bool, SessionError> {
        if !self.shared.alive.load(Ordering::SeqCst) {
            return Err(SessionError::NotActive);
        }
        let state = self.shared.state();
        let in_flight = match &*state {
            SessionState::Busy(execution)
            | SessionState::AwaitingConfirmation(Some(execution)) => execution.id == self.id,
            _ => false,
        };
        if !in_flight {
            tracing::debug!(id = self.id, "cancel ignored: execution already finished");
            return Ok(false);
        }
        self.cancelled.store(true, Ordering::Relaxed);
        tracing::info!(id = self.id, "interrupting execution");
        // Held across the one-byte write so the token cannot reach a later command.
        self.shared.write_raw(&self.shared.config.interrupt_token)?;
        drop(state);
        Ok(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KillOutcome {
    Killed,
    Declined,
    NotRunning,
}

pub struct MagikSession {
    shared: Arc<Shared>,
    child: Mutex<Option<Child>>,
    events: Receiver<SessionEvent>,
    reader: Option<JoinHandle<()>>,
    stderr_reader: Option<JoinHandle<()>>,
}

impl MagikSession {
    /// Starts the REPL process and its reader threads.
    pub fn spawn(command: &ProcessCommand, config: SessionConfig) -> anyhow::Result<Self> {
        let process = transport::spawn_process(command)?;
        let mut session = Self::from_streams(process.stdout, process.stdin, config);

        let events = session.shared.events.clone();
        session.stderr_reader = Some(transport::drain_lines(process.stderr, move |line| {
            let _ = events.send(SessionEvent::Stderr(line));
        }));
        *session.child.lock().unwrap_or_else(|e| e.into_inner()) = Some(process.child);
        Ok(session)
    }

    /// Runs the engine over arbitrary streams instead of a child process.
    pub fn from_streams<R, W>(reader: R, writer: W, config: SessionConfig) -> Self
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let shared = Arc::new(Shared {
            config,
            writer: Mutex::new(Box::new(writer)),
            state: Mutex::new(SessionState::Idle),
            alive: AtomicBool::new(true),
            shutdown: AtomicBool::new(false),
            ready: Mutex::new(false),
            ready_signal: Condvar::new(),
            next_id: AtomicU64::new(1),
            events: tx,
        });

        let reader_shared = Arc::clone(&shared);
        let reader = std::thread::spawn(move || run_reader(reader_shared, reader));

        Self {
            shared,
            child: Mutex::new(None),
            events: rx,
            reader: Some(reader),
            stderr_reader: None,
        }
    }

    pub fn events(&self) -> &Receiver<SessionEvent> {
        &self.events
    }

    pub fn is_active(&self) -> bool {
        self.shared.alive.load(Ordering::SeqCst)
    }

    pub fn phase(&self) -> SessionPhase {
        match &*self.shared.state() {
            SessionState::Idle => SessionPhase::Idle,
            SessionState::Busy(_) => SessionPhase::Busy,
            SessionState::AwaitingConfirmation(_) => SessionPhase::AwaitingConfirmation,
            SessionState::Killed => SessionPhase::Killed,
        }
    }

    /// Waits until the first prompt has been seen. Returns `false` on timeout
    /// or if the process died first.
    pub fn wait_ready(&self, timeout: Duration) -> bool {
        let ready = self.shared.ready.lock().unwrap_or_else(|e| e.into_inner());
        let (ready, _) = self
            .shared
            .ready_signal
            .wait_timeout_while(ready, timeout, |ready| !*ready && self.is_active())
            .unwrap_or_else(|e| e.into_inner());
        *ready
    }

    /// Submits a command. Fails with [`SessionError::Busy`] while another
    /// command is in flight; callers await the previous handle first.
    pub fn send(
        &self,
        command: &str,
        sink: Box<dyn OutputSink>,
    ) -> Result<ExecutionHandle, SessionError> {
        self.submit(command, sink, false)
    }

    /// Runs a housekeeping command whose output never reaches a sink.
    pub fn send_quiet(&self, command: &str) -> Result<ExecutionHandle, SessionError> {
        self.submit(command, Box::new(NullSink), true)
    }

    /// Writes `text` to a scratch file and loads it into the session.
    pub fn send_section(
        &self,
        text: &str,
        sink: Box<dyn OutputSink>,
    ) -> Result<ExecutionHandle, SessionError> {
        let path = section_buffer_path();
        std::fs::write(&path, text)?;
        self.send(&format!("load_file(\"{}\")", path.display()), sink)
    }

    pub fn ping(&self) -> Result<ExecutionHandle, SessionError> {
        self.send_quiet("write(\"Pinging...\")")
    }

    fn submit(
        &self,
        command: &str,
        sink: Box<dyn OutputSink>,
        suppress_output: bool,
    ) -> Result<ExecutionHandle, SessionError> {
        if !self.is_active() {
            return Err(SessionError::NotActive);
        }

        let mut state = self.shared.state();
        match &*state {
            SessionState::Idle => {}
            SessionState::Killed => return Err(SessionError::NotActive),
            SessionState::Busy(_) | SessionState::AwaitingConfirmation(_) => {
                tracing::warn!(command, "rejected: another command is in flight");
                return Err(SessionError::Busy);
            }
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel();
        let cancelled = Arc::new(AtomicBool::new(false));

        // Installed before the write so the reader never sees this command's
        // prompt without an execution, and never waits on the state lock
        // while stdin is full.
        *state = SessionState::Busy(Execution {
            id,
            command: command.to_string(),
            started: Instant::now(),
            sink,
            suppress_output,
            cancelled: Arc::clone(&cancelled),
            lines: Vec::new(),
            done: tx,
        });
        drop(state);

        if let Err(e) = self.shared.write_line(command) {
            let mut state = self.shared.state();
            if matches!(&*state, SessionState::Busy(execution) if execution.id == id) {
                *state = SessionState::Idle;
            }
            tracing::warn!(id, command, error = %e, "command could not be written");
            return Err(e);
        }
        tracing::debug!(id, command, "command submitted");

        Ok(ExecutionHandle {
            id,
            rx,
            cancelled,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Stops the process after `confirm` agrees.
    pub fn kill(&self, confirm: impl FnOnce(&str) -> bool) -> Result<KillOutcome, SessionError> {
        if !self.is_active() {
            self.shared.publish(SessionEvent::Notice(
                "The Magik session is not running".to_string(),
            ));
            return Ok(KillOutcome::NotRunning);
        }
        if !confirm(KILL_QUESTION) {
            return Ok(KillOutcome::Declined);
        }

        tracing::info!("stopping session");
        self.shared.shutdown.store(true, Ordering::SeqCst);
        // Closing stdin is enough for stream-backed sessions to reach EOF.
        *self.shared.writer.lock().unwrap_or_else(|e| e.into_inner()) =
            Box::new(std::io::sink());
        if let Some(child) = self.child.lock().unwrap_or_else(|e| e.into_inner()).as_mut() {
            transport::terminate(child);
        }
        self.shared.mark_exited();
        Ok(KillOutcome::Killed)
    }
}

impl Drop for MagikSession {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        if let Some(child) = self.child.get_mut().unwrap_or_else(|e| e.into_inner()).as_mut() {
            transport::terminate(child);
            while self.events.try_recv().is_ok() {}
            if let Some(reader) = self.reader.take() {
                let _ = reader.join();
            }
            if let Some(reader) = self.stderr_reader.take() {
                let _ = reader.join();
            }
        }
    }
}

pub fn section_buffer_path() -> PathBuf {
    std::env::temp_dir().join(SECTION_BUFFER_FILE)
}

fn run_reader<R: Read>(shared: Arc<Shared>, mut reader: R) {
    let mut assembler = LineAssembler::new();
    let mut buf = [0u8; 4096];

    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::warn!(error = %e, "session output stream failed");
                break;
            }
        };

        for line in assembler.push(&buf[..n]) {
            shared.process_line(&line);
        }
        // Prompts are printed without a terminator.
        let config = &shared.config;
        if let Some(line) = assembler
            .take_partial_if(|p| config.is_prompt(p) || confirmation_question(p).is_some())
        {
            shared.process_line(&line);
        }
    }

    if let Some(rest) = assembler.finish() {
        shared.process_line(&rest);
    }
    tracing::info!("session process exited");
    shared.mark_exited();
    shared.publish(SessionEvent::Exited);
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Reader fed chunk by chunk from the test; dropping the sender is EOF.
    struct ChunkReader {
        rx: Receiver<Vec<u8>>,
        pending: Vec<u8>,
    }

    impl Read for ChunkReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pending.is_empty() {
                match self.rx.recv() {
                    Ok(chunk) => self.pending = chunk,
                    Err(_) => return Ok(0),
                }
            }
            let n = buf.len().min(self.pending.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            Ok(n)
        }
    }

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl SharedBuf {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn fake_session() -> (MagikSession, Sender<Vec<u8>>, SharedBuf) {
        let (tx, rx) = mpsc::channel();
        let input = SharedBuf::default();
        let session = MagikSession::from_streams(
            ChunkReader {
                rx,
                pending: Vec::new(),
            },
            input.clone(),
            SessionConfig::default(),
        );
        (session, tx, input)
    }

    fn collector() -> (Arc<Mutex<Vec<String>>>, Box<dyn OutputSink>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        (Arc::clone(&lines), Box::new(lines))
    }

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn command_resolves_at_prompt_boundary() -> anyhow::Result<()> {
        let (session, out, input) = fake_session();
        out.send(b"Magik> ".to_vec())?;
        assert!(session.wait_ready(WAIT));

        let (lines, sink) = collector();
        let handle = session.send("1+1", sink)?;
        assert_eq!(session.phase(), SessionPhase::Busy);
        assert_eq!(input.text(), "1+1\r\n");

        out.send(b"2\r\nMag".to_vec())?;
        out.send(b"ik> ".to_vec())?;
        let outcome = handle.wait()?;

        assert_eq!(*lines.lock().unwrap(), vec!["2".to_string(), "\n".to_string()]);
        assert_eq!(outcome.lines, vec!["2".to_string()]);
        assert!(!outcome.cancelled);
        assert_eq!(session.phase(), SessionPhase::Idle);
        Ok(())
    }

    #[test]
    fn banner_before_first_prompt_is_published() -> anyhow::Result<()> {
        let (session, out, _input) = fake_session();
        out.send(b"Smallworld Core\r\nMagik> ".to_vec())?;
        assert!(session.wait_ready(WAIT));
        match session.events().recv_timeout(WAIT)? {
            SessionEvent::Output(line) => assert_eq!(line, "Smallworld Core"),
            other => panic!("unexpected event {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn housekeeping_lines_are_filtered() -> anyhow::Result<()> {
        let (session, out, _input) = fake_session();
        out.send(b"Magik> ".to_vec())?;
        assert!(session.wait_ready(WAIT));

        let (lines, sink) = collector();
        let handle = session.send_section("write(1)", sink)?;
        out.send(b"Loading C:\\tmp\\sessionBuffer.magik\r\n1\r\nTrue 0\r\n.\r\nMagik> ".to_vec())?;
        let outcome = handle.wait()?;
        assert_eq!(outcome.lines, vec!["1".to_string()]);
        assert_eq!(*lines.lock().unwrap(), vec!["1".to_string(), "\n".to_string()]);
        assert_eq!(std::fs::read_to_string(section_buffer_path())?, "write(1)");
        Ok(())
    }

    #[test]
    fn second_send_while_busy_is_rejected() -> anyhow::Result<()> {
        let (session, out, input) = fake_session();
        out.send(b"Magik> ".to_vec())?;
        assert!(session.wait_ready(WAIT));

        let (_lines, sink) = collector();
        let handle = session.send("a", sink)?;
        let (_other, sink) = collector();
        let err = session.send("b", sink).err().expect("busy");
        assert!(matches!(err, SessionError::Busy));
        assert_eq!(input.text(), "a\r\n");

        out.send(b"Magik> ".to_vec())?;
        handle.wait()?;
        Ok(())
    }

    #[test]
    fn confirmation_suspends_without_ending_execution() -> anyhow::Result<()> {
        let (session, out, input) = fake_session();
        out.send(b"Magik> ".to_vec())?;
        assert!(session.wait_ready(WAIT));

        let (lines, sink) = collector();
        let handle = session.send("foo << 1", sink)?;
        out.send(b"Global !foo! does not exist: create it? (Y)".to_vec())?;

        let request = match session.events().recv_timeout(WAIT)? {
            SessionEvent::Confirmation(request) => request,
            other => panic!("unexpected event {other:?}"),
        };
        assert_eq!(request.question(), "Global !foo! does not exist: create it?");
        assert_eq!(session.phase(), SessionPhase::AwaitingConfirmation);
        assert!(handle.wait_timeout(Duration::from_millis(50)).is_none());

        let (_other, busy_sink) = collector();
        assert!(matches!(
            session.send("x", busy_sink).err(),
            Some(SessionError::Busy)
        ));

        request.answer(false);
        out.send(b"1\r\nMagik> ".to_vec())?;
        let outcome = handle.wait()?;

        assert_eq!(input.text(), "foo << 1\r\nn\r\n");
        assert_eq!(outcome.lines, vec!["1".to_string()]);
        assert_eq!(*lines.lock().unwrap(), vec!["1".to_string(), "\n".to_string()]);
        Ok(())
    }

    #[test]
    fn quiet_commands_do_not_reach_the_sink() -> anyhow::Result<()> {
        let (session, out, input) = fake_session();
        out.send(b"Magik> ".to_vec())?;
        assert!(session.wait_ready(WAIT));

        let handle = session.ping()?;
        out.send(b"Pinging...\r\nMagik> ".to_vec())?;
        let outcome = handle.wait()?;
        assert_eq!(outcome.lines, vec!["Pinging...".to_string()]);
        assert_eq!(input.text(), "write(\"Pinging...\")\r\n");
        assert!(session.events().try_recv().is_err());
        Ok(())
    }

    #[test]
    fn cancel_writes_interrupt_and_settles_at_prompt() -> anyhow::Result<()> {
        let (session, out, input) = fake_session();
        out.send(b"Magik> ".to_vec())?;
        assert!(session.wait_ready(WAIT));

        let (_lines, sink) = collector();
        let handle = session.send("_loop _endloop", sink)?;
        assert!(handle.cancel()?);
        assert_eq!(input.text(), "_loop _endloop\r\n\x03");

        out.send(b"**** Error: interrupted\r\nMagik> ".to_vec())?;
        let outcome = handle.wait()?;
        assert!(outcome.cancelled);
        Ok(())
    }

    #[test]
    fn finished_handle_does_not_interrupt_the_next_command() -> anyhow::Result<()> {
        let (session, out, input) = fake_session();
        out.send(b"Magik> ".to_vec())?;
        assert!(session.wait_ready(WAIT));

        let (_lines, sink) = collector();
        let first = session.send("a", sink)?;
        out.send(b"Magik> ".to_vec())?;
        assert!(first.wait_timeout(WAIT).is_some());

        let (_lines, sink) = collector();
        let second = session.send("b", sink)?;
        assert!(!first.cancel()?);
        assert_eq!(input.text(), "a\r\nb\r\n");

        out.send(b"Magik> ".to_vec())?;
        assert!(!second.wait()?.cancelled);
        Ok(())
    }

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::ErrorKind::BrokenPipe.into())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn failed_write_leaves_session_idle() -> anyhow::Result<()> {
        let (tx, rx) = mpsc::channel();
        let session = MagikSession::from_streams(
            ChunkReader {
                rx,
                pending: Vec::new(),
            },
            BrokenPipe,
            SessionConfig::default(),
        );
        tx.send(b"Magik> ".to_vec())?;
        assert!(session.wait_ready(WAIT));

        let (_lines, sink) = collector();
        assert!(matches!(session.send("a", sink).err(), Some(SessionError::Io(_))));
        assert_eq!(session.phase(), SessionPhase::Idle);

        tx.send(b"late banner\r\n".to_vec())?;
        match session.events().recv_timeout(WAIT)? {
            SessionEvent::Output(line) => assert_eq!(line, "late banner"),
            other => panic!("unexpected event {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn confirmation_while_idle_is_answered_and_returns_to_idle() -> anyhow::Result<()> {
        let (session, out, input) = fake_session();
        out.send(b"Magik> ".to_vec())?;
        assert!(session.wait_ready(WAIT));

        out.send(b"Global !bar! does not exist: create it? (Y)".to_vec())?;
        let request = match session.events().recv_timeout(WAIT)? {
            SessionEvent::Confirmation(request) => request,
            other => panic!("unexpected event {other:?}"),
        };
        assert_eq!(session.phase(), SessionPhase::AwaitingConfirmation);

        let (_lines, sink) = collector();
        assert!(matches!(
            session.send("x", sink).err(),
            Some(SessionError::Busy)
        ));

        request.answer(true);
        let deadline = Instant::now() + WAIT;
        while session.phase() != SessionPhase::Idle && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(session.phase(), SessionPhase::Idle);
        assert_eq!(input.text(), "y\r\n");
        Ok(())
    }

    #[test]
    fn process_exit_fails_pending_execution() -> anyhow::Result<()> {
        let (session, out, _input) = fake_session();
        out.send(b"Magik> ".to_vec())?;
        assert!(session.wait_ready(WAIT));

        let (_lines, sink) = collector();
        let handle = session.send("quit()", sink)?;
        drop(out);

        assert!(matches!(handle.wait(), Err(SessionError::NotActive)));
        assert!(!session.is_active());
        assert_eq!(session.phase(), SessionPhase::Killed);

        let (_lines, sink) = collector();
        assert!(matches!(
            session.send("1", sink).err(),
            Some(SessionError::NotActive)
        ));
        Ok(())
    }

    #[test]
    fn kill_requires_confirmation() -> anyhow::Result<()> {
        let (session, out, _input) = fake_session();
        out.send(b"Magik> ".to_vec())?;
        assert!(session.wait_ready(WAIT));

        assert_eq!(session.kill(|_| false)?, KillOutcome::Declined);
        assert!(session.is_active());

        let mut asked = String::new();
        let outcome = session.kill(|q| {
            asked = q.to_string();
            true
        })?;
        assert_eq!(outcome, KillOutcome::Killed);
        assert_eq!(asked, KILL_QUESTION);
        assert!(!session.is_active());

        assert_eq!(session.kill(|_| true)?, KillOutcome::NotRunning);
        let notice = std::iter::from_fn(|| session.events().try_recv().ok())
            .any(|e| matches!(e, SessionEvent::Notice(_)));
        assert!(notice);
        Ok(())
    }

    #[test]
    fn error_lines_are_styled_for_the_sink_only() -> anyhow::Result<()> {
        let (session, out, _input) = fake_session();
        out.send(b"Magik> ".to_vec())?;
        assert!(session.wait_ready(WAIT));

        let (lines, sink) = collector();
        let handle = session.send("x.y", sink)?;
        out.send(b"**** Error: oops\r\nMagik> ".to_vec())?;
        let outcome = handle.wait()?;
        assert_eq!(outcome.lines, vec!["**** Error: oops".to_string()]);
        assert_eq!(lines.lock().unwrap()[0], style_line("**** Error: oops"));
        Ok(())
    }
}

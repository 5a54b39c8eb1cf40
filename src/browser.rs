//! Class browser engine over the method finder process.
//!
//! Queries go out as one write of newline-separated directives (see
//! [`SearchParameters::encode`]). Output comes back as an unframed stream in
//! which an info line (`*** ...`) opens a new result set, header lines start
//! records, `##` and argument lines refine the latest record, and a bare
//! count closes the set.

use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::process::Child;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use crate::error::SessionError;
use crate::lines::LineAssembler;
use crate::method::MethodRecord;
use crate::patterns::{BrowserLine, RESOURCE, classify_browser_line};
use crate::query::{DEFAULT_MAX_RESULTS, SearchParameters};
use crate::transport::{self, ProcessCommand};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    /// Package assumed for headers that omit one.
    pub default_package: String,
    /// Result cutoff for queries that do not set their own.
    pub max_results: NonZeroU32,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            default_package: "sw".to_string(),
            max_results: DEFAULT_MAX_RESULTS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    pub path: PathBuf,
    pub method: String,
    pub class: String,
    pub package: String,
}

impl SourceLocation {
    pub fn parse(line: &str, default_package: &str) -> Result<Self, SessionError> {
        let c = RESOURCE
            .captures(line)
            .ok_or_else(|| SessionError::desync("source location", line))?;
        let field = |name: &str| c.name(name).map(|m| m.as_str().to_string());
        Ok(Self {
            path: PathBuf::from(field("path").unwrap_or_default()),
            method: field("method").unwrap_or_default(),
            class: field("class").unwrap_or_default(),
            package: field("package").unwrap_or_else(|| default_package.to_string()),
        })
    }
}

#[derive(Debug, Clone)]
pub enum BrowserEvent {
    /// A new result set is starting; drop what is on screen.
    Reset,
    Results {
        records: Vec<MethodRecord>,
        total: u64,
    },
    Definition(SourceLocation),
    Notice(String),
    Stderr(String),
    Exited,
}

/// Line-at-a-time parser holding the current result buffer.
#[derive(Debug, Default)]
pub struct BrowserParser {
    records: Vec<MethodRecord>,
    show_args: bool,
    default_package: String,
}

impl BrowserParser {
    pub fn new(default_package: impl Into<String>) -> Self {
        Self {
            records: Vec::new(),
            show_args: false,
            default_package: default_package.into(),
        }
    }

    pub fn set_show_args(&mut self, show_args: bool) {
        self.show_args = show_args;
    }

    pub fn records(&self) -> &[MethodRecord] {
        &self.records
    }

    /// Consumes one line and returns the event it produces, if any. Faults
    /// leave the buffer as it was and are returned as errors; the caller keeps
    /// feeding subsequent lines.
    pub fn consume(&mut self, line: &str) -> Result<Option<BrowserEvent>, SessionError> {
        match classify_browser_line(line) {
            BrowserLine::Resource(raw) => {
                let location = SourceLocation::parse(raw, &self.default_package)?;
                Ok(Some(BrowserEvent::Definition(location)))
            }
            BrowserLine::Topic(_) | BrowserLine::Blank => Ok(None),
            BrowserLine::Header(raw) => {
                let record = MethodRecord::parse_header(raw, &self.default_package)?;
                self.records.push(record);
                Ok(None)
            }
            BrowserLine::Comment(raw) => {
                if let Some(last) = self.records.last_mut() {
                    last.append_comment(raw, self.show_args);
                }
                Ok(None)
            }
            BrowserLine::Arguments(raw) => {
                if let Some(last) = self.records.last_mut() {
                    last.set_arguments(raw)?;
                }
                Ok(None)
            }
            BrowserLine::Info(_) => {
                self.records.clear();
                Ok(Some(BrowserEvent::Reset))
            }
            BrowserLine::Total(total) => Ok(Some(BrowserEvent::Results {
                records: self.records.clone(),
                total,
            })),
        }
    }
}

struct Shared {
    writer: Mutex<Box<dyn Write + Send>>,
    parser: Mutex<BrowserParser>,
    alive: AtomicBool,
    events: Sender<BrowserEvent>,
}

impl Shared {
    fn parser(&self) -> MutexGuard<'_, BrowserParser> {
        self.parser.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn write_all(&self, text: &str) -> Result<(), SessionError> {
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        writer.write_all(text.as_bytes())?;
        writer.flush()?;
        Ok(())
    }

    fn publish(&self, event: BrowserEvent) {
        let _ = self.events.send(event);
    }

    fn handle_line(&self, line: &str) {
        let outcome = self.parser().consume(line);
        match outcome {
            Ok(Some(BrowserEvent::Definition(location))) => {
                if location.path.exists() {
                    self.publish(BrowserEvent::Definition(location));
                } else {
                    let fault = SessionError::ResourceUnavailable {
                        path: location.path,
                    };
                    tracing::warn!("{fault}");
                    self.publish(BrowserEvent::Notice(fault.to_string()));
                }
            }
            Ok(Some(event)) => {
                if let BrowserEvent::Results { total, records } = &event {
                    tracing::debug!(total, shown = records.len(), "query complete");
                }
                self.publish(event);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("method finder output skipped: {e}");
                self.publish(BrowserEvent::Notice(e.to_string()));
            }
        }
    }
}

pub struct ClassBrowser {
    shared: Arc<Shared>,
    child: Mutex<Option<Child>>,
    events: Receiver<BrowserEvent>,
    reader: Option<JoinHandle<()>>,
    stderr_reader: Option<JoinHandle<()>>,
}

impl ClassBrowser {
    /// Starts the method finder. One process serves every later query.
    pub fn start(command: &ProcessCommand, config: BrowserConfig) -> anyhow::Result<Self> {
        let process = transport::spawn_process(command)?;
        let mut browser = Self::from_streams(process.stdout, process.stdin, config);

        let events = browser.shared.events.clone();
        browser.stderr_reader = Some(transport::drain_lines(process.stderr, move |line| {
            let _ = events.send(BrowserEvent::Stderr(line));
        }));
        *browser.child.lock().unwrap_or_else(|e| e.into_inner()) = Some(process.child);
        Ok(browser)
    }

    pub fn from_streams<R, W>(reader: R, writer: W, config: BrowserConfig) -> Self
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let shared = Arc::new(Shared {
            writer: Mutex::new(Box::new(writer)),
            parser: Mutex::new(BrowserParser::new(config.default_package)),
            alive: AtomicBool::new(true),
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

    pub fn events(&self) -> &Receiver<BrowserEvent> {
        &self.events
    }

    pub fn is_running(&self) -> bool {
        self.shared.alive.load(Ordering::SeqCst)
    }

    /// Snapshot of the current result buffer.
    pub fn records(&self) -> Vec<MethodRecord> {
        self.shared.parser().records().to_vec()
    }

    /// Sends a query. Returns `Ok(false)` without writing anything when the
    /// method finder is not running; earlier results stay in place.
    pub fn search(&self, params: &SearchParameters) -> Result<bool, SessionError> {
        if !self.is_running() {
            tracing::debug!("search skipped: method finder is not running");
            return Ok(false);
        }
        self.shared.parser().set_show_args(params.show_args);
        tracing::debug!(
            class = %params.class_name,
            method = %params.method_name,
            "sending query"
        );
        self.shared.write_all(&params.encode())?;
        Ok(true)
    }

    /// Asks the method finder where `package:class.method` is defined. The
    /// reply arrives as [`BrowserEvent::Definition`].
    pub fn goto_definition(
        &self,
        method: &str,
        class: &str,
        package: &str,
    ) -> Result<(), SessionError> {
        if !self.is_running() {
            return Err(SessionError::NotActive);
        }
        tracing::debug!(method, class, package, "requesting source location");
        self.shared
            .write_all(&format!("pr_source_file {method} {package}:{class}\n"))
    }

    pub fn stop(&self) {
        tracing::info!("stopping method finder");
        *self.shared.writer.lock().unwrap_or_else(|e| e.into_inner()) =
            Box::new(std::io::sink());
        if let Some(child) = self.child.lock().unwrap_or_else(|e| e.into_inner()).as_mut() {
            transport::terminate(child);
        }
        self.shared.alive.store(false, Ordering::SeqCst);
    }
}

impl Drop for ClassBrowser {
    fn drop(&mut self) {
        if let Some(child) = self.child.get_mut().unwrap_or_else(|e| e.into_inner()).as_mut() {
            transport::terminate(child);
            if let Some(reader) = self.reader.take() {
                let _ = reader.join();
            }
            if let Some(reader) = self.stderr_reader.take() {
                let _ = reader.join();
            }
        }
    }
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
                tracing::warn!(error = %e, "method finder output stream failed");
                break;
            }
        };
        for line in assembler.push(&buf[..n]) {
            shared.handle_line(&line);
        }
    }

    if let Some(rest) = assembler.finish() {
        shared.handle_line(&rest);
    }
    tracing::info!("method finder exited");
    shared.alive.store(false, Ordering::SeqCst);
    shared.publish(BrowserEvent::Exited);
}

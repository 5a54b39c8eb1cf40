use anyhow::{Context, Result};
use clap::Parser;
use magik_session::aliases::{read_gis_aliases, read_layered_products, runalias_command};
use magik_session::browser::{BrowserEvent, ClassBrowser, SourceLocation};
use magik_session::cli::{Cli, Commands, OutputFormat};
use magik_session::config::{
    browser_config, load_settings, resolve_aliases_file, resolve_environment_file,
    resolve_gis_path, resolve_method_finder, session_config,
};
use magik_session::method::{Comment, MethodRecord};
use magik_session::session::{
    ExecutionHandle, KillOutcome, MagikSession, SessionConfig, SessionEvent,
};
use magik_session::transport::ProcessCommand;
use serde::Serialize;
use std::collections::VecDeque;
use std::io::{BufRead, Write};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TryRecvError};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

const POLL: Duration = Duration::from_millis(50);
const STARTUP_TIMEOUT: Duration = Duration::from_secs(120);

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let settings = load_settings(cli.config.as_deref())?;

    match cli.command.clone() {
        Commands::Query { search } => {
            let params = search.to_parameters(browser_config(&settings).max_results);
            print!("{}", params.encode());
        }
        Commands::Aliases { env, products } => {
            let gis = resolve_gis_path(env.gis.as_deref(), &settings)?;
            let aliases_file = resolve_aliases_file(env.aliases.as_deref(), &gis, &settings);
            let output = AliasesOutput {
                aliases_file: aliases_file.display().to_string(),
                aliases: read_gis_aliases(&aliases_file, &gis)?,
                products: if products {
                    Some(read_layered_products(&gis)?)
                } else {
                    None
                },
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Commands::Run {
            env,
            environment,
            program,
            program_args,
            plain,
            alias,
        } => {
            let command = match program {
                Some(program) => ProcessCommand::new(program).args(program_args),
                None => {
                    let gis = resolve_gis_path(env.gis.as_deref(), &settings)?;
                    let aliases_file =
                        resolve_aliases_file(env.aliases.as_deref(), &gis, &settings);
                    let environment = resolve_environment_file(environment.as_deref(), &settings);
                    let alias = alias.context("An alias is required without --program")?;
                    runalias_command(&gis, &aliases_file, &alias, environment.as_deref())
                }
            };
            let mut config = session_config(&settings);
            config.styled = !plain;
            run_repl(&command, config)?;
        }
        Commands::Browse {
            finder,
            search,
            format,
            timeout,
        } => {
            let command = resolve_method_finder(finder.command(), &settings)?;
            let config = browser_config(&settings);
            let params = search.to_parameters(config.max_results);
            let browser = ClassBrowser::start(&command, config)?;
            browser.search(&params)?;
            let output = await_results(&browser, Duration::from_secs(timeout))?;
            write_browse_output(&output, format)?;
            browser.stop();
        }
        Commands::Locate {
            finder,
            method,
            class,
            package,
            timeout,
        } => {
            let command = resolve_method_finder(finder.command(), &settings)?;
            let browser = ClassBrowser::start(&command, browser_config(&settings))?;
            browser.goto_definition(&method, &class, &package)?;
            let location = await_definition(&browser, Duration::from_secs(timeout))?;
            println!("{}", serde_json::to_string_pretty(&location)?);
            browser.stop();
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[derive(Debug, Serialize)]
struct AliasesOutput {
    aliases_file: String,
    aliases: Vec<magik_session::aliases::Stanza>,
    #[serde(skip_serializing_if = "Option::is_none")]
    products: Option<Vec<magik_session::aliases::Stanza>>,
}

#[derive(Debug, Serialize)]
struct BrowseOutput {
    total: u64,
    shown: usize,
    records: Vec<MethodRecord>,
    elapsed_ms: u64,
}

fn await_results(browser: &ClassBrowser, timeout: Duration) -> Result<BrowseOutput> {
    let started = Instant::now();
    let deadline = started + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match browser.events().recv_timeout(remaining) {
            Ok(BrowserEvent::Results { records, total }) => {
                return Ok(BrowseOutput {
                    total,
                    shown: records.len(),
                    records,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                });
            }
            Ok(BrowserEvent::Reset) => tracing::debug!("result set started"),
            Ok(BrowserEvent::Notice(notice)) => eprintln!("[magik-session] {notice}"),
            Ok(BrowserEvent::Stderr(line)) => eprintln!("{line}"),
            Ok(BrowserEvent::Definition(location)) => {
                tracing::debug!(?location, "unexpected source location")
            }
            Ok(BrowserEvent::Exited) | Err(RecvTimeoutError::Disconnected) => {
                anyhow::bail!("Method finder exited before returning results")
            }
            Err(RecvTimeoutError::Timeout) => {
                anyhow::bail!("No results within {}s", timeout.as_secs())
            }
        }
    }
}

fn await_definition(browser: &ClassBrowser, timeout: Duration) -> Result<SourceLocation> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match browser.events().recv_timeout(remaining) {
            Ok(BrowserEvent::Definition(location)) => return Ok(location),
            Ok(BrowserEvent::Notice(notice)) => anyhow::bail!(notice),
            Ok(BrowserEvent::Stderr(line)) => eprintln!("{line}"),
            Ok(BrowserEvent::Reset | BrowserEvent::Results { .. }) => {}
            Ok(BrowserEvent::Exited) | Err(RecvTimeoutError::Disconnected) => {
                anyhow::bail!("Method finder exited before answering")
            }
            Err(RecvTimeoutError::Timeout) => {
                anyhow::bail!("No source location within {}s", timeout.as_secs())
            }
        }
    }
}

fn write_browse_output(output: &BrowseOutput, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(output)?),
        OutputFormat::Text => {
            let mut out = std::io::stdout().lock();
            for record in &output.records {
                writeln!(out, "{}", describe_record(record))?;
                for comment in &record.comments {
                    writeln!(out, "    ## {}", describe_comment(comment))?;
                }
            }
            writeln!(out, "{} of {} shown", output.shown, output.total)?;
        }
    }
    Ok(())
}

fn describe_record(record: &MethodRecord) -> String {
    let mut text = format!("{}.{}", record.qualified_class(), record.name);
    let args = &record.arguments;
    let mut parts: Vec<String> = args.required.clone();
    if !args.optional.is_empty() {
        parts.push(format!("_optional {}", args.optional.join(" ")));
    }
    if let Some(gather) = &args.gather {
        parts.push(format!("_gather {gather}"));
    }
    if !parts.is_empty() {
        text.push_str(&format!("({})", parts.join(" ")));
    }
    if let Some(level) = record.level {
        text.push_str(&format!(" [{}]", level.directive()));
    }
    text
}

fn describe_comment(comment: &Comment) -> String {
    match comment {
        Comment::Text { text } => text.clone(),
        Comment::Parameter {
            class,
            parameter,
            description,
        } => format!(
            "@param {{{class}}} {parameter} {}",
            description.as_deref().unwrap_or("")
        ),
        Comment::Return { class, description } => {
            format!("@return {{{class}}} {}", description.as_deref().unwrap_or(""))
        }
    }
}

/// Line-mode front end: one command per input line, `:`-prefixed lines are
/// local commands. Lines typed while a command runs are queued, except
/// `:cancel`, which interrupts it.
fn run_repl(command: &ProcessCommand, config: SessionConfig) -> Result<()> {
    let session = MagikSession::spawn(command, config)?;
    let input = spawn_stdin_reader();
    let (out_tx, out_rx) = mpsc::channel::<String>();

    if !session.wait_ready(STARTUP_TIMEOUT) && session.is_active() {
        tracing::warn!("no prompt within {}s, continuing anyway", STARTUP_TIMEOUT.as_secs());
    }

    let mut pending: Option<ExecutionHandle> = None;
    let mut queued: VecDeque<String> = VecDeque::new();
    let mut input_closed = false;

    loop {
        while let Ok(line) = out_rx.try_recv() {
            println!("{line}");
        }

        match session.events().recv_timeout(POLL) {
            Ok(SessionEvent::Output(line)) => println!("{line}"),
            Ok(SessionEvent::Stderr(line)) => eprintln!("{line}"),
            Ok(SessionEvent::Notice(notice)) => eprintln!("[magik-session] {notice}"),
            Ok(SessionEvent::Confirmation(request)) => {
                let yes = ask(&input, &mut queued, request.question())?;
                request.answer(yes);
            }
            Ok(SessionEvent::Exited) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        match input.try_recv() {
            Ok(line) if line.trim() == ":cancel" => match &pending {
                Some(handle) => match handle.cancel() {
                    Ok(true) => {}
                    Ok(false) => eprintln!("[magik-session] Command already finished"),
                    Err(e) => eprintln!("[magik-session] {e}"),
                },
                None => eprintln!("[magik-session] Nothing to cancel"),
            },
            Ok(line) => queued.push_back(line),
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => input_closed = true,
        }

        if let Some(handle) = &pending {
            match handle.wait_timeout(Duration::ZERO) {
                Some(Ok(outcome)) => {
                    tracing::debug!(id = outcome.id, elapsed_ms = outcome.elapsed_ms, "done");
                    pending = None;
                }
                Some(Err(e)) => {
                    eprintln!("[magik-session] {e}");
                    pending = None;
                }
                None => continue,
            }
        }

        let Some(line) = queued.pop_front() else {
            if input_closed {
                break;
            }
            continue;
        };

        match line.trim() {
            ":quit" => break,
            ":kill" => {
                let outcome =
                    session.kill(|question| ask(&input, &mut queued, question).unwrap_or(false))?;
                if outcome == KillOutcome::Killed {
                    break;
                }
            }
            ":cancel" => eprintln!("[magik-session] Nothing to cancel"),
            ":ping" => pending = Some(session.ping()?),
            trimmed if trimmed.starts_with(":load ") => {
                let path = trimmed.trim_start_matches(":load ").trim();
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read {path}"))?;
                pending = Some(session.send_section(&text, Box::new(out_tx.clone()))?);
            }
            "" => {}
            _ => pending = Some(session.send(&line, Box::new(out_tx.clone()))?),
        }
    }

    while let Ok(line) = out_rx.try_recv() {
        println!("{line}");
    }
    Ok(())
}

fn spawn_stdin_reader() -> Receiver<String> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

/// Asks on the terminal. Lines typed before the question are kept as
/// commands; only a line entered after it counts as the answer.
fn ask(input: &Receiver<String>, queued: &mut VecDeque<String>, question: &str) -> Result<bool> {
    stash_typed_ahead(input, queued);
    print!("{question} [y/n] ");
    std::io::stdout().flush()?;
    Ok(read_answer(input))
}

fn stash_typed_ahead(input: &Receiver<String>, queued: &mut VecDeque<String>) {
    queued.extend(input.try_iter());
}

fn read_answer(input: &Receiver<String>) -> bool {
    input
        .recv()
        .map(|answer| answer.trim().to_ascii_lowercase().starts_with('y'))
        .unwrap_or(false)
}

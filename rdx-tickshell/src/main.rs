use anyhow::Result;
use colored::Colorize;
use rustyline::highlight::Highlighter;
use rustyline::Editor;
use rustyline_derive::{Completer, Helper, Hinter, Validator};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::env;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tickloop::prelude::*;
use tickloop::{ENGINE_NAME, VERSION as LIB_VERSION};
use tokio::task::JoinHandle;
use tracing::info;
use tracing_subscriber::EnvFilter;

const SHELL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// A custom helper struct for rustyline that enables syntax highlighting.
#[derive(Completer, Helper, Hinter, Validator)]
struct ShellHighlighter;

impl Highlighter for ShellHighlighter {
    fn highlight<'l>(&self, line: &'l str, _pos: usize) -> Cow<'l, str> {
        if let Some((command, rest)) = line.split_once(' ') {
            Cow::Owned(format!("{} {}", command.yellow().bold(), rest.yellow()))
        } else {
            Cow::Owned(line.yellow().bold().to_string())
        }
    }
    fn highlight_char(&self, _line: &str, _pos: usize, _forced: bool) -> bool {
        true
    }
}

/// The event type the shell fires with `fire`.
#[derive(Debug, Clone)]
struct ShellNote {
    text: String,
}

/// A loop state the shell registered, plus how often it has run.
struct TrackedState {
    id: LoopStateId,
    phase: Phase,
    runs: Arc<AtomicU64>,
}

/// Everything the REPL keeps between commands.
struct Shell {
    scheduler: Scheduler,
    stop: Arc<AtomicBool>,
    runner: Option<JoinHandle<tickloop::error::Result<()>>>,
    states: BTreeMap<usize, TrackedState>,
    next_handle: usize,
}

fn print_banner() {
    if env::var("QUIET_MODE").is_ok() {
        return;
    }
    println!("{}", format!("  {} shell", ENGINE_NAME).cyan().bold());
    println!(
        "          Shell   v{:<8} Library   v{:<8}",
        SHELL_VERSION, LIB_VERSION
    );
    println!(
        "{}",
        "\n    This software is provided 'as is', without warranty of any kind.\n    Distributed under the MIT OR Apache-2.0 license. Use at your own risk.\n"
            .dimmed()
    );
    println!("{}", "-".repeat(80).dimmed());
}

/// Subscribes the shell's printers to the scheduler's event streams.
fn register_listeners(scheduler: &Scheduler) {
    scheduler.subscribe(|event: &SchedulerEvent| {
        println!("\n<-- [SCHEDULER EVENT] {:?}", event);
    });
    scheduler.subscribe(|note: &ShellNote| {
        println!("\n<-- [NOTE] {}", note.text);
    });
}

impl Shell {
    fn new() -> Self {
        let stop = Arc::new(AtomicBool::new(true));
        let stop_flag = stop.clone();
        let scheduler = Scheduler::new(move |_| !stop_flag.load(Ordering::SeqCst), |_| true);
        register_listeners(&scheduler);
        Self {
            scheduler,
            stop,
            runner: None,
            states: BTreeMap::new(),
            next_handle: 0,
        }
    }

    fn start(&mut self) {
        if self.scheduler.is_running() {
            println!("--> The loop is already running.");
            return;
        }
        self.stop.store(false, Ordering::SeqCst);
        let handle = self.scheduler.clone();
        self.runner = Some(tokio::task::spawn_blocking(move || handle.run()));
        println!("--> Loop started.");
    }

    async fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.scheduler.wake();
        if let Some(runner) = self.runner.take() {
            match runner.await {
                Ok(Ok(())) => println!("--> Loop stopped."),
                Ok(Err(e)) => println!("--> Loop refused to run: {}", e),
                Err(e) => println!("--> Loop terminated abnormally: {}", e),
            }
        } else {
            println!("--> The loop is not running.");
        }
    }

    fn add(&mut self, args: &[&str]) {
        let Some(phase) = args.first().and_then(|label| Phase::from_label(label)) else {
            println!("Usage: add <early|fixed|update|late> [PRIORITY] [engine]");
            return;
        };
        let priority = match args.get(1).map(|s| s.parse::<i32>()) {
            Some(Ok(priority)) => priority,
            Some(Err(_)) => {
                println!("Error: priority must be an integer.");
                return;
            }
            None => 0,
        };
        let engine_priority = args.get(2) == Some(&"engine");

        let handle = self.next_handle;
        let runs = Arc::new(AtomicU64::new(0));
        let counter = runs.clone();
        let state = LoopState::new(phase, move |_, _| {
            counter.fetch_add(1, Ordering::Relaxed);
        })
        .with_priority(priority)
        .with_engine_priority(engine_priority)
        .with_label(format!("shell#{}", handle));

        let id = self.scheduler.add_loop_state(state);
        self.states.insert(handle, TrackedState { id, phase, runs });
        self.next_handle += 1;
        println!(
            "--> Added {} state {} (priority {}) with handle: #{}",
            phase, id, priority, handle
        );
    }

    fn remove(&mut self, args: &[&str]) {
        let Some(handle) = args.first().and_then(|s| s.parse::<usize>().ok()) else {
            println!("Usage: remove <HANDLE>");
            return;
        };
        match self.states.remove(&handle) {
            Some(tracked) if self.scheduler.remove_loop_state(tracked.id) => {
                println!("--> State #{} successfully removed.", handle)
            }
            Some(_) => println!("--> Error: State not found in scheduler."),
            None => println!(
                "Error: Invalid handle #{}. Use 'list' to see active states.",
                handle
            ),
        }
    }

    fn list(&self) {
        for (phase, states) in self.scheduler.registered_loop_states() {
            println!("{}:", phase.to_string().cyan());
            for info in states {
                let runs = self
                    .states
                    .values()
                    .find(|tracked| tracked.id == info.id)
                    .map(|tracked| tracked.runs.load(Ordering::Relaxed));
                println!(
                    "  {} {:<12} priority {:>4}{} runs {}",
                    info.id,
                    info.label.as_deref().unwrap_or("-"),
                    info.priority,
                    if info.engine_priority { " [engine]" } else { "" },
                    runs.map_or_else(|| "?".to_string(), |n| n.to_string())
                );
            }
        }
        let pending = self.scheduler.pending_loop_states();
        if pending > 0 {
            println!("  ({} state(s) waiting for the next iteration)", pending);
        }
    }

    fn fire(&self, args: &[&str]) {
        let Some((text, target)) = args.split_first() else {
            println!("Usage: fire <TEXT> [now|early|fixed|update|late|state <HANDLE>]");
            return;
        };
        let note = ShellNote {
            text: text.to_string(),
        };
        match target {
            [] | ["now"] => self.scheduler.fire_event(note),
            ["state", handle] => match handle.parse::<usize>().ok().and_then(|h| self.states.get(&h)) {
                Some(tracked) => {
                    self.scheduler.fire_event_on_loop_state(note, tracked.id);
                    println!("--> Queued for state {} ({}).", tracked.id, tracked.phase);
                }
                None => println!("Error: Invalid handle '{}'.", handle),
            },
            [label] => match Phase::from_label(label) {
                Some(phase) => {
                    self.scheduler.fire_event_on_phase(note, phase);
                    println!("--> Queued for the end of {}.", phase);
                }
                None => println!("Error: '{}' is not a phase.", label),
            },
            _ => println!("Usage: fire <TEXT> [now|early|fixed|update|late|state <HANDLE>]"),
        }
    }

    fn set_rate(&self, which: &str, args: &[&str]) {
        let Some(value) = args.first().and_then(|s| s.parse::<u32>().ok()) else {
            println!("Usage: {} <N>", which);
            return;
        };
        let outcome = match which {
            "fps" => self.scheduler.set_target_fps(value),
            _ => self.scheduler.set_target_ups(value),
        };
        match outcome {
            Ok(()) => println!("--> Target {} set to {}.", which.to_uppercase(), value),
            Err(e) => println!("Error: {}", e),
        }
    }

    fn status(&self) {
        let s = &self.scheduler;
        println!("  running       : {}", s.is_running());
        println!("  target fps/ups: {}/{}", s.target_fps(), s.target_ups());
        println!("  iterations    : {}", s.iterations());
        println!("  current state : {}", s.current_loop_state());
        println!("  accumulator   : {:.4}s (alpha {:.2})", s.accumulator(), s.interpolation_alpha());
    }

    fn reset(&mut self) {
        match self.scheduler.reset() {
            Ok(()) => {
                self.states.clear();
                // Reset dropped the printers too.
                register_listeners(&self.scheduler);
                println!("--> Scheduler reset.");
            }
            Err(e) => println!("Error: {} (stop the loop first)", e),
        }
    }
}

fn print_help() {
    println!("Available commands:");
    println!("  start                      - Starts the loop in the background.");
    println!("  stop                       - Stops the loop.");
    println!("  add <phase> [P] [engine]   - Adds a counting loop state.");
    println!("  remove <H>                 - Removes a loop state by its handle.");
    println!("  list                       - Shows registered states per phase.");
    println!("  fire <text> [target]       - Fires a note now, at a phase or at 'state <H>'.");
    println!("  fps <N> / ups <N>          - Changes the target rates.");
    println!("  status                     - Shows loop status.");
    println!("  clear                      - Drops all event listeners.");
    println!("  reset                      - Clears states, listeners and rates.");
    println!("  exit                       - Quits the shell.");
}

#[tokio::main]
async fn main() -> Result<()> {
    print_banner();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_target(false)
        .init();

    let mut shell = Shell::new();
    info!("{} shell ready.", ENGINE_NAME);

    let mut rl = Editor::new()?;
    rl.set_helper(Some(ShellHighlighter));

    println!(
        "{} shell is ready. Type 'help' for commands or 'exit' to quit.",
        ENGINE_NAME.cyan()
    );

    loop {
        let prompt = format!("{}", ">> ".cyan().bold());
        match rl.readline(&prompt) {
            Ok(line) => {
                rl.add_history_entry(line.as_str())?;
                let args = line.split_whitespace().collect::<Vec<_>>();
                let Some((command, rest)) = args.split_first() else {
                    continue;
                };
                match *command {
                    "start" => shell.start(),
                    "stop" => shell.stop().await,
                    "add" => shell.add(rest),
                    "remove" => shell.remove(rest),
                    "list" => shell.list(),
                    "fire" => shell.fire(rest),
                    "fps" | "ups" => shell.set_rate(command, rest),
                    "status" => shell.status(),
                    "clear" => {
                        shell.scheduler.clear();
                        println!("--> Event listeners cleared.");
                    }
                    "reset" => shell.reset(),
                    "help" => print_help(),
                    "exit" => break,
                    _ => println!("Unknown command: '{}'. Type 'help'.", line),
                }
            }
            Err(_) => {
                println!("Exiting tickshell...");
                break;
            }
        }
    }

    if shell.scheduler.is_running() {
        shell.stop().await;
    }
    Ok(())
}

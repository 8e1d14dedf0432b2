//! wod-cli - run and inspect workout scripts from the terminal
//!
//! `run` drives a script with periodic ticks and reads `next`, `pause`,
//! `resume` and `quit` commands from stdin. `inspect` prints the statements
//! and the block type each would compile to.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use wod_runtime::runtime::compiler::CompileContext;
use wod_runtime::runtime::events::{RuntimeEvent, TIMER_PAUSE, TIMER_RESUME};
use wod_runtime::runtime::tracker::{OutputKind, OutputStatement};
use wod_runtime::{RuntimeConfig, ScriptRuntime, WodScript, default_compiler};

#[derive(Parser)]
#[command(name = "wod-cli")]
#[command(about = "Run declarative workout scripts", long_about = None)]
struct Cli {
    /// Runtime configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a parsed script
    Run {
        /// Script JSON produced by the parser
        script: PathBuf,
    },

    /// Show statements and the strategy each would compile with
    Inspect {
        /// Script JSON produced by the parser
        script: PathBuf,
    },
}

fn load_script(path: &Path) -> anyhow::Result<WodScript> {
    WodScript::load(path).with_context(|| format!("Failed to load script {}", path.display()))
}

fn print_output(statement: &OutputStatement) {
    match statement.kind {
        OutputKind::Segment => {
            let millis = statement
                .span
                .and_then(|span| span.ended.map(|end| (end - span.started).num_milliseconds()))
                .unwrap_or(0);
            println!(
                "{:indent$}done  {} [{}] {:.1}s",
                "",
                statement.label,
                statement.block_type,
                millis as f64 / 1000.0,
                indent = statement.depth * 2
            );
        }
        OutputKind::Sound => println!("  * {}", statement.label),
        OutputKind::Milestone => println!("  > {}", statement.label),
    }
}

async fn run(script: WodScript, config: RuntimeConfig) -> anyhow::Result<()> {
    let tick_every = Duration::from_millis(config.tick_interval_ms.max(1));
    let mut runtime = ScriptRuntime::new(script, default_compiler(), config);
    runtime.subscribe_to_output(print_output);

    runtime.start()?;
    if let Some(current) = runtime.stack().current() {
        println!("now   {}", current.label());
    }

    let mut ticks = tokio::time::interval(tick_every);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while !runtime.is_complete() {
        let before = runtime.stack().current_key();

        tokio::select! {
            _ = ticks.tick() => {
                if let Err(err) = runtime.tick() {
                    eprintln!("error: {}", err);
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                let result = match line.trim() {
                    "" | "n" | "next" => runtime.next(),
                    "p" | "pause" => runtime.handle(RuntimeEvent::new(TIMER_PAUSE)),
                    "r" | "resume" => runtime.handle(RuntimeEvent::new(TIMER_RESUME)),
                    "q" | "quit" => break,
                    other => {
                        eprintln!("unknown command: {} (next | pause | resume | quit)", other);
                        Ok(())
                    }
                };
                if let Err(err) = result {
                    eprintln!("error: {}", err);
                }
            }
        }

        if runtime.stack().current_key() != before {
            if let Some(current) = runtime.stack().current() {
                println!("now   {}", current.label());
            }
        }
    }

    if runtime.is_complete() {
        let segments = runtime
            .get_output_statements()
            .iter()
            .filter(|s| s.kind == OutputKind::Segment)
            .count();
        println!("Workout complete: {} segments", segments);
    }
    if !runtime.errors().is_empty() {
        println!("{} runtime errors recorded", runtime.errors().len());
    }
    Ok(())
}

fn inspect(script: &WodScript) {
    let compiler = default_compiler();
    let ctx = CompileContext::root(script);
    println!("Strategies: {}", compiler.list_strategies().join(", "));

    for statement in script.statements() {
        let strategy = compiler.select(&[statement], &ctx).unwrap_or("-");
        println!(
            "{:>4}  {:<8} {}{}",
            statement.id,
            strategy,
            statement.label(),
            if statement.has_children() {
                format!("  children={:?}", statement.children)
            } else {
                String::new()
            }
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => RuntimeConfig::load(path)?,
        None => RuntimeConfig::default(),
    };

    let level = if config.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run { script } => {
            let script = load_script(&script)?;
            run(script, config).await?;
        }
        Commands::Inspect { script } => {
            let script = load_script(&script)?;
            inspect(&script);
        }
    }

    Ok(())
}

//! CLI for inspecting and replaying gpuwire traffic.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

mod dump;
mod replay;

use anyhow::Result;
use clap::{ArgAction, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use gpuwire::WireConfig;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gpuwire", version, about = "GPU command wire inspector")]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List every command recorded in a trace file.
    Dump(dump::DumpArgs),

    /// Replay the forward traffic of a trace into a software backend.
    Replay(replay::ReplayArgs),

    /// Print the default wire configuration as JSON.
    Config,

    /// Generate shell completion scripts.
    #[command(hide = true)]
    Completion {
        /// Target shell.
        shell: Shell,
    },
}

/// Output format for listing commands.
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub(crate) enum OutputFormat {
    /// Human-readable table.
    #[default]
    Table,
    /// Machine-readable JSON.
    Json,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    if let Err(e) = cli.dispatch() {
        eprintln!("gpuwire: {e:#}");
        std::process::exit(1);
    }
}

/// Logs to stderr; `RUST_LOG` overrides the `-v` level.
fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

impl Cli {
    fn dispatch(self) -> Result<()> {
        match self.command {
            Command::Dump(args) => dump::run(&args),
            Command::Replay(args) => replay::run(&args),
            Command::Config => {
                println!("{}", serde_json::to_string_pretty(&WireConfig::default())?);
                Ok(())
            }
            Command::Completion { shell } => {
                clap_complete::generate(
                    shell,
                    &mut Self::command(),
                    "gpuwire",
                    &mut std::io::stdout(),
                );
                Ok(())
            }
        }
    }
}

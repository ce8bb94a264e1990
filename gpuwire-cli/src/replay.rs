use std::path::PathBuf;

use anyhow::{Context, Result};
use gpuwire::proto::trace::{Direction, TraceEntry};
use gpuwire::{HandleOutcome, ObjectKind, Server, SoftwareBackend, WireConfig};
use tracing::debug;

use crate::dump;

#[derive(clap::Args)]
pub(crate) struct ReplayArgs {
    /// Trace file to replay.
    trace: PathBuf,

    /// JSON wire configuration; missing fields take their defaults.
    #[arg(long)]
    config: Option<PathBuf>,
}

pub(crate) fn run(args: &ReplayArgs) -> Result<()> {
    let config = match &args.config {
        Some(path) => {
            WireConfig::load(path).with_context(|| format!("loading {}", path.display()))?
        }
        None => WireConfig::default(),
    };
    let entries = dump::read_trace(&args.trace)?;
    let mut server = Server::new(SoftwareBackend::new(), &config);

    let mut transmissions = 0usize;
    let mut outcome = HandleOutcome::Complete;
    for entry in entries.iter().filter(|e| e.direction == Direction::Forward) {
        outcome = server.handle_commands(&entry.bytes).with_context(|| {
            format!(
                "forward transmission {transmissions} rejected after {} commands",
                server.commands_handled()
            )
        })?;
        transmissions += 1;
    }
    server.tick()?;
    debug!(transmissions, "replay finished");

    let mut sent: Vec<Vec<u8>> = Vec::new();
    server.flush(&mut sent)?;
    let returned: Vec<TraceEntry> = sent
        .into_iter()
        .map(|bytes| TraceEntry {
            direction: Direction::Return,
            bytes,
        })
        .collect();
    let rows = dump::decode(&returned)?;

    println!("transmissions:   {transmissions}");
    println!("commands:        {}", server.commands_handled());
    println!("return commands: {}", rows.len());
    if let HandleOutcome::Incomplete { buffered } = outcome {
        println!("incomplete:      {buffered} bytes of an unfinished command");
    }
    for kind in ObjectKind::ALL {
        let live = server.live_count(kind);
        if live > 0 {
            println!("  {:<20} {live}", kind.name());
        }
    }
    if !rows.is_empty() {
        println!();
        dump::print_table(&rows);
    }
    Ok(())
}

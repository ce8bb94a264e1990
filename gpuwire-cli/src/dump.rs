use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use gpuwire::WireConfig;
use gpuwire::proto::trace::{self, Direction, TraceEntry};
use gpuwire::proto::{DeserializeAllocator, ENVELOPE_SIZE, ForwardCommand, ReturnCommand, codec};
use serde::Serialize;
use tracing::warn;

use crate::OutputFormat;

#[derive(clap::Args)]
pub(crate) struct DumpArgs {
    /// Trace file to read.
    trace: PathBuf,

    /// Output format.
    #[arg(long, default_value = "table")]
    format: OutputFormat,
}

/// A decoded command of either direction.
#[derive(Serialize)]
#[serde(untagged)]
pub(crate) enum Decoded {
    Forward(ForwardCommand),
    Return(ReturnCommand),
}

impl Decoded {
    fn name(&self) -> &'static str {
        match self {
            Self::Forward(c) => c.tag().name(),
            Self::Return(c) => c.tag().name(),
        }
    }
}

/// One command of a trace.
#[derive(Serialize)]
pub(crate) struct Row {
    /// Index of the transmission that completed the command.
    transmission: usize,
    direction: Direction,
    size: usize,
    command: Decoded,
}

pub(crate) fn read_trace(path: &Path) -> Result<Vec<TraceEntry>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    trace::read_all(&mut BufReader::new(file))
        .with_context(|| format!("reading trace {}", path.display()))
}

/// Decodes every complete command; a command may span transmissions of the
/// same direction.
pub(crate) fn decode(entries: &[TraceEntry]) -> Result<Vec<Row>> {
    let mut alloc = DeserializeAllocator::new(WireConfig::default().deserialize_budget);
    let mut forward = Vec::new();
    let mut returns = Vec::new();
    let mut rows = Vec::new();
    for (index, entry) in entries.iter().enumerate() {
        let pending = match entry.direction {
            Direction::Forward => &mut forward,
            _ => &mut returns,
        };
        pending.extend_from_slice(&entry.bytes);
        let mut used = 0;
        while pending.len() - used >= ENVELOPE_SIZE {
            let rest = &pending[used..];
            let (size, tag) = codec::peek_envelope(rest)?;
            if size < ENVELOPE_SIZE {
                bail!("transmission {index}: command size {size} is smaller than its envelope");
            }
            let Some(bytes) = rest.get(..size) else {
                break;
            };
            let decoded = match entry.direction {
                Direction::Forward => ForwardCommand::decode(bytes, &mut alloc).map(Decoded::Forward),
                _ => ReturnCommand::decode(bytes, &mut alloc).map(Decoded::Return),
            };
            alloc.reset();
            let command =
                decoded.with_context(|| format!("transmission {index}: command tag {tag}"))?;
            rows.push(Row {
                transmission: index,
                direction: entry.direction,
                size,
                command,
            });
            used += size;
        }
        pending.drain(..used);
    }
    for (direction, left) in [("forward", forward.len()), ("return", returns.len())] {
        if left > 0 {
            warn!(direction, bytes = left, "trace ends inside a command");
        }
    }
    Ok(rows)
}

const fn direction_name(direction: Direction) -> &'static str {
    match direction {
        Direction::Forward => "forward",
        _ => "return",
    }
}

pub(crate) fn print_table(rows: &[Row]) {
    println!("{:>6} {:<8} {:<34} {:>10}", "TX", "DIR", "COMMAND", "SIZE");
    for row in rows {
        println!(
            "{:>6} {:<8} {:<34} {:>10}",
            row.transmission,
            direction_name(row.direction),
            row.command.name(),
            row.size
        );
    }
}

pub(crate) fn run(args: &DumpArgs) -> Result<()> {
    let rows = decode(&read_trace(&args.trace)?)?;
    match args.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
        OutputFormat::Table if rows.is_empty() => println!("No commands."),
        OutputFormat::Table => print_table(&rows),
    }
    Ok(())
}

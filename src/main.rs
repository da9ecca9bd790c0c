use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use hexbuf::{Buffer, Config, ProgressPhase, SaveCallbacks, SaveOutcome, SaveStage, TempFileStage};

const DUMP_WIDTH: usize = 16;

#[derive(Debug, Parser)]
#[command(bin_name = "hexbuf")]
#[command(about = "Inspect and patch large binary files without loading them")]
#[command(version)]
#[command(arg_required_else_help(true))]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// JSON config file
    #[arg(global = true, long, short = 'c')]
    config: Option<PathBuf>,

    /// Log at debug level (RUST_LOG overrides)
    #[arg(global = true, long, short = 'v')]
    verbose: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print a hex dump of a byte range
    Dump {
        file: PathBuf,
        #[arg(long, default_value_t = 0)]
        offset: u64,
        /// Bytes to print; defaults to the rest of the file
        #[arg(long)]
        length: Option<u64>,
    },
    /// Insert bytes before a position
    Insert {
        #[command(flatten)]
        target: Target,
        #[arg(long)]
        at: u64,
        /// Bytes as hex, e.g. "de ad be ef"
        hex: String,
    },
    /// Delete the bytes start..=end
    Delete {
        #[command(flatten)]
        target: Target,
        #[arg(long)]
        start: u64,
        #[arg(long)]
        end: u64,
    },
    /// Replace the bytes start..=end
    Replace {
        #[command(flatten)]
        target: Target,
        #[arg(long)]
        start: u64,
        #[arg(long)]
        end: u64,
        hex: String,
    },
    /// Append bytes at the end
    Append {
        #[command(flatten)]
        target: Target,
        hex: String,
    },
    /// Copy a file through the buffer's save-as path
    Copy { file: PathBuf, dest: PathBuf },
}

#[derive(Debug, Args)]
struct Target {
    file: PathBuf,
    /// Write the result here instead of over FILE
    #[arg(long, short = 'o')]
    out: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::WARN };
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    let config = match &cli.config {
        Some(path) => Config::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };

    match cli.command {
        Command::Dump { file, offset, length } => dump(&open(&file, config)?, offset, length),
        Command::Insert { target, at, hex } => {
            let data = parse_hex(&hex)?;
            edit(target, config, |buffer| Ok(buffer.insert(at, &data)?))
        }
        Command::Delete { target, start, end } => {
            edit(target, config, |buffer| Ok(buffer.delete(start, end)?))
        }
        Command::Replace {
            target,
            start,
            end,
            hex,
        } => {
            let data = parse_hex(&hex)?;
            edit(target, config, |buffer| Ok(buffer.replace(start, end, &data)?))
        }
        Command::Append { target, hex } => {
            let data = parse_hex(&hex)?;
            edit(target, config, |buffer| Ok(buffer.append(&data)?))
        }
        Command::Copy { file, dest } => {
            let buffer = open(&file, config)?;
            save(&buffer, Some(&dest))
        }
    }
}

fn open(path: &Path, config: Config) -> Result<Buffer> {
    Buffer::open_with_config(path, config).with_context(|| format!("opening {}", path.display()))
}

fn edit(target: Target, config: Config, apply: impl FnOnce(&Buffer) -> Result<bool>) -> Result<()> {
    let buffer = open(&target.file, config)?;
    let before = buffer.size();

    if !apply(&buffer)? {
        bail!("edit refused: {} is not resizable", target.file.display());
    }
    info!(before, after = buffer.size(), "edit applied");

    save(&buffer, target.out.as_deref())
}

fn save(buffer: &Buffer, dest: Option<&Path>) -> Result<()> {
    let callbacks = SaveCallbacks::new()
        .on_progress(|fraction, phase| {
            eprint!("\r{:>5.1}%", fraction * 100.0);
            if phase == ProgressPhase::Finish {
                eprintln!();
            }
        })
        .on_stage(|stage| {
            if let Some(message) = stage_message(stage) {
                eprintln!("{message}");
            }
        });

    let handle = match dest {
        Some(dest) => buffer.save_as(dest, callbacks)?,
        None => buffer.save(callbacks)?,
    };
    let kind = handle.kind();

    match handle.wait() {
        SaveOutcome::Finished => {
            let path = buffer.path().unwrap_or_default();
            eprintln!("saved {} ({:?})", path.display(), kind);
            Ok(())
        }
        SaveOutcome::Cancelled => bail!("save cancelled"),
        SaveOutcome::Failed(e) => {
            if let Some(path) = buffer.path() {
                eprintln!("buffer now backed by {}", path.display());
            }
            Err(e).context("save failed")
        }
    }
}

fn stage_message(stage: SaveStage) -> Option<&'static str> {
    match stage {
        SaveStage::TempFile(TempFileStage::BeforeCreatingTemp) => Some("Writing temporary file..."),
        SaveStage::TempFile(TempFileStage::BeforeDeletingOriginal) => Some("Deleting original..."),
        SaveStage::TempFile(TempFileStage::BeforeMovingIntoPlace) => Some("Moving into place..."),
        _ => None,
    }
}

fn dump(buffer: &Buffer, offset: u64, length: Option<u64>) -> Result<()> {
    let size = buffer.size();
    if offset >= size {
        return Ok(());
    }
    let end = match length {
        Some(0) => return Ok(()),
        Some(length) => offset.saturating_add(length).min(size),
        None => size,
    };

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut line = offset;
    while line < end {
        let last = (line + DUMP_WIDTH as u64).min(end) - 1;
        let bytes = buffer.range_to_vec(line, last)?;
        writeln!(out, "{}", format_line(line, &bytes))?;
        line = last + 1;
    }
    Ok(())
}

fn format_line(offset: u64, bytes: &[u8]) -> String {
    let mut hex = String::with_capacity(DUMP_WIDTH * 3);
    for (i, byte) in bytes.iter().enumerate() {
        if i == DUMP_WIDTH / 2 {
            hex.push(' ');
        }
        hex.push_str(&format!("{byte:02x} "));
    }
    let ascii: String = bytes
        .iter()
        .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
        .collect();

    format!("{offset:08x}  {hex:<49} |{ascii}|")
}

fn parse_hex(text: &str) -> Result<Vec<u8>> {
    let digits: Vec<u8> = text.bytes().filter(|b| !b.is_ascii_whitespace()).collect();
    if digits.len() % 2 != 0 {
        bail!("odd number of hex digits in {text:?}");
    }

    digits
        .chunks(2)
        .map(|pair| {
            let pair = std::str::from_utf8(pair).context("hex digits must be ASCII")?;
            u8::from_str_radix(pair, 16).with_context(|| format!("invalid hex byte {pair:?}"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex("de ad BE ef").unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);
        assert!(parse_hex("abc").is_err());
        assert!(parse_hex("zz").is_err());
    }

    #[test]
    fn test_format_line() {
        let line = format_line(0x10, b"AB\x00");
        assert!(line.starts_with("00000010  41 42 00 "));
        assert!(line.ends_with("|AB.|"));
    }
}

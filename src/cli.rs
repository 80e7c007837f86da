//! quiverpm: diagnostics for persistent-memory files.
//!
//! Команды:
//! - dax-check <dir> [--json]: can a MAP_SYNC mapping be made in <dir>?
//! - log-dump --file F [--length N] [--events] [--json]
//! - channel-info --file F [--json]: watermark of F's `.pmem` side file

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use byteorder::{BigEndian, ByteOrder};
use clap::{Parser, Subcommand};
use serde::Serialize;

use crate::aol::{AppendOnlyLog, LogConfig};
use crate::channel::{metadata_path, MetadataFile};
use crate::config::PmemConfig;
use crate::consts::{BLOCK_SIZE, INT_SIZE, LOG_HDR_SIZE, LOG_MAGIC, LOG_OFF_PADDING};
use crate::metrics::{metrics_snapshot, MetricsSnapshot};
use crate::pmem::is_pmem_supported_for;
use crate::tx::Event;

#[derive(Parser, Debug)]
#[command(
    name = "quiverpm",
    version,
    about = "Persistent-memory log, channel and heap diagnostics",
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Check whether DAX (MAP_SYNC) mappings work in a directory
    DaxCheck {
        dir: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// List the records of an append-only log file
    LogDump {
        #[arg(long)]
        file: PathBuf,
        /// Log window length (defaults to the file size)
        #[arg(long)]
        length: Option<usize>,
        /// Decode records as transaction events
        #[arg(long)]
        events: bool,
        #[arg(long)]
        json: bool,
    },
    /// Print the durable watermark of a mapped file channel
    ChannelInfo {
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Serialize)]
struct DaxReport {
    path: String,
    pmem: bool,
    metrics: MetricsSnapshot,
}

#[derive(Serialize)]
struct RecordEntry {
    location: usize,
    len: usize,
    preview: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    event: Option<String>,
}

#[derive(Serialize)]
struct LogReport {
    path: String,
    is_log: bool,
    padding: bool,
    linear: bool,
    checkpoint: usize,
    position: usize,
    remaining: usize,
    records: Vec<RecordEntry>,
    metrics: MetricsSnapshot,
}

#[derive(Serialize)]
struct ChannelReport {
    path: String,
    metadata: String,
    watermark: u32,
    file_len: u64,
    metrics: MetricsSnapshot,
}

/// Parse args and dispatch; returns the process exit code.
pub fn run() -> Result<i32> {
    let cli = Cli::parse();
    let cfg = PmemConfig::from_env();
    match cli.cmd {
        Cmd::DaxCheck { dir, json } => cmd_dax_check(&dir, json),
        Cmd::LogDump {
            file,
            length,
            events,
            json,
        } => cmd_log_dump(&file, length, events, json, &cfg),
        Cmd::ChannelInfo { file, json } => cmd_channel_info(&file, json, &cfg),
    }
}

fn print_json<T: Serialize>(v: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(v).context("serialize report")?);
    Ok(())
}

pub fn cmd_dax_check(dir: &Path, json: bool) -> Result<i32> {
    let abs = std::fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf());
    let pmem = is_pmem_supported_for(dir)
        .with_context(|| format!("probe {}", abs.display()))?;
    if json {
        print_json(&DaxReport {
            path: abs.display().to_string(),
            pmem,
            metrics: metrics_snapshot(),
        })?;
    } else {
        println!("{}: pmem is {}", abs.display(), pmem);
    }
    Ok(if pmem { 0 } else { 1 })
}

/// True if `file` starts with a log header. Reads only; never maps.
fn looks_like_log(file: &Path) -> Result<bool> {
    let mut hdr = [0u8; LOG_HDR_SIZE];
    let mut f = File::open(file).with_context(|| format!("open {}", file.display()))?;
    if f.read_exact(&mut hdr).is_err() {
        return Ok(false);
    }
    let padding = BigEndian::read_u32(&hdr[LOG_OFF_PADDING..LOG_OFF_PADDING + 4]) as usize;
    Ok(&hdr[..8] == LOG_MAGIC && (padding == INT_SIZE || padding == BLOCK_SIZE))
}

pub fn cmd_log_dump(
    file: &Path,
    length: Option<usize>,
    events: bool,
    json: bool,
    cfg: &PmemConfig,
) -> Result<i32> {
    if !looks_like_log(file)? {
        if json {
            print_json(&LogReport {
                path: file.display().to_string(),
                is_log: false,
                padding: false,
                linear: false,
                checkpoint: 0,
                position: 0,
                remaining: 0,
                records: Vec::new(),
                metrics: metrics_snapshot(),
            })?;
        } else {
            println!("{}: not a log", file.display());
        }
        return Ok(1);
    }

    let file_len = std::fs::metadata(file)
        .with_context(|| format!("stat {}", file.display()))?
        .len() as usize;
    let length = length.unwrap_or(file_len);
    if length > file_len {
        return Err(anyhow!(
            "--length {} exceeds file size {} of {}",
            length,
            file_len,
            file.display()
        ));
    }
    // on-disk padding/ordering win over the requested config
    let log = AppendOnlyLog::open_file(file, length, LogConfig::default(), cfg)
        .with_context(|| format!("open log {}", file.display()))?;

    let mut records = Vec::new();
    let mut it = log.copying_iter()?;
    while let Some((location, payload)) = it.next_with_location()? {
        let event = if events {
            Some(match Event::decode(&payload) {
                Ok(Some(ev)) => describe_event(&ev),
                Ok(None) => "unknown".to_string(),
                Err(e) => format!("undecodable: {}", e),
            })
        } else {
            None
        };
        records.push(RecordEntry {
            location,
            len: payload.len(),
            preview: hex_preview(&payload, 16),
            event,
        });
    }

    let report = LogReport {
        path: file.display().to_string(),
        is_log: true,
        padding: log.is_effective_padding()?,
        linear: log.is_effective_linear_ordering()?,
        checkpoint: log.stored_checkpoint()?,
        position: log.position()?,
        remaining: log.remaining()?,
        records,
        metrics: metrics_snapshot(),
    };
    log.close()?;

    if json {
        print_json(&report)?;
    } else {
        println!("Log at {}", report.path);
        println!("  padding    = {}", if report.padding { BLOCK_SIZE } else { INT_SIZE });
        println!("  linear     = {}", report.linear);
        println!("  checkpoint = {}", report.checkpoint);
        println!("  position   = {}", report.position);
        println!("  remaining  = {}", report.remaining);
        println!("  records    = {}", report.records.len());
        for r in &report.records {
            match &r.event {
                Some(ev) => println!("  @{:<8} len={:<6} {}  {}", r.location, r.len, r.preview, ev),
                None => println!("  @{:<8} len={:<6} {}", r.location, r.len, r.preview),
            }
        }
    }
    Ok(0)
}

pub fn cmd_channel_info(file: &Path, json: bool, cfg: &PmemConfig) -> Result<i32> {
    let meta_path = metadata_path(file);
    if !meta_path.exists() {
        return Err(anyhow!("no metadata file {}", meta_path.display()));
    }
    let meta = MetadataFile::open(&meta_path, true, cfg)
        .with_context(|| format!("open metadata {}", meta_path.display()))?;
    let watermark = meta.persisted_length()?;
    meta.close()?;
    let file_len = std::fs::metadata(file).map(|m| m.len()).unwrap_or(0);

    if json {
        print_json(&ChannelReport {
            path: file.display().to_string(),
            metadata: meta_path.display().to_string(),
            watermark,
            file_len,
            metrics: metrics_snapshot(),
        })?;
    } else {
        println!("Channel {}", file.display());
        println!("  metadata  = {}", meta_path.display());
        println!("  watermark = {} bytes", watermark);
        println!("  file_len  = {} bytes", file_len);
    }
    Ok(0)
}

fn describe_event(ev: &Event) -> String {
    match ev {
        Event::Malloc {
            offset,
            size,
            internal,
        } => format!("malloc offset={} size={} internal={}", offset, size, internal),
        Event::Deallocate { offset, size } => format!("deallocate offset={} size={}", offset, size),
        Event::BeforeWrite { offset, preimage } => {
            format!("before-write offset={} size={}", offset, preimage.len())
        }
        Event::Outcome { commit } => format!("outcome commit={}", commit),
    }
}

/// Hex of the first `max` bytes, "..." when truncated.
pub fn hex_preview(bytes: &[u8], max: usize) -> String {
    let mut out = String::new();
    for (i, b) in bytes.iter().take(max).enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(&format!("{:02x}", b));
    }
    if bytes.len() > max {
        out.push_str(" ...");
    }
    out
}

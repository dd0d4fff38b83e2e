use clap::{Parser, Subcommand};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::config::{default_settings_path, Settings};
use crate::logging::LogLevel;
use crate::protocol::{is_valid_frame, Frame};

#[derive(Parser)]
#[command(name = "wal-sync")]
#[command(about = "Write-ahead log and transfer engine for wearable audio", long_about = None)]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Settings file (defaults to the platform config dir)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// WAL directory, overriding the settings file
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Log level (RUST_LOG takes precedence)
    #[arg(long, value_enum, default_value = "info", global = true)]
    pub log_level: LogLevel,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Commands {
    /// Show catalog counts and pending entries
    Status {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Decode a frame file and summarize its contents
    Inspect {
        file: PathBuf,

        /// Number of frames to print
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Delete synced entries older than the retention horizon
    Sweep {
        #[arg(long)]
        days: Option<u32>,
    },

    /// Run one upload pass into the outbox
    Upload {
        #[arg(long)]
        user_id: Option<String>,

        #[arg(long)]
        outbox: Option<PathBuf>,
    },

    /// Upload and sweep periodically until interrupted
    Run {
        /// Seconds between upload passes
        #[arg(long)]
        interval: Option<u64>,

        #[arg(long)]
        user_id: Option<String>,
    },
}

impl Cli {
    /// Settings file contents with command-line overrides applied.
    pub fn settings(&self) -> Settings {
        let path = self.config.clone().unwrap_or_else(default_settings_path);
        let mut settings = Settings::load(&path);

        if let Some(dir) = &self.data_dir {
            settings.wal.data_dir = dir.clone();
        }
        match &self.command {
            Commands::Upload { user_id, outbox } => {
                if user_id.is_some() {
                    settings.upload.user_id = user_id.clone();
                }
                if outbox.is_some() {
                    settings.upload.outbox_dir = outbox.clone();
                }
            }
            Commands::Run { interval, user_id } => {
                if let Some(secs) = interval {
                    settings.upload.interval_secs = *secs;
                }
                if user_id.is_some() {
                    settings.upload.user_id = user_id.clone();
                }
            }
            _ => {}
        }
        settings
    }
}

/// What `inspect` reports about a frame file
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct FrameFileSummary {
    pub frames: usize,
    pub payload_bytes: usize,
    pub invalid: usize,
    pub min_len: usize,
    pub max_len: usize,
    /// Frame count per TOC byte, keyed as hex
    pub toc_counts: BTreeMap<String, usize>,
    /// Hex of the first frames
    pub preview: Vec<String>,
}

pub fn summarize_frames(frames: &[Frame], preview: usize) -> FrameFileSummary {
    let mut summary = FrameFileSummary {
        frames: frames.len(),
        min_len: frames.iter().map(Vec::len).min().unwrap_or(0),
        max_len: frames.iter().map(Vec::len).max().unwrap_or(0),
        ..FrameFileSummary::default()
    };

    for frame in frames {
        summary.payload_bytes += frame.len();
        if !is_valid_frame(frame) {
            summary.invalid += 1;
        }
        if let Some(toc) = frame.first() {
            *summary.toc_counts.entry(format!("0x{:02x}", toc)).or_insert(0) += 1;
        }
    }

    summary.preview = frames
        .iter()
        .take(preview)
        .map(|frame| hex::encode(&frame[..frame.len().min(16)]))
        .collect();
    summary
}

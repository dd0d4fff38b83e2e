use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use wal_sync::cli::{summarize_frames, Cli, Commands};
use wal_sync::config::Settings;
use wal_sync::logging;
use wal_sync::service::{StatusReport, WalSyncService};
use wal_sync::wal::frame_file;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_level);

    let settings = cli.settings();
    info!("wal-sync v{}", env!("CARGO_PKG_VERSION"));
    info!("  Data dir: {}", settings.wal.data_dir.display());

    match cli.command {
        Commands::Inspect { file, limit } => inspect(&file, limit).await,
        Commands::Status { json } => {
            let service = open(settings).await?;
            print_status(&service.status().await, json)
        }
        Commands::Sweep { days } => {
            let service = open(settings).await?;
            let report = service.sweep(days).await.context("Retention sweep failed")?;
            println!(
                "Removed {} entries, deleted {} files",
                report.removed, report.files_deleted
            );
            Ok(())
        }
        Commands::Upload { .. } => {
            let outbox = settings.outbox_dir();
            let service = open(settings).await?;
            match service.sync_uploads().await {
                Some(report) => println!(
                    "Uploaded {}, skipped {}, failed {} (outbox: {})",
                    report.uploaded,
                    report.skipped,
                    report.failed,
                    outbox.display()
                ),
                None => println!("An upload pass is already running"),
            }
            Ok(())
        }
        Commands::Run { .. } => run_daemon(settings).await,
    }
}

async fn open(settings: Settings) -> Result<WalSyncService> {
    let dir = settings.wal.data_dir.clone();
    WalSyncService::open(settings)
        .await
        .with_context(|| format!("Failed to open WAL store at {}", dir.display()))
}

async fn inspect(path: &Path, limit: usize) -> Result<()> {
    let frames = frame_file::read_frames(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let summary = summarize_frames(&frames, limit);

    println!("{}", path.display());
    println!("  frames:        {}", summary.frames);
    println!("  payload bytes: {}", summary.payload_bytes);
    println!("  frame length:  {}..={}", summary.min_len, summary.max_len);
    println!("  invalid TOC:   {}", summary.invalid);
    for (toc, count) in &summary.toc_counts {
        println!("  toc {}:      {}", toc, count);
    }
    for (i, preview) in summary.preview.iter().enumerate() {
        println!("  [{:>4}] {}", i, preview);
    }
    Ok(())
}

fn print_status(report: &StatusReport, json: bool) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(report).context("Failed to encode status")?
        );
        return Ok(());
    }

    let stats = &report.stats;
    println!("WAL store: {}", report.data_dir);
    println!(
        "  entries: {} (miss {}, in progress {}, synced {}, corrupted {})",
        stats.total, stats.miss, stats.in_progress, stats.synced, stats.corrupted
    );
    println!(
        "  storage: memory {}, disk {}, sdcard {}, flash {}",
        stats.memory, stats.disk, stats.sdcard, stats.flash_page
    );
    println!("  uploadable: {}, bytes on disk: {}", stats.uploadable, stats.bytes_on_disk);

    if !report.pending.is_empty() {
        println!("Pending:");
        for entry in &report.pending {
            println!(
                "  {:<32} {:<10} {:<7} {:>6} frames {:>5}s",
                entry.id,
                entry.codec.as_str(),
                format!("{:?}", entry.storage).to_lowercase(),
                entry.total_frames,
                entry.seconds
            );
        }
    }
    Ok(())
}

async fn run_daemon(settings: Settings) -> Result<()> {
    let service = open(settings).await?;
    let shutdown = CancellationToken::new();

    let trigger = shutdown.clone();
    let signals = tokio::spawn(async move {
        tokio::select! {
            _ = signal::ctrl_c() => info!("Received Ctrl+C signal"),
            _ = wait_for_term_signal() => info!("Received TERM signal"),
        }
        trigger.cancel();
    });

    service.run_until(shutdown).await;
    signals.abort();

    if let Err(e) = service.store().save().await {
        error!("Final catalog save failed: {}", e);
    }
    Ok(())
}

#[cfg(unix)]
async fn wait_for_term_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    if let Ok(mut stream) = signal(SignalKind::terminate()) {
        stream.recv().await;
    }
}

#[cfg(not(unix))]
async fn wait_for_term_signal() {
    futures::future::pending::<()>().await;
}

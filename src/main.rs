/*
 * parafetch - Resumable segmented download engine.
 * Copyright (C) 2025  parafetch contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use parafetch::engine::checksum::HashAlgorithm;
use parafetch::{
    Config, DownloadEvent, DownloadId, DownloadOrchestrator, DownloadRequest, DownloadStatus,
    JsonFileRepository,
};

#[derive(Parser)]
#[command(name = "parafetch")]
#[command(version)]
#[command(about = "Resumable segmented downloader with mirror failover.")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Download a URL
    Get {
        url: String,
        /// Destination filename (derived from the URL when omitted)
        #[arg(short = 'o', long)]
        output: Option<String>,
        /// Destination directory
        #[arg(short = 'd', long, default_value = ".")]
        directory: PathBuf,
        /// Number of parallel segments (1-16)
        #[arg(short = 's', long)]
        segments: Option<usize>,
        /// Speed limit in bytes per second
        #[arg(short = 'l', long)]
        limit: Option<u64>,
        /// Alternate mirror URLs for the same resource
        #[arg(short = 'm', long)]
        mirror: Vec<String>,
        /// Expected checksum, lowercase or uppercase hex
        #[arg(long)]
        checksum: Option<String>,
        /// Checksum algorithm (sha256, md5)
        #[arg(long, default_value = "sha256")]
        algorithm: String,
    },
    /// Resume a paused download by id
    Resume { id: String },
    /// List known downloads and their status
    List,
    /// Remove a download record (the file on disk is kept)
    Remove { id: String },
}

fn state_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("parafetch")
        .join("tasks")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load();
    config.validate().map_err(|e| anyhow!(e))?;
    parafetch::logging::init_with_file(
        &config.logging.level,
        config.logging.file.as_deref(),
    );

    let repo = Arc::new(JsonFileRepository::new(state_dir())?);
    let orchestrator = DownloadOrchestrator::new(config, repo)?;

    match cli.command {
        Command::Get {
            url,
            output,
            directory,
            segments,
            limit,
            mirror,
            checksum,
            algorithm,
        } => {
            let file_name = match output {
                Some(name) => name,
                None => url
                    .rsplit('/')
                    .next()
                    .filter(|s| !s.is_empty())
                    .unwrap_or("download")
                    .to_string(),
            };

            let mut request = DownloadRequest::new(url, file_name, directory);
            if let Some(count) = segments {
                request = request.with_segments(count);
            }
            if let Some(limit) = limit {
                request = request.with_speed_limit(limit);
            }
            if !mirror.is_empty() {
                request = request.with_mirrors(mirror);
            }
            if let Some(hex) = checksum {
                let algorithm: HashAlgorithm = algorithm.parse()?;
                request = request.with_checksum(hex, algorithm);
            }

            let id = orchestrator.start_download(request).await?;
            run_until_done(&orchestrator, id).await
        }
        Command::Resume { id } => {
            let id = parse_id(&id)?;
            orchestrator.resume_download(id).await?;
            run_until_done(&orchestrator, id).await
        }
        Command::List => {
            for snapshot in orchestrator.list_progress().await? {
                println!(
                    "{}  {:>11}  {:>6.1}%  {}",
                    snapshot.id,
                    snapshot.status.to_string(),
                    snapshot.percentage,
                    format_bytes(snapshot.downloaded_bytes),
                );
            }
            Ok(())
        }
        Command::Remove { id } => {
            let id = parse_id(&id)?;
            orchestrator.delete_download(id).await?;
            println!("{} record removed", style("::").cyan().bold());
            Ok(())
        }
    }
}

fn parse_id(s: &str) -> Result<DownloadId> {
    Ok(DownloadId(
        Uuid::parse_str(s).map_err(|_| anyhow!("invalid download id '{}'", s))?,
    ))
}

/// Render progress until the download reaches a terminal state. Ctrl-C
/// pauses so a later `resume` picks up where this run stopped.
async fn run_until_done(orchestrator: &DownloadOrchestrator, id: DownloadId) -> Result<()> {
    let mut events = orchestrator.subscribe();

    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.cyan} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {bytes_per_sec} {msg}")
            .unwrap()
            .progress_chars("=>-"),
    );

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(DownloadEvent::Progress { snapshot }) if snapshot.id == id => {
                        if let Some(total) = snapshot.total_bytes {
                            pb.set_length(total);
                        }
                        pb.set_position(snapshot.downloaded_bytes);
                    }
                    Ok(DownloadEvent::Completed { id: done, path }) if done == id => {
                        pb.finish_and_clear();
                        println!(
                            "{} saved to {}",
                            style("::").cyan().bold(),
                            style(path).bold()
                        );
                        return Ok(());
                    }
                    Ok(DownloadEvent::Failed { id: failed, error }) if failed == id => {
                        pb.finish_and_clear();
                        return Err(anyhow!("download failed: {}", error));
                    }
                    Ok(DownloadEvent::Cancelled { id: cancelled }) if cancelled == id => {
                        pb.finish_and_clear();
                        println!("{} cancelled", style("::").yellow().bold());
                        return Ok(());
                    }
                    Ok(DownloadEvent::FailedOver { segment_index, new_url, .. }) => {
                        pb.set_message(format!("segment {} -> {}", segment_index, new_url));
                    }
                    Ok(_) => {}
                    Err(_) => {
                        // Lagged or closed: fall back to polling the status
                        let status = orchestrator.get_status(id).await;
                        if status.is_terminal() || status == DownloadStatus::Paused {
                            pb.finish_and_clear();
                            return Ok(());
                        }
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                pb.finish_and_clear();
                orchestrator.pause_download(id).await?;
                println!(
                    "{} paused; resume with: parafetch resume {}",
                    style("::").yellow().bold(),
                    id
                );
                return Ok(());
            }
        }
    }
}

fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

//! CLI for the MDM media download manager.

mod commands;
mod console;
mod control_socket;

use anyhow::Result;
use clap::{Parser, Subcommand};
use mdm_core::config;
use std::path::PathBuf;

use commands::{
    run_add, run_batch, run_cancel_batch, run_clear, run_engine, run_job_action,
    run_remove_batch, run_status, AddOptions, JobAction,
};

/// Top-level CLI for the MDM media download manager.
#[derive(Debug, Parser)]
#[command(name = "mdm")]
#[command(about = "MDM: queue and supervise media downloads (yt-dlp / ffmpeg)", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Run the engine: download queued jobs and serve control requests.
    Run {
        /// Run up to N jobs concurrently (default from config).
        #[arg(long, value_name = "N")]
        jobs: Option<usize>,
        /// Keep running when the queue is empty.
        #[arg(long)]
        watch: bool,
    },

    /// Queue a single download.
    Add {
        /// Page URL or stream playlist (.m3u8).
        source: String,
        /// Output directory (default: current directory).
        #[arg(long, value_name = "DIR")]
        dir: Option<PathBuf>,
        /// Output file name without extension.
        #[arg(long)]
        name: Option<String>,
        /// Job identifier (default: generated).
        #[arg(long)]
        id: Option<String>,
        /// Extract audio (mp3) instead of video.
        #[arg(long)]
        audio: bool,
        /// Quality hint, e.g. 1080p for video or 0-9 for audio.
        #[arg(long, value_name = "Q")]
        quality: Option<String>,
        /// Copy a stream playlist into mp4 with the remux tool.
        #[arg(long)]
        remux: bool,
        /// Without --name, name the file after the title the fetch tool reports.
        #[arg(long)]
        lookup_title: bool,
    },

    /// Queue a playlist: a playlist URL (listed by the fetch tool) or a TOML manifest.
    Batch {
        /// Playlist URL or path to a manifest.
        source: String,
        /// Output directory (default: current directory; overrides the manifest).
        #[arg(long, value_name = "DIR")]
        dir: Option<PathBuf>,
    },

    /// Pause a pending or running job.
    Pause {
        /// Job identifier.
        id: String,
    },

    /// Resume a paused job.
    Resume {
        /// Job identifier.
        id: String,
    },

    /// Cancel a job: stop it, delete partial files and forget it.
    Cancel {
        /// Job identifier.
        id: String,
    },

    /// Queue a failed job again.
    Retry {
        /// Job identifier.
        id: String,
    },

    /// Drop a completed or failed job from history (files are kept).
    Remove {
        /// Job identifier.
        id: String,
    },

    /// Drop every completed and failed job from history.
    Clear,

    /// Cancel every unfinished member of a batch.
    CancelBatch {
        /// Batch (playlist) identifier.
        batch_id: String,
    },

    /// Forget a batch. Its submitted jobs stay in the queue as plain jobs.
    RemoveBatch {
        /// Batch (playlist) identifier.
        batch_id: String,
    },

    /// Show all jobs (and batches, when an instance is running).
    Status,
}

impl CliCommand {
    pub async fn run_from_args() -> Result<()> {
        let cli = Cli::parse();
        let cfg = config::load_or_init()?;
        tracing::debug!("loaded config: {:?}", cfg);

        match cli.command {
            CliCommand::Run { jobs, watch } => run_engine(&cfg, jobs, watch).await?,
            CliCommand::Add {
                source,
                dir,
                name,
                id,
                audio,
                quality,
                remux,
                lookup_title,
            } => {
                let dir = match dir {
                    Some(d) => d,
                    None => std::env::current_dir()?,
                };
                let opts = AddOptions {
                    dir,
                    name,
                    id,
                    audio,
                    quality,
                    remux,
                    lookup_title,
                };
                run_add(&cfg, &source, opts).await?;
            }
            CliCommand::Batch { source, dir } => run_batch(&cfg, &source, dir).await?,
            CliCommand::Pause { id } => run_job_action(&cfg, JobAction::Pause, &id).await?,
            CliCommand::Resume { id } => run_job_action(&cfg, JobAction::Resume, &id).await?,
            CliCommand::Cancel { id } => run_job_action(&cfg, JobAction::Cancel, &id).await?,
            CliCommand::Retry { id } => run_job_action(&cfg, JobAction::Retry, &id).await?,
            CliCommand::Remove { id } => run_job_action(&cfg, JobAction::Remove, &id).await?,
            CliCommand::Clear => run_clear(&cfg).await?,
            CliCommand::CancelBatch { batch_id } => run_cancel_batch(&cfg, &batch_id).await?,
            CliCommand::RemoveBatch { batch_id } => run_remove_batch(&cfg, &batch_id).await?,
            CliCommand::Status => run_status().await?,
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests;

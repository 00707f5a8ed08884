//! Logging initialization and startup diagnostics
//!
//! This module provides:
//! - Logger initialization (console + file)
//! - A startup summary of the pipeline configuration

use anyhow::Result;
use simplelog::*;
use std::fs::File;

use crate::core::config::{self, PipelineConfig};

/// Initialize logger for both console and file output
///
/// # Arguments
/// * `log_file_path` - Path to the log file
///
/// # Returns
/// * `Ok(())` - Logger initialized successfully
/// * `Err(anyhow::Error)` - Failed to create the file or a logger was already set
pub fn init_logger(log_file_path: &str) -> Result<()> {
    let log_file = File::create(log_file_path).map_err(|e| anyhow::anyhow!("Failed to create log file: {}", e))?;

    CombinedLogger::init(vec![
        TermLogger::new(
            LevelFilter::Info,
            Config::default(),
            TerminalMode::Mixed,
            ColorChoice::Auto,
        ),
        WriteLogger::new(LevelFilter::Info, Config::default(), log_file),
    ])
    .map_err(|e| anyhow::anyhow!("Failed to initialize logger: {}", e))?;

    Ok(())
}

/// Logs the effective pipeline configuration at startup.
pub fn log_pipeline_configuration(pipeline: &PipelineConfig) {
    log::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    log::info!("Pipeline configuration");
    log::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    log::info!("  yt-dlp:        {}", config::YTDL_BIN.as_str());
    log::info!("  ffmpeg:        {}", config::FFMPEG_BIN.as_str());
    log::info!("  temp dir:      {}", pipeline.temp_dir.display());
    log::info!(
        "  concurrency:   {} global, {} per user",
        pipeline.max_concurrent,
        pipeline.max_per_user
    );
    log::info!(
        "  fetch retry:   {} attempts, base {:?}",
        pipeline.fetch_retry.max_attempts,
        pipeline.fetch_retry.initial_delay
    );
    log::info!("  job deadline:  {:?}", pipeline.job_timeout);
    log::info!(
        "  delivery cap:  {:.1} MB",
        pipeline.max_delivery_size as f64 / (1024.0 * 1024.0)
    );
    if config::BOT_TOKEN.is_empty() {
        log::warn!("BOT_TOKEN is not set; the bot cannot connect to Telegram");
    }
}

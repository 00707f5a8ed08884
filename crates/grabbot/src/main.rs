use anyhow::Result;
use dotenvy::dotenv;
use std::sync::Arc;
use std::time::Duration;
use teloxide::prelude::*;

use grabcore::conversion::FfmpegTool;
use grabcore::core::utils::format_duration;
use grabcore::core::{config, init_logger, log_pipeline_configuration, metrics, PipelineConfig};
use grabcore::download::workspace;
use grabcore::download::{Collaborators, FormatResolver, HttpStreamSource, JobQueue, YtDlpBackend};

mod cli;
mod metrics_server;
mod telegram;

use cli::{Cli, Commands};
use telegram::{create_bot, schema, setup_bot_commands, HandlerDeps, TelegramTransport};

/// How long running jobs get to wind down after Ctrl-C
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();

    std::panic::set_hook(Box::new(|panic_info| {
        log::error!("Panic caught: {:?}", panic_info);
        if let Some(location) = panic_info.location() {
            log::error!("Panic at {}:{}:{}", location.file(), location.line(), location.column());
        }
    }));

    let _ = dotenv();
    init_logger(&config::LOG_FILE_PATH)?;

    match cli.command {
        Some(Commands::Run) => run_bot().await,
        Some(Commands::PurgeTemp) => run_purge_temp().await,
        Some(Commands::Info { url, json }) => run_cli_info(url, json).await,
        None => {
            log::info!("No command specified, running bot in default mode");
            run_bot().await
        }
    }
}

async fn run_bot() -> Result<()> {
    log::info!("Starting grabbot v{}", env!("CARGO_PKG_VERSION"));
    metrics::init_metrics();

    let bot = create_bot()?;
    let me = bot.get_me().await?;
    log::info!("Logged in as @{}", me.username());

    let pipeline = PipelineConfig::default();
    log_pipeline_configuration(&pipeline);

    let transport = Arc::new(TelegramTransport::new(bot.clone()));
    let collaborators = Collaborators {
        source: Arc::new(HttpStreamSource::default()),
        tool: Arc::new(FfmpegTool::default()),
        transport: transport.clone(),
    };
    let queue = JobQueue::start(pipeline, collaborators).await?;
    let resolver = Arc::new(FormatResolver::new(Arc::new(YtDlpBackend::default())));

    let metrics_port = *config::METRICS_PORT;
    let metrics_queue = queue.clone();
    tokio::spawn(async move {
        if let Err(e) = metrics_server::start_metrics_server(metrics_port, metrics_queue).await {
            log::error!("Metrics server error: {}", e);
        }
    });

    if let Err(e) = setup_bot_commands(&bot).await {
        log::warn!("Failed to set bot commands: {}", e);
    }

    let deps = HandlerDeps::new(queue.clone(), resolver, transport, me.user.username.clone(), me.id);
    Dispatcher::builder(bot, schema(deps))
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    log::info!("Dispatcher stopped, draining jobs");
    queue.shutdown(SHUTDOWN_GRACE).await;
    Ok(())
}

async fn run_purge_temp() -> Result<()> {
    let removed = workspace::purge_all(&config::TEMP_FILES_DIR).await?;
    println!("Removed {} entr(ies) from {}", removed, config::TEMP_FILES_DIR.display());
    Ok(())
}

async fn run_cli_info(url: String, json: bool) -> Result<()> {
    let resolver = FormatResolver::new(Arc::new(YtDlpBackend::default()));
    let media = resolver
        .resolve(&url)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to resolve {}: {}", url, e))?;

    if json {
        let formats: Vec<serde_json::Value> = media
            .formats
            .iter()
            .map(|f| {
                serde_json::json!({
                    "id": f.id,
                    "kind": f.kind.to_string(),
                    "container": f.container,
                    "video_codec": f.video_codec,
                    "audio_codec": f.audio_codec,
                    "width": f.width,
                    "height": f.height,
                    "bitrate_kbps": f.bitrate_kbps,
                    "estimated_size": f.estimated_size,
                })
            })
            .collect();
        let body = serde_json::json!({
            "url": media.url.as_str(),
            "title": media.title,
            "uploader": media.uploader,
            "duration_secs": media.duration_secs,
            "formats": formats,
        });
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    println!("🎬 {}", media.title);
    if let Some(uploader) = &media.uploader {
        println!("👤 {}", uploader);
    }
    if let Some(duration) = media.duration_secs {
        println!("⏱  {}", format_duration(duration.round() as u64));
    }
    println!();
    for format in &media.formats {
        println!("{:>12}  {:<12} {}", format.id, format.kind.to_string(), format.label());
    }
    Ok(())
}

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use stream_warden::config::WardenConfig;
use stream_warden::database::{self, SqlitePersistence};
use stream_warden::events::EventSink;
use stream_warden::locator::{HlsProbeExtractor, LocatorService, PluginManager};
use stream_warden::logging;
use stream_warden::notification::{NoopNotifier, Notifier, WebhookNotifier};
use stream_warden::recorder::{FfmpegBackend, RecordingService};
use stream_warden::utils::fs;
use stream_warden::warden::{QuotaLimits, Warden, WardenParts};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = WardenConfig::from_env().context("loading configuration")?;

    let (_logging, _guard) = logging::init_logging(&config.log_dir, config.log_filter.as_deref())
        .context("initializing logging")?;

    fs::ensure_dir_all(&config.recording_dir).await?;
    fs::ensure_dir_all(&config.archive_dir).await?;

    let pool = database::init_pool(&config.database_url).await?;
    database::run_migrations(&pool).await?;

    let manager = Arc::new(PluginManager::new());
    for plugin in &config.plugins {
        let extractor = Arc::new(HlsProbeExtractor::new(&plugin.pattern)?);
        let locator = Arc::new(LocatorService::new(
            plugin.name.clone(),
            extractor,
            config.poll_interval(),
        ));
        manager.register(plugin.name.clone(), locator)?;
    }

    let backend = FfmpegBackend::new(config.ffmpeg_path.clone())
        .with_input_args(config.ffmpeg_input_args.clone())
        .with_output_args(config.ffmpeg_output_args.clone());
    let recorder = RecordingService::new(Arc::new(backend), config.recorder_config());

    let notifier: Arc<dyn Notifier> = match config.webhook_config() {
        Some(webhook) => Arc::new(WebhookNotifier::new(webhook)),
        None => Arc::new(NoopNotifier),
    };

    let warden = Warden::new(WardenParts {
        manager,
        recorder,
        persistence: Arc::new(SqlitePersistence::new(pool.clone())),
        notifier,
        events: EventSink::new(),
        recording_dir: config.recording_dir.clone(),
        disk_check_interval: config.disk_check_interval(),
        quotas: QuotaLimits {
            instances: config.instance_quota,
            storage_bytes: config.storage_quota_bytes,
            download_speed: config.download_speed_quota,
        },
    })?;

    let summary = warden.restore().await.context("restoring state")?;
    info!(
        plugins = summary.plugins,
        sources = summary.sources,
        archives = summary.archives,
        "stream-warden initialized"
    );

    warden.start();

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutdown requested");

    warden.stop().await;
    pool.close().await;
    Ok(())
}

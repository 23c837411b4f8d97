use anyhow::{Context, Result};
use clap::Parser;
use omniroster::config::{self, Config};
use omniroster::data::{Platform, SessionKnowledge};
use omniroster::integrations::metadata_cache::MetadataCache;
use omniroster::integrations::resonite::ResoniteFactory;
use omniroster::integrations::vrchat::VRChatFactory;
use omniroster::monitor::{CommunicatorFactory, MonitoringOrchestrator};
use omniroster::registry::LiveRegistry;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "omniroster")]
#[command(about = "Live presence and session aggregator for Resonite and VRChat")]
#[command(version)]
struct Args {
    /// Initialize configuration
    #[arg(long)]
    init: bool,

    /// Path to config file
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Only monitor these platforms (default: all enabled in config)
    #[arg(long = "platform", short)]
    platforms: Vec<String>,
}

struct Monitor {
    orchestrator: MonitoringOrchestrator,
    snapshot_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("omniroster=info".parse()?),
        )
        .init();

    if args.init {
        config::init_wizard().await?;
        return Ok(());
    }

    let config = config::load(args.config.as_deref())?;
    let platforms = selected_platforms(&config, &args.platforms)?;
    if platforms.is_empty() {
        anyhow::bail!("No platform enabled. Run `omniroster --init` or edit the config file.");
    }

    let registry = Arc::new(LiveRegistry::new());
    log_notifications(&registry);

    let mut monitors = Vec::new();
    for platform in platforms {
        monitors.push(build_monitor(&config, platform, Arc::clone(&registry))?);
    }

    for monitor in &monitors {
        monitor.orchestrator.start_monitoring().await?;
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("Shutting down");

    for monitor in &monitors {
        monitor.orchestrator.stop_monitoring().await;
        if let Some(path) = &monitor.snapshot_path {
            if let Err(e) = monitor.orchestrator.cache().save_to_path(path) {
                tracing::warn!("Failed to save metadata cache: {:#}", e);
            }
        }
    }

    tracing::info!(
        "Tracked {} users and {} sessions",
        registry.user_count(),
        registry.session_count()
    );
    Ok(())
}

fn selected_platforms(config: &Config, names: &[String]) -> Result<Vec<Platform>> {
    if names.is_empty() {
        return Ok(config.enabled_platforms());
    }

    let mut platforms = Vec::new();
    for name in names {
        let platform =
            Platform::from_name(name).with_context(|| format!("Unknown platform: {name}"))?;
        if !platforms.contains(&platform) {
            platforms.push(platform);
        }
    }
    Ok(platforms)
}

fn build_monitor(config: &Config, platform: Platform, registry: Arc<LiveRegistry>) -> Result<Monitor> {
    let snapshot_path = if config.cache.enabled {
        Some(config.cache.snapshot_path(platform)?)
    } else {
        None
    };

    let cache = match &snapshot_path {
        Some(path) => match MetadataCache::load_from_path(path) {
            Ok(cache) => cache,
            Err(e) => {
                tracing::warn!("Ignoring unreadable metadata cache: {:#}", e);
                MetadataCache::new()
            }
        },
        None => MetadataCache::new(),
    };

    let attempts = config.monitoring.rest_max_attempts;
    let factory: Arc<dyn CommunicatorFactory> = match platform {
        Platform::Resonite => Arc::new(ResoniteFactory::new(config.resonite.clone(), attempts)),
        Platform::VRChat => Arc::new(VRChatFactory::new(config.vrchat.clone(), attempts)),
    };

    Ok(Monitor {
        orchestrator: MonitoringOrchestrator::new(
            platform,
            factory,
            registry,
            Arc::new(cache),
            config.monitoring.refresh_interval(),
        ),
        snapshot_path,
    })
}

/// Log registry notifications to stdout via tracing
fn log_notifications(registry: &LiveRegistry) {
    registry.on_user_updated(|user| {
        let session = user
            .main_session
            .as_ref()
            .map(|s| match &s.knowledge {
                SessionKnowledge::Known(known) => known
                    .name
                    .clone()
                    .or_else(|| known.space_name.clone())
                    .unwrap_or_else(|| known.session_id.clone()),
                other => other.label().to_string(),
            })
            .unwrap_or_else(|| "-".to_string());

        tracing::info!(
            "[{}] {} ({}) status={:?} session={}",
            user.platform,
            user.display_name.as_deref().unwrap_or("?"),
            user.account_id,
            user.online_status,
            session
        );
    });

    registry.on_session_updated(|session| {
        tracing::info!(
            "[{}] session {} {} in {} ({}/{})",
            session.platform,
            session.id,
            session.name.as_deref().unwrap_or("?"),
            session.space_name.as_deref().unwrap_or("?"),
            session
                .attendance
                .map(|n| n.to_string())
                .unwrap_or_else(|| "?".to_string()),
            session
                .capacity
                .map(|n| n.to_string())
                .unwrap_or_else(|| "?".to_string()),
        );
    });
}

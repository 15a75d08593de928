//! Admission Gate - HTTP request admission pipeline
//!
//! Serves the application routes behind fixed-window rate limiting, abusive
//! content detection and suspicious-activity blocking, with an admin API for
//! rules and unblocking. Configuration hot-reloads without a restart.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use admission_gate::admin::AdminAuthState;
use admission_gate::clock::system_clock;
use admission_gate::config::{AdmissionConfig, ConfigManager, ConfigReloadEvent};
use admission_gate::{
    application_routes, build_router_with_auth, run_http_listener, AdmissionPipeline, AuditEvent,
    AuditLogger,
};

/// Admission Gate - rate limiting, abuse detection and suspicious-activity blocking
#[derive(Parser, Debug, Clone)]
#[command(name = "admission-gate")]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "admission-gate.toml", env = "ADMISSION_CONFIG")]
    config: PathBuf,

    /// Override listener port
    #[arg(long, env = "ADMISSION_PORT")]
    port: Option<u16>,

    /// Override data directory for persisted state
    #[arg(long, env = "ADMISSION_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "ADMISSION_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable JSON log format
    #[arg(long, env = "ADMISSION_JSON_LOGS")]
    json_logs: bool,

    /// Enable configuration file watching for hot-reload
    #[arg(long, env = "ADMISSION_WATCH_CONFIG")]
    watch_config: bool,

    /// Run configuration validation only (don't start server)
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration before logging so the file can set the level
    let (config_manager, mut reload_rx) = ConfigManager::new(&args.config)?;
    let config_manager = Arc::new(config_manager);

    let mut config = (*config_manager.get()).clone();
    apply_cli_overrides(&mut config, &args);

    let json_logs = args.json_logs || config.logging.format == "json";
    init_logging(&config.logging.level, json_logs)?;

    info!("Starting Admission Gate v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {:?}", args.config);

    config.validate()?;
    info!("Configuration validated successfully");

    if args.validate {
        info!("Configuration validation successful, exiting");
        return Ok(());
    }

    config_manager.set(config.clone());
    let addr = config.server.socket_addr()?;

    let audit = Arc::new(AuditLogger::new(&config.logging));
    let pipeline = Arc::new(AdmissionPipeline::from_config(
        &config,
        system_clock(),
        audit.clone(),
    ));
    pipeline
        .seed_rules(&config.rate_limiting.rules)
        .map_err(|e| anyhow::anyhow!("Failed to apply configured rate rules: {}", e))?;

    // Periodic sweeps: expired rate records and idle request windows
    let cleanup_interval = Duration::from_secs(config.rate_limiting.cleanup_interval_secs);
    let cleanup_handle = pipeline.limiter().spawn_cleanup_task(cleanup_interval);
    let window_handle = {
        let tracker = pipeline.tracker().clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cleanup_interval);
            loop {
                ticker.tick().await;
                tracker.prune_idle_windows();
            }
        })
    };

    if args.watch_config {
        config_manager.start_watching()?;
    }

    // Apply reloaded quotas and thresholds to the running services
    {
        let pipeline = pipeline.clone();
        let audit = audit.clone();
        let config_manager = config_manager.clone();
        let args = args.clone();
        let mut seeded_rules = config.rate_limiting.rules.clone();
        tokio::spawn(async move {
            while let Some(event) = reload_rx.recv().await {
                match event {
                    ConfigReloadEvent::ConfigReloaded(reloaded) => {
                        let mut new_config = (*reloaded).clone();
                        apply_cli_overrides(&mut new_config, &args);
                        pipeline.apply_config(&new_config);

                        let rules = &new_config.rate_limiting.rules;
                        match pipeline.seed_changed_rules(&seeded_rules, rules) {
                            Ok(written) => {
                                if written > 0 {
                                    info!("Applied {} changed rate rules", written);
                                }
                                seeded_rules = rules.clone();
                            }
                            Err(e) => error!("Failed to apply reloaded rate rules: {}", e),
                        }

                        config_manager.set(new_config);
                        audit.log(AuditEvent::ConfigReload { success: true });
                    }
                    ConfigReloadEvent::ReloadFailed(reason) => {
                        warn!("Configuration reload failed, keeping current settings: {}", reason);
                        audit.log(AuditEvent::ConfigReload { success: false });
                    }
                }
            }
        });
    }

    let admin_auth = Arc::new(AdminAuthState::new(&config.admin, audit.clone()));
    let eviction_handle = admin_auth.spawn_eviction_task();
    let app = build_router_with_auth(pipeline.clone(), &config, admin_auth, application_routes());

    print_startup_summary(&config);

    let server = run_http_listener(addr, app, async {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received Ctrl+C, initiating graceful shutdown...");
            }
            _ = shutdown_signal() => {
                info!("Received shutdown signal, initiating graceful shutdown...");
            }
        }
    });

    if let Err(e) = server.await {
        error!("HTTP listener error: {}", e);
    }

    info!("Shutting down...");
    config_manager.stop_watching();
    if let Err(e) = pipeline.flush() {
        error!("Failed to persist admission state on shutdown: {}", e);
    }
    cleanup_handle.abort();
    window_handle.abort();
    eviction_handle.abort();

    info!("Admission Gate shutdown complete");
    Ok(())
}

fn apply_cli_overrides(config: &mut AdmissionConfig, args: &Args) {
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(ref data_dir) = args.data_dir {
        config.storage.data_dir = data_dir.clone();
    }
    if let Some(ref level) = args.log_level {
        config.logging.level = level.clone();
    }
}

/// Initialize logging
fn init_logging(level: &str, json: bool) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .try_init()?;
    }

    Ok(())
}

/// Wait for OS shutdown signal
#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigquit) =
        match (signal(SignalKind::terminate()), signal(SignalKind::quit())) {
            (Ok(term), Ok(quit)) => (term, quit),
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to install signal handlers: {}", e);
                std::future::pending::<()>().await;
                return;
            }
        };

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
        _ = sigquit.recv() => {
            info!("Received SIGQUIT");
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    // Ctrl+C is handled separately
    std::future::pending::<()>().await;
}

/// Print startup summary
fn print_startup_summary(config: &AdmissionConfig) {
    let default = config.rate_limiting.default_rule();
    info!("Listening on:      {}:{}", config.server.bind_address, config.server.port);
    info!("Data directory:    {:?}", config.storage.data_dir);
    info!(
        "Default rule:      {} requests / {} ms",
        default.max_requests, default.window_ms
    );
    info!("Configured rules:  {}", config.rate_limiting.rules.len());
    info!(
        "Suspicion:         {} failures, {} requests / {} ms spike",
        config.suspicious.max_failures,
        config.suspicious.spike_threshold,
        config.suspicious.spike_window_ms
    );
    info!("Admin prefix:      {}", config.admin.path_prefix);
    info!(
        "Emergency unblock: {}",
        if config.admin.unblock_secret.is_some() {
            "enabled"
        } else {
            "disabled"
        }
    );
}

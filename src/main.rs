//! mentor-shield - cached, failure-tolerant mentor directory

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use mentor_shield::{
    cache::MentorCache,
    cli::{Cli, Command},
    config::Config,
    setup_tracing,
    source::HttpDataSource,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Some(addr) = cli.metrics_addr {
        #[cfg(feature = "metrics")]
        if let Err(e) = mentor_shield::metrics::install_prometheus(addr) {
            error!("{e}");
            return ExitCode::FAILURE;
        }
        #[cfg(not(feature = "metrics"))]
        tracing::warn!(%addr, "Built without the metrics feature; ignoring --metrics-addr");
    }

    match cli.command {
        Command::Config => print_config(&config),
        Command::Warm => run_warm(&config).await,
        Command::Fetch { id } => run_fetch(&config, &id).await,
        Command::Run => run_keep_warm(&config).await,
    }
}

fn print_config(config: &Config) -> ExitCode {
    match serde_yaml::to_string(config) {
        Ok(yaml) => {
            print!("{yaml}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Failed to serialize configuration: {e}");
            ExitCode::FAILURE
        }
    }
}

fn build_cache(config: &Config) -> Option<Arc<MentorCache>> {
    match HttpDataSource::new(&config.source) {
        Ok(source) => Some(Arc::new(MentorCache::new(Arc::new(source), config))),
        Err(e) => {
            error!("Failed to create data source: {e}");
            None
        }
    }
}

/// Populate once and report
async fn run_warm(config: &Config) -> ExitCode {
    let mut config = config.clone();
    config.cache.background_refresh = false;
    let Some(cache) = build_cache(&config) else {
        return ExitCode::FAILURE;
    };

    let result = cache.initialize().await;
    let code = match result {
        Ok(()) => {
            let records = cache.get().await.map(|r| r.len()).unwrap_or_default();
            println!("Loaded {records} mentor(s)");
            println!("Breaker: {}", cache.breaker_status());
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Failed to populate cache: {e}");
            println!("Breaker: {}", cache.breaker_status());
            ExitCode::FAILURE
        }
    };
    cache.shutdown().await;
    code
}

/// Read one mentor through the cache
async fn run_fetch(config: &Config, id: &str) -> ExitCode {
    let mut config = config.clone();
    config.cache.background_refresh = false;
    let Some(cache) = build_cache(&config) else {
        return ExitCode::FAILURE;
    };

    let code = match cache.get_one(id).await {
        Ok(record) => match serde_json::to_string_pretty(&record) {
            Ok(json) => {
                println!("{json}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Failed to serialize record: {e}");
                ExitCode::FAILURE
            }
        },
        Err(e) => {
            eprintln!("Failed to fetch {id}: {e} (status {})", e.status_code());
            ExitCode::FAILURE
        }
    };
    cache.shutdown().await;
    code
}

/// Keep the directory warm until ctrl-c
async fn run_keep_warm(config: &Config) -> ExitCode {
    let Some(cache) = build_cache(config) else {
        return ExitCode::FAILURE;
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        ttl_ms = config.cache.ttl.as_millis(),
        "Starting mentor-shield"
    );

    if let Err(e) = cache.initialize().await {
        error!("Failed to populate cache: {e}");
        return ExitCode::FAILURE;
    }
    if !config.cache.background_refresh {
        cache.start_background_refresh();
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {e}");
    }

    cache.shutdown().await;
    match serde_json::to_string(&cache.stats()) {
        Ok(stats) => info!(stats = %stats, "Shutdown complete"),
        Err(_) => info!("Shutdown complete"),
    }
    ExitCode::SUCCESS
}

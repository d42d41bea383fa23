//! toolhost - plugin and tool registry runtime
//!
//! This is the main entry point for the toolhost binary.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use toolhost::config::Config;
use toolhost::logging::AuditLogger;
use toolhost::ToolhostError;
use toolhost::plugins::{
    BuiltinImporter, LoadResult, PluginLoader, PluginManager, PluginRequest, ProcessImporter,
    ToolRegistry, ToolTable,
};

mod cli;

use cli::{Args, Command};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    init_logging(args.debug);

    info!("Starting toolhost v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = load_config(&args).context("Failed to load configuration")?;

    let table = Arc::new(ToolTable::new());
    let manager = build_manager(&config, table.clone()).context("Failed to set up plugins")?;

    if let Err(e) = manager.install_admin_tools() {
        warn!("Plugin administration tools unavailable: {}", e);
    }

    let ok = match args.command {
        Command::List => {
            let response = manager.list_available();
            println!("{}", response.message);
            response.success
        }
        Command::Status { json } => {
            startup(&manager).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&manager.status_info())?);
            } else {
                println!("{}", manager.status().message);
            }
            true
        }
        Command::Load { name } => {
            let response = manager.load(&name).await;
            println!("{}", response.message);
            response.success
        }
        Command::Call { tool, params } => {
            startup(&manager).await?;
            let params: HashMap<String, serde_json::Value> = params
                .into_iter()
                .map(|(k, v)| (k, serde_json::Value::String(v)))
                .collect();
            let response = table.dispatch(PluginRequest::new(&tool, params)).await;
            println!("{}", response.display_text());
            response.success
        }
        Command::Watch { interval } => {
            let secs = interval.unwrap_or(config.watch.interval_secs);
            if secs == 0 {
                bail!("Watch interval must be at least one second");
            }
            startup(&manager).await?;
            println!("{}", manager.status().message);
            watch(&manager, Duration::from_secs(secs)).await;
            true
        }
    };

    for result in manager.loader().unload_all().await {
        if let Some(e) = result.error {
            warn!("Failed to unload {}: {}", result.plugin, e);
        }
    }
    manager.remove_admin_tools();

    info!("toolhost exited");
    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

/// Layered configuration with the command line's directory override on top
fn load_config(args: &Args) -> toolhost::Result<Config> {
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(dir) = &args.plugin_dir {
        config.plugins.directory = dir.clone();
    }
    Ok(config)
}

/// Wire the registry, importers and loader behind a manager
fn build_manager(config: &Config, table: Arc<ToolTable>) -> toolhost::Result<Arc<PluginManager>> {
    let registry = Arc::new(ToolRegistry::new(table, config.plugins.collision));
    let importer = BuiltinImporter::new()
        .with_fallback(Arc::new(ProcessImporter::new(config.plugins.call_timeout())));

    let loader = PluginLoader::new(config.plugins.clone(), Arc::new(importer), registry)
        .with_audit(AuditLogger::new(config.audit.clone()));

    loader.discovery().ensure_directory()?;

    Ok(Arc::new(PluginManager::new(Arc::new(loader))))
}

/// Load the plugins the configuration asks for
async fn startup(manager: &PluginManager) -> Result<(), ToolhostError> {
    let results = manager.loader().startup().await?;
    report_failures(&results);
    Ok(())
}

fn report_failures(results: &[LoadResult]) {
    for result in results {
        if let Some(e) = &result.error {
            warn!("{}", e);
        }
    }
}

/// Poll for source changes until interrupted
async fn watch(manager: &PluginManager, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    info!("Watching {:?} every {:?}", manager.loader().discovery().directory(), interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match manager.loader().reload_changed().await {
                    Ok(report) if report.is_empty() => {}
                    Ok(report) => println!("{}", report),
                    Err(e) => warn!("Change check failed: {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
        }
    }
}

/// Initialize the logging/tracing subsystem
fn init_logging(debug: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();
}

mod components;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use runkit::config::{Settings, Source, SourceInit, SourceRegistry};
use runkit::sources::{KvSource, KvSourceConfig};
use runkit::{Config, Orchestrator, RuntimeError, ShutdownOptions};

use crate::components::{CacheComponent, CacheSettings, Heartbeat, HeartbeatSettings};

/// Registry name of the distributed store source, also its bootstrap section.
const KV_SOURCE: &str = "kv";

/// runkit server - component runtime with layered configuration
#[derive(Parser)]
#[command(name = "runkit-server")]
#[command(about = "runkit server - component runtime with layered configuration")]
#[command(version = "0.1.0")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Application name used to namespace remote configuration
    #[arg(long, default_value = "runkit-server")]
    app: String,

    /// Print effective bootstrap settings (YAML) and exit
    #[arg(long)]
    print_config: bool,

    /// Log verbosity level (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server
    Run,
    /// Validate configuration and exit
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if !cli.config.is_file() {
        anyhow::bail!("config file does not exist: {}", cli.config.display());
    }

    let mut settings = Settings::load(&cli.config)?;
    apply_verbosity(&mut settings, cli.verbose);

    if cli.print_config {
        println!("Effective configuration:\n{}", settings.to_yaml()?);
        return Ok(());
    }

    runkit::logging::init_logging(&settings.logging, settings.debug)?;
    tracing::info!(app = %cli.app, env = %settings.env, "runkit server starting");

    let registry = source_registry();
    let config = Arc::new(Config::from_settings(
        cli.app.as_str(),
        &settings,
        &cli.config,
        &registry,
    )?);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_server(config).await,
        Commands::Check => check_config(&config, &cli.config).await,
    }
}

fn apply_verbosity(settings: &mut Settings, verbose: u8) {
    let level = match verbose {
        0 => return,
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    settings.logging.level = Some(level.to_owned());
}

/// Remote backends selectable with `source:` in the config file.
///
/// `kv` reads its connection settings from the bootstrap `kv` section. Built
/// with the `etcd` feature it talks to an etcd cluster; otherwise it falls back
/// to an in-process store whose contents end with the process.
fn source_registry() -> SourceRegistry {
    let mut registry = SourceRegistry::new();

    #[cfg(feature = "etcd")]
    registry.register(KV_SOURCE, |init: SourceInit| async move {
        let kv = kv_settings(&init).await?;
        let store = Arc::new(runkit::sources::EtcdKvStore::connect(&kv).await?);
        tracing::info!(prefix = %kv.prefix, "Using etcd config store");
        let source = KvSource::from_config(store, &kv, init.env, &init.app_name);
        Ok::<_, anyhow::Error>(Arc::new(source) as Arc<dyn Source>)
    });

    #[cfg(not(feature = "etcd"))]
    {
        let store = Arc::new(runkit::sources::MemoryKvStore::new());
        registry.register(KV_SOURCE, move |init: SourceInit| {
            let store = Arc::clone(&store);
            async move {
                let kv = kv_settings(&init).await?;
                tracing::warn!(
                    prefix = %kv.prefix,
                    "Using in-process KV config store; built without the etcd feature, values are not persisted"
                );
                let source = KvSource::from_config(store, &kv, init.env, &init.app_name);
                Ok::<_, anyhow::Error>(Arc::new(source) as Arc<dyn Source>)
            }
        });
    }

    registry
}

/// Read the `kv` bootstrap section over the defaults.
async fn kv_settings(init: &SourceInit) -> Result<KvSourceConfig> {
    let mut raw = serde_json::to_value(KvSourceConfig::default())?;
    if let Err(e) = init.bootstrap.scan(KV_SOURCE, &mut raw).await {
        if !e.is_not_found() {
            return Err(e.into());
        }
    }
    Ok(serde_json::from_value(raw)?)
}

async fn check_config(config: &Config, path: &Path) -> Result<()> {
    tracing::info!("Checking configuration...");
    let cache: CacheSettings = config.scan_or_default(CacheComponent::SECTION).await?;
    let heartbeat: HeartbeatSettings = config.scan_or_default(Heartbeat::SECTION).await?;
    println!("Configuration is valid: {}", path.display());
    println!("{}: {}", CacheComponent::SECTION, serde_json::to_string(&cache)?);
    println!("{}: {}", Heartbeat::SECTION, serde_json::to_string(&heartbeat)?);
    Ok(())
}

async fn run_server(config: Arc<Config>) -> Result<()> {
    let orchestrator = Orchestrator::new(config, ShutdownOptions::Signals)
        .register(CacheComponent::default())
        .register_cancel(Heartbeat);

    match orchestrator.run().await {
        Ok(()) => Ok(()),
        Err(RuntimeError::TaskFault(fault)) => {
            tracing::error!(task = fault.task(), backtrace = fault.backtrace(), "Re-raising task panic");
            match fault.take_payload() {
                Some(payload) => std::panic::resume_unwind(payload),
                None => Err(RuntimeError::TaskFault(fault).into()),
            }
        }
        Err(e) => Err(e.into()),
    }
}

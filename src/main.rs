//! CLI entry point: load configuration and the remote proxy registry, then
//! run the pool until `Ctrl-C`.

use clap::Parser;
use proxy_pool::{Config, PoolError, ProxyPool, Result};
use proxy_pool::registry::RemoteRegistry;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "proxy-pool")]
#[command(author = "Tsang")]
#[command(version = proxy_pool::VERSION)]
#[command(about = "Local proxy pool: dual-protocol listeners over a rotating remote proxy pool")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short = 'c', long = "config", default_value = "config.yaml")]
    config: PathBuf,

    /// Path to the remote proxy credential file (overrides config)
    #[arg(long = "proxy-file")]
    proxy_file: Option<PathBuf>,

    /// First local listener port (overrides config)
    #[arg(long = "port-base")]
    port_base: Option<u16>,

    /// Number of contiguous local listener ports (overrides config)
    #[arg(long = "port-count")]
    port_count: Option<u16>,

    /// Log level (overrides config and RUST_LOG)
    #[arg(long = "log-level")]
    log_level: Option<String>,

    /// Validate configuration and the proxy file, then exit
    #[arg(short = 't', long = "test")]
    test: bool,
}

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("proxy-pool-worker")
        .build()?;

    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match Config::load(args.config.to_str().unwrap_or("config.yaml")) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    init_tracing(args.log_level.as_deref().or(config.log_level.as_deref()));

    info!("proxy-pool v{}", proxy_pool::VERSION);

    if let Some(proxy_file) = args.proxy_file {
        config.proxy_file = proxy_file;
    }
    if let Some(port_base) = args.port_base {
        config.port_base = port_base;
    }
    if let Some(port_count) = args.port_count {
        config.port_count = port_count;
    }

    if let Err(e) = config.validate() {
        error!(error = %e, "invalid configuration");
        std::process::exit(1);
    }

    let registry = match RemoteRegistry::load(config.proxy_file_path()) {
        Ok(r) => r,
        Err(e) => {
            error!(error = %e, "failed to load remote proxy file");
            std::process::exit(1);
        }
    };
    info!(remotes = registry.count(), "loaded remote proxy registry");

    if args.test {
        info!("configuration test passed");
        return Ok(());
    }

    let pool = ProxyPool::new(config, registry);
    if let Err(e) = run(pool).await {
        error!(error = %e, "proxy pool exited with an error");
        // A listener bind failure surfaces as ConfigFatal and is a startup
        // failure (exit 1), distinct from a runtime failure after startup (exit 2).
        match e {
            PoolError::ConfigFatal(_) => std::process::exit(1),
            _ => std::process::exit(2),
        }
    }

    Ok(())
}

async fn run(pool: ProxyPool) -> Result<()> {
    pool.run().await
}

fn init_tracing(log_level_override: Option<&str>) {
    let filter = log_level_override
        .map(|lvl| format!("proxy_pool={},tower_http=info", lvl))
        .map(|directive| tracing_subscriber::EnvFilter::new(directive))
        .unwrap_or_else(tracing_subscriber::EnvFilter::from_default_env);

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();
}

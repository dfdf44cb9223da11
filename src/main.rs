use anyhow::Result;
use bulk_sender::config;
use bulk_sender::db;
use bulk_sender::pool::FreshConnections;
use bulk_sender::sending::{LoopSettings, SendingLoop};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Parser)]
#[command(author, version, about = "Send approved SMS batches at a fixed rate")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Override sending.messages_per_second
    #[arg(long)]
    messages_per_second: Option<u32>,

    /// Override sending.concurrent_workers
    #[arg(long)]
    concurrent_workers: Option<usize>,

    /// Keep sending until a stop signal arrives instead of running one cycle
    #[arg(long)]
    forever: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let mut cfg = config::load(Some(&args.config))?;
    if let Some(mps) = args.messages_per_second {
        cfg.sending.messages_per_second = mps;
    }
    if let Some(workers) = args.concurrent_workers {
        cfg.sending.concurrent_workers = workers;
    }
    config::validate(&cfg)?;

    let database_url = cfg.database_url();
    config::check_database_url(&database_url)?;
    let pool = db::init_pool(&database_url, 4).await?;
    db::run_migrations(&pool).await?;

    let factory = Arc::new(FreshConnections::from_config(&cfg, &database_url));
    let settings = LoopSettings::from_config(&cfg.sending);
    let mut sender = SendingLoop::new(settings, pool.clone(), factory);

    info!(
        messages_per_second = cfg.sending.messages_per_second,
        workers = cfg.sending.concurrent_workers,
        lock = ?cfg.lock.backend,
        transport = ?cfg.transport.kind,
        "starting bulk sender"
    );
    let outcome = sender.send(args.forever).await;
    pool.close().await;
    outcome
}

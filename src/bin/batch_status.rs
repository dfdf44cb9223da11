use anyhow::Result;
use bulk_sender::config;
use bulk_sender::db;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(about = "Print every batch with its sending progress")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Only show batches that still have unsent messages
    #[arg(long)]
    pending_only: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    let pool = db::init_pool(&cfg.database_url(), 1).await?;
    db::run_migrations(&pool).await?;

    let batches = db::list_batches(&pool).await?;
    if batches.is_empty() {
        println!("no batches");
    }
    for batch in batches {
        let progress = db::batch_progress(&pool, batch.id).await?;
        if args.pending_only && progress.unsent == 0 {
            continue;
        }
        let remaining = db::time_remaining(progress.unsent, cfg.sending.messages_per_second)
            .map(format_duration)
            .unwrap_or_else(|| "-".to_string());
        println!(
            "#{:<5} {:<30} {:<17} prio {:>3}  sent {}/{}  errors {}  remaining {}",
            batch.id,
            batch.name,
            batch.status.label(),
            batch.priority,
            progress.sent,
            progress.total,
            progress.errors,
            remaining,
        );
    }
    pool.close().await;
    Ok(())
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    match (secs / 3600, (secs % 3600) / 60, secs % 60) {
        (0, 0, s) => format!("{s}s"),
        (0, m, s) => format!("{m}m{s:02}s"),
        (h, m, s) => format!("{h}h{m:02}m{s:02}s"),
    }
}

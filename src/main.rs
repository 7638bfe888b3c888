use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use jobdigest::catalog::{SqlCatalog, SqlDirectory};
use jobdigest::config;
use jobdigest::db;
use jobdigest::model::NotificationKind;
use jobdigest::queue::DeliveryQueue;
use jobdigest::transport::HttpMailTransport;
use jobdigest::{DispatchContext, Processor};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/jobdigest.db", cfg.app.data_dir));

    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let transport = HttpMailTransport::from_config(&cfg)?;
    let sweep_interval = Duration::from_millis(cfg.app.sweep_interval_ms);

    let processor = Arc::new(Processor::new(DispatchContext {
        pool: pool.clone(),
        queue: Arc::new(DeliveryQueue::new()),
        catalog: Arc::new(SqlCatalog::new(pool.clone())),
        directory: Arc::new(SqlDirectory::new(pool)),
        transport: Arc::new(transport),
        cfg,
    }));

    processor.start();

    // Periodic sweep: enqueue a bulk batch whenever enough new postings
    // accumulated. Competes safely with admin triggers via the ledger.
    let sweeper = processor.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        loop {
            ticker.tick().await;
            if let Err(err) = sweeper.sweep(NotificationKind::JobBatch).await {
                error!(?err, "sweep failed");
            }
        }
    });

    info!("jobdigest processor running, ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    info!("shutting down");
    processor.stop().await;
    Ok(())
}

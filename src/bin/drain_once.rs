use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use jobdigest::catalog::{SqlCatalog, SqlDirectory};
use jobdigest::config;
use jobdigest::db;
use jobdigest::model::NotificationKind;
use jobdigest::queue::DeliveryQueue;
use jobdigest::transport::HttpMailTransport;
use jobdigest::{DispatchContext, DrainOutcome, Processor};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Drain pending notification deliveries once and exit"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Run the global eligibility sweep before draining
    #[arg(long)]
    sweep: bool,

    /// Purge delivered ledger rows older than this many days before exiting
    #[arg(long)]
    purge_older_than_days: Option<i64>,
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
    let processor = Processor::new(DispatchContext {
        pool: pool.clone(),
        queue: Arc::new(DeliveryQueue::new()),
        catalog: Arc::new(SqlCatalog::new(pool.clone())),
        directory: Arc::new(SqlDirectory::new(pool.clone())),
        transport: Arc::new(transport),
        cfg,
    });

    if args.sweep {
        match processor.sweep(NotificationKind::JobBatch).await? {
            Some(job_id) => info!(%job_id, "sweep enqueued a bulk job"),
            None => info!("sweep found nothing to send"),
        }
    }

    // Nothing else enqueues here, so a single manual drain processes every
    // job that is due; jobs in backoff are left for the next run.
    match processor.drain_now().await {
        DrainOutcome::Completed(summary) => info!(
            delivered = summary.delivered,
            retried = summary.retried,
            abandoned = summary.abandoned,
            expanded = summary.expanded,
            suppressed = summary.suppressed,
            "drain complete"
        ),
        DrainOutcome::AlreadyDraining => warn!("drain already in progress"),
    }

    let status = processor.status();
    if status.queue_depth > 0 {
        warn!(
            queue_depth = status.queue_depth,
            "jobs remain in backoff; run again later"
        );
    }

    let failures = db::recent_failures(&pool, 20).await?;
    for failure in &failures {
        warn!(
            recipient_id = ?failure.recipient_id,
            kind = failure.kind.as_str(),
            retry_count = failure.retry_count,
            last_error = failure.last_error.as_deref().unwrap_or("unknown"),
            "undelivered notification"
        );
    }

    if let Some(days) = args.purge_older_than_days {
        let purged = db::purge_delivered_older_than(&pool, days).await?;
        info!(purged, days, "retention cleanup done");
    }

    Ok(())
}

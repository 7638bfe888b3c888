//! The retrying delivery worker. One drain cycle pulls ready jobs, expands
//! bulk jobs into per-recipient deliveries, calls the transport, and writes
//! every outcome to the ledger. Job failures never escape the cycle.

use crate::catalog::{CatalogReader, RecipientDirectory};
use crate::config::{Config, Delivery};
use crate::db::{self, Pool};
use crate::eligibility;
use crate::model::{DeliveryJob, DeliveryTarget, LedgerKey, NotificationPayload, Recipient};
use crate::queue::DeliveryQueue;
use crate::transport::{render_message, MailTransport};
use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Everything a drain cycle needs. Shared by the controller and the
/// one-shot binary.
pub struct DispatchContext {
    pub pool: Pool,
    pub queue: Arc<DeliveryQueue>,
    pub catalog: Arc<dyn CatalogReader>,
    pub directory: Arc<dyn RecipientDirectory>,
    pub transport: Arc<dyn MailTransport>,
    pub cfg: Config,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub delivered: u64,
    pub retried: u64,
    pub abandoned: u64,
    /// Per-recipient jobs fanned out of bulk jobs this cycle.
    pub expanded: u64,
    /// Recipients skipped by the eligibility gate or the ledger claim.
    pub suppressed: u64,
    /// Most recent failure seen this cycle, for status reporting.
    pub last_error: Option<String>,
}

/// Exponential backoff for a failed attempt: `base * 2^(attempt-1)` capped
/// at the configured maximum. Rate-limited failures honor a longer floor.
pub fn backoff_delay(cfg: &Delivery, attempt: u32, rate_limited: bool) -> Duration {
    let shift = attempt.saturating_sub(1).min(16);
    let exp = cfg.base_backoff_seconds.saturating_mul(1u64 << shift);
    let mut secs = exp.min(cfg.max_backoff_seconds);
    if rate_limited {
        secs = secs.max(cfg.rate_limit_floor_seconds);
    }
    Duration::from_secs(secs)
}

/// One pass over the ready jobs. Runs until nothing is due.
pub async fn drain_cycle(ctx: &DispatchContext) -> DrainSummary {
    let mut summary = DrainSummary::default();

    loop {
        let Some(peeked) = ctx.queue.peek_ready(Utc::now()) else {
            break;
        };
        let job = match ctx.queue.begin_attempt(peeked.id) {
            Ok(job) => job,
            Err(err) => {
                // Invariant violation: fatal for this job only.
                error!(job_id = %peeked.id, ?err, "could not start attempt, dropping job");
                let _ = ctx.queue.abandon(peeked.id);
                summary.abandoned += 1;
                continue;
            }
        };

        if let Err(err) = process_job(ctx, &job, &mut summary).await {
            // Infrastructure failure mid-attempt (ledger write, directory
            // read). Retryable like a transport failure.
            error!(job_id = %job.id, kind = job.kind().as_str(), ?err, "attempt failed internally");
            db::record_failure(&ctx.pool, &job.ledger_key(), &err.to_string())
                .await
                .unwrap_or_else(|e| warn!(?e, "failed to record attempt failure"));
            summary.last_error = Some(err.to_string());
            retry_or_abandon(ctx, &job, false, &mut summary);
        }
    }

    summary
}

async fn process_job(
    ctx: &DispatchContext,
    job: &DeliveryJob,
    summary: &mut DrainSummary,
) -> Result<()> {
    match &job.target {
        DeliveryTarget::AllEligible => expand_bulk(ctx, job, summary).await,
        DeliveryTarget::Recipient(recipient) => deliver(ctx, job, recipient, summary).await,
    }
}

/// Fan a bulk job out into concrete per-recipient jobs, re-checking
/// eligibility per recipient so nobody who became ineligible since enqueue
/// gets a delivery. The sub-jobs are due immediately and processed later in
/// the same cycle, each with its own retry lifecycle.
async fn expand_bulk(
    ctx: &DispatchContext,
    job: &DeliveryJob,
    summary: &mut DrainSummary,
) -> Result<()> {
    let recipients = ctx.directory.list_active_recipients().await?;
    let mut expanded: u64 = 0;

    for recipient in recipients {
        let gate = eligibility::evaluate_for_recipient(
            &ctx.pool,
            ctx.catalog.as_ref(),
            &ctx.cfg.eligibility,
            &recipient,
            job.kind(),
            job.day,
        )
        .await?;
        if !gate.should_send {
            summary.suppressed += 1;
            continue;
        }

        let key = LedgerKey::recipient(recipient.id, job.kind(), job.day);
        if !db::reserve_notification(&ctx.pool, &key).await? {
            // Another trigger already claimed this recipient today.
            summary.suppressed += 1;
            continue;
        }

        let payload = NotificationPayload::new(job.kind(), gate.qualifying_ids);
        ctx.queue.enqueue(DeliveryJob::for_recipient(
            recipient,
            payload,
            job.day,
            Utc::now(),
        ));
        expanded += 1;
    }

    db::mark_delivered(&ctx.pool, &job.ledger_key(), expanded as i64).await?;
    ctx.queue.mark_done(job.id)?;
    summary.expanded += expanded;
    info!(job_id = %job.id, kind = job.kind().as_str(), expanded, "bulk job expanded");
    Ok(())
}

async fn deliver(
    ctx: &DispatchContext,
    job: &DeliveryJob,
    recipient: &Recipient,
    summary: &mut DrainSummary,
) -> Result<()> {
    let message = render_message(&job.payload, recipient);
    let key = job.ledger_key();

    match ctx.transport.send(&recipient.address, &message).await {
        Ok(()) => {
            // The mail is out; a retry here would breach the once-per-day
            // rule, so a failed ledger update is logged, not propagated.
            if let Err(err) = db::mark_delivered(&ctx.pool, &key, job.payload.count() as i64).await
            {
                error!(job_id = %job.id, ?err, "delivered but ledger update failed");
                summary.last_error = Some(err.to_string());
            }
            ctx.queue.mark_done(job.id)?;
            summary.delivered += 1;
            info!(
                job_id = %job.id,
                recipient_id = recipient.id,
                kind = job.kind().as_str(),
                postings = job.payload.count(),
                attempt = job.attempt,
                "notification delivered"
            );
        }
        Err(err) => {
            db::record_failure(&ctx.pool, &key, &err.to_string()).await?;
            summary.last_error = Some(err.to_string());
            if !err.is_retryable() {
                warn!(
                    job_id = %job.id,
                    recipient_id = recipient.id,
                    %err,
                    "non-retryable delivery failure, abandoning"
                );
                ctx.queue.abandon(job.id)?;
                summary.abandoned += 1;
            } else {
                warn!(
                    job_id = %job.id,
                    recipient_id = recipient.id,
                    attempt = job.attempt,
                    %err,
                    "delivery attempt failed"
                );
                retry_or_abandon(ctx, job, err.is_rate_limited(), summary);
            }
        }
    }
    Ok(())
}

fn retry_or_abandon(
    ctx: &DispatchContext,
    job: &DeliveryJob,
    rate_limited: bool,
    summary: &mut DrainSummary,
) {
    if job.attempt < ctx.cfg.delivery.max_attempts {
        let delay = backoff_delay(&ctx.cfg.delivery, job.attempt, rate_limited);
        match ctx.queue.reschedule(job.id, delay) {
            Ok(()) => summary.retried += 1,
            Err(err) => {
                error!(job_id = %job.id, ?err, "reschedule failed, dropping job");
                let _ = ctx.queue.abandon(job.id);
                summary.abandoned += 1;
            }
        }
    } else {
        error!(
            job_id = %job.id,
            kind = job.kind().as_str(),
            attempts = job.attempt,
            "delivery abandoned after exhausting attempts"
        );
        let _ = ctx.queue.abandon(job.id);
        summary.abandoned += 1;
    }
}

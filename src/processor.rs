//! Lifecycle wrapper around the dispatcher: an explicitly constructed
//! handle with an idempotent start, a single-flight drain guard shared by
//! the periodic tick and manual triggers, and the public enqueue surface.

use crate::db;
use crate::dispatcher::{drain_cycle, DispatchContext, DrainSummary};
use crate::eligibility::{self, normalize_ids};
use crate::model::{DeliveryJob, LedgerKey, NotificationKind, NotificationPayload};
use crate::transport::is_valid_address;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct ProcessorStatus {
    pub running: bool,
    pub queue_depth: usize,
    pub last_drain_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub delivered_total: u64,
    pub retried_total: u64,
    pub abandoned_total: u64,
}

/// Result of a manual drain request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    Completed(DrainSummary),
    /// Another drain (tick or manual) held the guard; nothing was started.
    AlreadyDraining,
}

#[derive(Default)]
struct Stats {
    last_drain_at: Mutex<Option<DateTime<Utc>>>,
    last_error: Mutex<Option<String>>,
    delivered_total: AtomicU64,
    retried_total: AtomicU64,
}

impl Stats {
    fn record(&self, summary: &DrainSummary) {
        *self.last_drain_at.lock().expect("stats lock poisoned") = Some(Utc::now());
        if let Some(err) = &summary.last_error {
            *self.last_error.lock().expect("stats lock poisoned") = Some(err.clone());
        }
        self.delivered_total
            .fetch_add(summary.delivered, Ordering::Relaxed);
        self.retried_total
            .fetch_add(summary.retried, Ordering::Relaxed);
    }
}

struct Worker {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Handle to the notification processor. Construct once at boot and pass
/// around; callers never reach into ambient global state.
pub struct Processor {
    ctx: Arc<DispatchContext>,
    drain_lock: Arc<tokio::sync::Mutex<()>>,
    worker: Mutex<Option<Worker>>,
    stats: Arc<Stats>,
}

impl Processor {
    pub fn new(ctx: DispatchContext) -> Self {
        Self {
            ctx: Arc::new(ctx),
            drain_lock: Arc::new(tokio::sync::Mutex::new(())),
            worker: Mutex::new(None),
            stats: Arc::new(Stats::default()),
        }
    }

    pub fn context(&self) -> &DispatchContext {
        &self.ctx
    }

    /// Start the periodic drain loop. Idempotent: callers may invoke this
    /// defensively on every trigger; only the first call spawns a worker.
    /// Returns false when a worker was already running.
    pub fn start(&self) -> bool {
        let mut slot = self.worker.lock().expect("worker slot lock poisoned");
        if slot.is_some() {
            return false;
        }

        let (shutdown, mut rx) = watch::channel(false);
        let ctx = self.ctx.clone();
        let drain_lock = self.drain_lock.clone();
        let stats = self.stats.clone();
        let tick = Duration::from_millis(ctx.cfg.app.tick_interval_ms);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match drain_lock.try_lock() {
                            Ok(_guard) => {
                                let summary = drain_cycle(&ctx).await;
                                stats.record(&summary);
                            }
                            // A drain is already in progress; this tick is
                            // skipped, not queued.
                            Err(_) => debug!("tick skipped, drain in progress"),
                        }
                    }
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("processor worker stopped");
        });

        *slot = Some(Worker { shutdown, handle });
        info!(tick_ms = tick.as_millis() as u64, "processor worker started");
        true
    }

    /// Signal the loop to exit after its current tick and wait for it. An
    /// in-flight delivery attempt finishes; nothing is interrupted.
    pub async fn stop(&self) {
        let worker = {
            let mut slot = self.worker.lock().expect("worker slot lock poisoned");
            slot.take()
        };
        if let Some(worker) = worker {
            let _ = worker.shutdown.send(true);
            if let Err(err) = worker.handle.await {
                warn!(?err, "processor worker join failed");
            }
        }
    }

    /// Manual drain trigger. Shares the single-flight guard with the
    /// periodic tick: if a drain is already running this returns
    /// immediately instead of starting a second one.
    pub async fn drain_now(&self) -> DrainOutcome {
        let Ok(_guard) = self.drain_lock.try_lock() else {
            return DrainOutcome::AlreadyDraining;
        };
        let summary = drain_cycle(&self.ctx).await;
        self.stats.record(&summary);
        DrainOutcome::Completed(summary)
    }

    pub fn status(&self) -> ProcessorStatus {
        ProcessorStatus {
            running: self
                .worker
                .lock()
                .expect("worker slot lock poisoned")
                .is_some(),
            queue_depth: self.ctx.queue.depth(),
            last_drain_at: *self
                .stats
                .last_drain_at
                .lock()
                .expect("stats lock poisoned"),
            last_error: self
                .stats
                .last_error
                .lock()
                .expect("stats lock poisoned")
                .clone(),
            delivered_total: self.stats.delivered_total.load(Ordering::Relaxed),
            retried_total: self.stats.retried_total.load(Ordering::Relaxed),
            abandoned_total: self.ctx.queue.abandoned_total(),
        }
    }

    /// Run the global eligibility gate and enqueue a bulk job when it
    /// fires. Entry point for the periodic sweep and the admin trigger.
    /// Zero qualifying postings enqueues nothing.
    pub async fn sweep(&self, kind: NotificationKind) -> Result<Option<Uuid>> {
        let gate = eligibility::evaluate_global(
            &self.ctx.pool,
            self.ctx.catalog.as_ref(),
            &self.ctx.cfg.eligibility,
            kind,
        )
        .await?;
        if !gate.should_send {
            debug!(kind = kind.as_str(), "sweep found nothing to send");
            return Ok(None);
        }
        info!(
            kind = kind.as_str(),
            count = gate.count,
            "sweep eligible, enqueuing bulk job"
        );
        self.enqueue_bulk_notification(kind, gate.qualifying_ids)
            .await
    }

    /// Queue a broadcast of `kind` covering `posting_ids`. At most one bulk
    /// job per kind per day is accepted; the broadcast ledger row is
    /// claimed here so competing triggers cannot double-enqueue. Acceptance
    /// only means the job was queued; outcomes surface via `status()` and
    /// the ledger.
    pub async fn enqueue_bulk_notification(
        &self,
        kind: NotificationKind,
        posting_ids: Vec<i64>,
    ) -> Result<Option<Uuid>> {
        let day = Utc::now().date_naive();
        let key = LedgerKey::broadcast(kind, day);
        if !db::reserve_notification(&self.ctx.pool, &key).await? {
            debug!(kind = kind.as_str(), "bulk notification already claimed today");
            return Ok(None);
        }
        let ids = normalize_ids(posting_ids, self.ctx.cfg.eligibility.max_batch_size);
        let payload = NotificationPayload::new(kind, ids);
        Ok(Some(self.ctx.queue.enqueue_bulk(payload, day)))
    }

    /// Queue a notification for one recipient. Suppressed (returns `None`)
    /// when the recipient is unknown or deactivated, the address is not
    /// routable, or the per-day ledger row is already claimed.
    pub async fn enqueue_recipient_notification(
        &self,
        recipient_id: i64,
        kind: NotificationKind,
        posting_ids: Vec<i64>,
    ) -> Result<Option<Uuid>> {
        let Some(recipient) = self.ctx.directory.recipient(recipient_id).await? else {
            warn!(recipient_id, "enqueue for unknown or inactive recipient");
            return Ok(None);
        };
        if !is_valid_address(&recipient.address) {
            warn!(recipient_id, "enqueue for recipient without routable address");
            return Ok(None);
        }

        let day = Utc::now().date_naive();
        let key = LedgerKey::recipient(recipient_id, kind, day);
        if !db::reserve_notification(&self.ctx.pool, &key).await? {
            debug!(
                recipient_id,
                kind = kind.as_str(),
                "notification already claimed for today"
            );
            return Ok(None);
        }

        let ids = normalize_ids(posting_ids, self.ctx.cfg.eligibility.max_batch_size);
        let payload = NotificationPayload::new(kind, ids);
        let job = DeliveryJob::for_recipient(recipient, payload, day, Utc::now());
        Ok(Some(self.ctx.queue.enqueue(job)))
    }

    /// Administrative re-enqueue of an abandoned delivery, e.g. after a bad
    /// address was fixed. Re-arms the undelivered ledger row via a
    /// compare-and-swap; a delivered row is never resurrected.
    pub async fn requeue_abandoned(
        &self,
        recipient_id: i64,
        kind: NotificationKind,
        posting_ids: Vec<i64>,
    ) -> Result<Option<Uuid>> {
        let Some(recipient) = self.ctx.directory.recipient(recipient_id).await? else {
            return Ok(None);
        };
        let day = Utc::now().date_naive();
        let key = LedgerKey::recipient(recipient_id, kind, day);
        if !db::rearm_notification(&self.ctx.pool, &key).await? {
            debug!(recipient_id, "nothing to re-arm");
            return Ok(None);
        }
        let ids = normalize_ids(posting_ids, self.ctx.cfg.eligibility.max_batch_size);
        let payload = NotificationPayload::new(kind, ids);
        let job = DeliveryJob::for_recipient(recipient, payload, day, Utc::now());
        Ok(Some(self.ctx.queue.enqueue(job)))
    }
}

//! In-memory queue of pending deliveries, ordered by earliest
//! `next_attempt_at` with FIFO on ties. Producers enqueue from arbitrary
//! tasks; the dispatcher is the single consumer. The queue does not survive
//! a process crash; the ledger is the durable audit trail.

use crate::model::{DeliveryJob, DeliveryStatus, NotificationPayload};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    /// (due_at, seq) -> job id. Only `Queued` jobs are indexed here.
    ready: BTreeMap<(DateTime<Utc>, u64), Uuid>,
    pos: HashMap<Uuid, (DateTime<Utc>, u64)>,
    jobs: HashMap<Uuid, DeliveryJob>,
    seq: u64,
    abandoned_total: u64,
}

#[derive(Default)]
pub struct DeliveryQueue {
    inner: Mutex<Inner>,
}

impl DeliveryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("delivery queue lock poisoned")
    }

    /// Insert a job; never blocks on I/O.
    pub fn enqueue(&self, job: DeliveryJob) -> Uuid {
        let mut inner = self.lock();
        let id = job.id;
        inner.seq += 1;
        let key = (job.next_attempt_at, inner.seq);
        inner.ready.insert(key, id);
        inner.pos.insert(id, key);
        inner.jobs.insert(id, job);
        id
    }

    /// Insert a bulk job due immediately; expanded per recipient at drain
    /// time so eligibility is re-checked just before sending.
    pub fn enqueue_bulk(&self, payload: NotificationPayload, day: NaiveDate) -> Uuid {
        self.enqueue(DeliveryJob::broadcast(payload, day, Utc::now()))
    }

    /// Earliest job whose `next_attempt_at` has passed, without removing
    /// it. Returns a snapshot; the job stays owned by the queue.
    pub fn peek_ready(&self, now: DateTime<Utc>) -> Option<DeliveryJob> {
        let inner = self.lock();
        let (&(due_at, _), id) = inner.ready.iter().next()?;
        if due_at > now {
            return None;
        }
        inner.jobs.get(id).cloned()
    }

    /// Transition `Queued -> InFlight` and charge one attempt. Returns the
    /// updated snapshot the dispatcher works from.
    pub fn begin_attempt(&self, id: Uuid) -> Result<DeliveryJob> {
        let mut inner = self.lock();
        let key = inner
            .pos
            .remove(&id)
            .ok_or_else(|| anyhow!("job {id} is not queued"))?;
        inner.ready.remove(&key);
        let job = inner
            .jobs
            .get_mut(&id)
            .ok_or_else(|| anyhow!("job {id} not found"))?;
        if job.status != DeliveryStatus::Queued {
            return Err(anyhow!("job {id} is {:?}, expected Queued", job.status));
        }
        job.status = DeliveryStatus::InFlight;
        job.attempt += 1;
        Ok(job.clone())
    }

    /// Remove a completed job. Terminal; the snapshot held by the caller is
    /// the last trace of it outside the ledger.
    pub fn mark_done(&self, id: Uuid) -> Result<()> {
        let mut inner = self.lock();
        inner
            .jobs
            .remove(&id)
            .ok_or_else(|| anyhow!("job {id} not found"))?;
        if let Some(key) = inner.pos.remove(&id) {
            inner.ready.remove(&key);
        }
        Ok(())
    }

    /// Put a failed attempt back in line after `delay`.
    pub fn reschedule(&self, id: Uuid, delay: Duration) -> Result<()> {
        let mut inner = self.lock();
        inner.seq += 1;
        let seq = inner.seq;
        let job = inner
            .jobs
            .get_mut(&id)
            .ok_or_else(|| anyhow!("job {id} not found"))?;
        if job.status != DeliveryStatus::InFlight {
            return Err(anyhow!("job {id} is {:?}, expected InFlight", job.status));
        }
        job.status = DeliveryStatus::Queued;
        job.next_attempt_at = Utc::now()
            + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::seconds(0));
        let key = (job.next_attempt_at, seq);
        let id = job.id;
        inner.ready.insert(key, id);
        inner.pos.insert(id, key);
        Ok(())
    }

    /// Terminal failure. The job leaves the queue; the ledger row keeps the
    /// audit trail.
    pub fn abandon(&self, id: Uuid) -> Result<()> {
        let mut inner = self.lock();
        inner
            .jobs
            .remove(&id)
            .ok_or_else(|| anyhow!("job {id} not found"))?;
        if let Some(key) = inner.pos.remove(&id) {
            inner.ready.remove(&key);
        }
        inner.abandoned_total += 1;
        Ok(())
    }

    /// Queued plus in-flight jobs.
    pub fn depth(&self) -> usize {
        self.lock().jobs.len()
    }

    pub fn abandoned_total(&self) -> u64 {
        self.lock().abandoned_total
    }
}

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    JobBatch,
    EndOfDay,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::JobBatch => "job_batch",
            NotificationKind::EndOfDay => "end_of_day",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "job_batch" => Some(NotificationKind::JobBatch),
            "end_of_day" => Some(NotificationKind::EndOfDay),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeliveryStatus {
    Queued,
    InFlight,
    Done,
    Abandoned,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Recipient {
    pub id: i64,
    pub display_name: String,
    pub address: String,
}

/// Payload of a queued delivery, keyed by kind so each kind's fields are
/// statically known instead of validated at every call site.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum NotificationPayload {
    JobBatch { posting_ids: Vec<i64> },
    EndOfDay { posting_ids: Vec<i64> },
}

impl NotificationPayload {
    pub fn new(kind: NotificationKind, posting_ids: Vec<i64>) -> Self {
        match kind {
            NotificationKind::JobBatch => NotificationPayload::JobBatch { posting_ids },
            NotificationKind::EndOfDay => NotificationPayload::EndOfDay { posting_ids },
        }
    }

    pub fn kind(&self) -> NotificationKind {
        match self {
            NotificationPayload::JobBatch { .. } => NotificationKind::JobBatch,
            NotificationPayload::EndOfDay { .. } => NotificationKind::EndOfDay,
        }
    }

    pub fn posting_ids(&self) -> &[i64] {
        match self {
            NotificationPayload::JobBatch { posting_ids }
            | NotificationPayload::EndOfDay { posting_ids } => posting_ids,
        }
    }

    pub fn count(&self) -> usize {
        self.posting_ids().len()
    }
}

/// Who a queued delivery goes to. Bulk jobs carry `AllEligible` and are
/// expanded into per-recipient jobs at drain time, not at enqueue time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeliveryTarget {
    Recipient(Recipient),
    AllEligible,
}

/// A queued unit of delivery work. Owned exclusively by the queue and the
/// dispatcher once enqueued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryJob {
    pub id: Uuid,
    pub target: DeliveryTarget,
    pub payload: NotificationPayload,
    /// Calendar day the delivery applies to, fixed at enqueue time so a
    /// retry that crosses midnight still updates the same ledger row.
    pub day: NaiveDate,
    pub attempt: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub status: DeliveryStatus,
}

impl DeliveryJob {
    pub fn for_recipient(
        recipient: Recipient,
        payload: NotificationPayload,
        day: NaiveDate,
        due_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            target: DeliveryTarget::Recipient(recipient),
            payload,
            day,
            attempt: 0,
            next_attempt_at: due_at,
            status: DeliveryStatus::Queued,
        }
    }

    pub fn broadcast(payload: NotificationPayload, day: NaiveDate, due_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            target: DeliveryTarget::AllEligible,
            payload,
            day,
            attempt: 0,
            next_attempt_at: due_at,
            status: DeliveryStatus::Queued,
        }
    }

    pub fn kind(&self) -> NotificationKind {
        self.payload.kind()
    }

    /// Ledger key for this job; broadcast jobs map to the NULL-recipient row.
    pub fn ledger_key(&self) -> LedgerKey {
        let recipient_id = match &self.target {
            DeliveryTarget::Recipient(r) => Some(r.id),
            DeliveryTarget::AllEligible => None,
        };
        LedgerKey {
            recipient_id,
            kind: self.kind(),
            day: self.day,
        }
    }
}

/// Idempotency key of a ledger row: at most one notification of a given
/// kind per recipient per day. `recipient_id` is `None` for broadcast rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerKey {
    pub recipient_id: Option<i64>,
    pub kind: NotificationKind,
    pub day: NaiveDate,
}

impl LedgerKey {
    pub fn recipient(recipient_id: i64, kind: NotificationKind, day: NaiveDate) -> Self {
        Self {
            recipient_id: Some(recipient_id),
            kind,
            day,
        }
    }

    pub fn broadcast(kind: NotificationKind, day: NaiveDate) -> Self {
        Self {
            recipient_id: None,
            kind,
            day,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub id: i64,
    pub recipient_id: Option<i64>,
    pub kind: NotificationKind,
    pub day: NaiveDate,
    pub job_count: i64,
    pub delivered: bool,
    pub retry_count: i64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of an eligibility check. Consumed immediately to build a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EligibilityResult {
    pub should_send: bool,
    pub qualifying_ids: Vec<i64>,
    pub count: usize,
}

impl EligibilityResult {
    pub fn skip() -> Self {
        Self {
            should_send: false,
            qualifying_ids: Vec::new(),
            count: 0,
        }
    }
}

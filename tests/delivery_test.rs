use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use jobdigest::catalog::{CatalogReader, RecipientDirectory};
use jobdigest::config::{self, Config};
use jobdigest::db;
use jobdigest::model::{NotificationKind, Recipient};
use jobdigest::queue::DeliveryQueue;
use jobdigest::transport::{MailTransport, RenderedMessage, TransportError};
use jobdigest::{DispatchContext, DrainOutcome, Processor};

async fn setup_pool() -> db::Pool {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

/// Example config with immediate retries so a full retry cycle fits in one
/// drain. Backoff growth itself is covered by the dispatcher unit tests.
fn test_config() -> Config {
    let mut cfg: Config = serde_yaml::from_str(config::example()).unwrap();
    cfg.delivery.base_backoff_seconds = 0;
    cfg.delivery.max_backoff_seconds = 0;
    cfg.delivery.rate_limit_floor_seconds = 0;
    cfg
}

fn recipient(id: i64, name: &str) -> Recipient {
    Recipient {
        id,
        display_name: name.to_string(),
        address: format!("{}@agency.example", name.to_lowercase()),
    }
}

#[derive(Clone, Default)]
struct RecordingMail {
    responses: Arc<Mutex<VecDeque<Result<(), TransportError>>>>,
    sent: Arc<Mutex<Vec<(String, RenderedMessage)>>>,
}

impl RecordingMail {
    fn with_responses(responses: Vec<Result<(), TransportError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::from(responses))),
            ..Default::default()
        }
    }

    fn sent(&self) -> Vec<(String, RenderedMessage)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MailTransport for RecordingMail {
    async fn send(&self, address: &str, message: &RenderedMessage) -> Result<(), TransportError> {
        self.sent
            .lock()
            .unwrap()
            .push((address.to_string(), message.clone()));
        self.responses.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }
}

#[derive(Clone, Default)]
struct StaticCatalog {
    postings: Vec<i64>,
}

#[async_trait]
impl CatalogReader for StaticCatalog {
    async fn new_qualifying_postings(&self, _since: Option<DateTime<Utc>>) -> Result<Vec<i64>> {
        Ok(self.postings.clone())
    }

    async fn qualifying_postings_for(
        &self,
        _recipient_id: i64,
        _since: Option<DateTime<Utc>>,
    ) -> Result<Vec<i64>> {
        Ok(self.postings.clone())
    }
}

#[derive(Clone, Default)]
struct SharedDirectory {
    recipients: Arc<Mutex<Vec<Recipient>>>,
}

impl SharedDirectory {
    fn with_recipients(recipients: Vec<Recipient>) -> Self {
        Self {
            recipients: Arc::new(Mutex::new(recipients)),
        }
    }

    fn deactivate(&self, id: i64) {
        self.recipients.lock().unwrap().retain(|r| r.id != id);
    }
}

#[async_trait]
impl RecipientDirectory for SharedDirectory {
    async fn list_active_recipients(&self) -> Result<Vec<Recipient>> {
        Ok(self.recipients.lock().unwrap().clone())
    }

    async fn recipient(&self, id: i64) -> Result<Option<Recipient>> {
        Ok(self
            .recipients
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.id == id)
            .cloned())
    }
}

fn processor(
    pool: db::Pool,
    mail: RecordingMail,
    catalog: StaticCatalog,
    directory: SharedDirectory,
) -> Processor {
    Processor::new(DispatchContext {
        pool,
        queue: Arc::new(DeliveryQueue::new()),
        catalog: Arc::new(catalog),
        directory: Arc::new(directory),
        transport: Arc::new(mail),
        cfg: test_config(),
    })
}

fn expect_summary(outcome: DrainOutcome) -> jobdigest::DrainSummary {
    match outcome {
        DrainOutcome::Completed(summary) => summary,
        DrainOutcome::AlreadyDraining => panic!("unexpected concurrent drain"),
    }
}

#[tokio::test]
async fn successful_delivery_writes_ledger() {
    let pool = setup_pool().await;
    let mail = RecordingMail::default();
    let directory = SharedDirectory::with_recipients(vec![recipient(1, "Ada")]);
    let proc = processor(pool.clone(), mail.clone(), StaticCatalog::default(), directory);

    let job_id = proc
        .enqueue_recipient_notification(1, NotificationKind::JobBatch, vec![10, 11, 12])
        .await
        .unwrap();
    assert!(job_id.is_some());

    let summary = expect_summary(proc.drain_now().await);
    assert_eq!(summary.delivered, 1);
    assert_eq!(summary.retried, 0);

    let sent = mail.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "ada@agency.example");
    assert!(sent[0].1.subject.contains("3 new job postings"));

    let (delivered, retry_count, job_count): (i64, i64, i64) = sqlx::query_as(
        "SELECT delivered, retry_count, job_count FROM notifications WHERE recipient_id = 1",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(delivered, 1);
    assert_eq!(retry_count, 0);
    assert_eq!(job_count, 3);
}

#[tokio::test]
async fn transient_failures_retry_then_succeed() {
    let pool = setup_pool().await;
    let mail = RecordingMail::with_responses(vec![
        Err(TransportError::Transient("connection reset".into())),
        Err(TransportError::Timeout(std::time::Duration::from_secs(5))),
        Ok(()),
    ]);
    let directory = SharedDirectory::with_recipients(vec![recipient(1, "Ada")]);
    let proc = processor(pool.clone(), mail.clone(), StaticCatalog::default(), directory);

    proc.enqueue_recipient_notification(1, NotificationKind::JobBatch, vec![5])
        .await
        .unwrap();

    let summary = expect_summary(proc.drain_now().await);
    assert_eq!(summary.delivered, 1);
    assert_eq!(summary.retried, 2);
    assert_eq!(mail.sent().len(), 3);

    let (delivered, retry_count): (i64, i64) =
        sqlx::query_as("SELECT delivered, retry_count FROM notifications WHERE recipient_id = 1")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(delivered, 1);
    assert_eq!(retry_count, 2);
}

#[tokio::test]
async fn persistent_failure_abandons_after_max_attempts() {
    let pool = setup_pool().await;
    let mail = RecordingMail::with_responses(vec![
        Err(TransportError::Transient("down".into())),
        Err(TransportError::Transient("down".into())),
        Err(TransportError::Transient("down".into())),
        // Never reached: the job must not get a fourth attempt.
        Ok(()),
    ]);
    let directory = SharedDirectory::with_recipients(vec![recipient(1, "Ada")]);
    let proc = processor(pool.clone(), mail.clone(), StaticCatalog::default(), directory);

    proc.enqueue_recipient_notification(1, NotificationKind::JobBatch, vec![5])
        .await
        .unwrap();

    let summary = expect_summary(proc.drain_now().await);
    assert_eq!(summary.delivered, 0);
    assert_eq!(summary.retried, 2);
    assert_eq!(summary.abandoned, 1);
    assert_eq!(mail.sent().len(), 3);

    let status = proc.status();
    assert_eq!(status.queue_depth, 0);
    assert_eq!(status.abandoned_total, 1);
    assert!(status.last_error.is_some());

    let (delivered, retry_count): (i64, i64) =
        sqlx::query_as("SELECT delivered, retry_count FROM notifications WHERE recipient_id = 1")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(delivered, 0);
    assert_eq!(retry_count, 3);

    // Abandoned deliveries stay visible for manual inspection.
    let failures = db::recent_failures(&pool, 10).await.unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].recipient_id, Some(1));
}

#[tokio::test]
async fn double_enqueue_same_day_yields_one_delivery() {
    let pool = setup_pool().await;
    let mail = RecordingMail::default();
    let directory = SharedDirectory::with_recipients(vec![recipient(1, "Ada")]);
    let proc = processor(pool.clone(), mail.clone(), StaticCatalog::default(), directory);

    let first = proc
        .enqueue_recipient_notification(1, NotificationKind::JobBatch, vec![5])
        .await
        .unwrap();
    let second = proc
        .enqueue_recipient_notification(1, NotificationKind::JobBatch, vec![5, 6])
        .await
        .unwrap();
    assert!(first.is_some());
    assert!(second.is_none());

    expect_summary(proc.drain_now().await);
    assert_eq!(mail.sent().len(), 1);

    let rows: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM notifications WHERE recipient_id = 1")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(rows, 1);
}

#[tokio::test]
async fn rejection_is_never_retried() {
    let pool = setup_pool().await;
    let mail = RecordingMail::with_responses(vec![Err(TransportError::Rejected(
        "422: unknown mailbox".into(),
    ))]);
    let directory = SharedDirectory::with_recipients(vec![recipient(1, "Ada")]);
    let proc = processor(pool.clone(), mail.clone(), StaticCatalog::default(), directory);

    proc.enqueue_recipient_notification(1, NotificationKind::JobBatch, vec![5])
        .await
        .unwrap();

    let summary = expect_summary(proc.drain_now().await);
    assert_eq!(summary.retried, 0);
    assert_eq!(summary.abandoned, 1);
    assert_eq!(mail.sent().len(), 1);

    let (delivered, last_error): (i64, String) =
        sqlx::query_as("SELECT delivered, last_error FROM notifications WHERE recipient_id = 1")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(delivered, 0);
    assert!(last_error.contains("unknown mailbox"));
}

#[tokio::test]
async fn unroutable_address_is_suppressed_at_enqueue() {
    let pool = setup_pool().await;
    let mail = RecordingMail::default();
    let directory = SharedDirectory::with_recipients(vec![Recipient {
        id: 1,
        display_name: "Ada".into(),
        address: "not-an-address".into(),
    }]);
    let proc = processor(pool, mail.clone(), StaticCatalog::default(), directory);

    let job_id = proc
        .enqueue_recipient_notification(1, NotificationKind::JobBatch, vec![5])
        .await
        .unwrap();
    assert!(job_id.is_none());
    assert_eq!(proc.status().queue_depth, 0);
    assert!(mail.sent().is_empty());
}

#[tokio::test]
async fn sweep_expands_to_all_eligible_recipients() {
    let pool = setup_pool().await;
    let mail = RecordingMail::default();
    let catalog = StaticCatalog {
        postings: vec![30, 10, 20, 10, 50, 40],
    };
    let directory =
        SharedDirectory::with_recipients(vec![recipient(1, "Ada"), recipient(2, "Brin")]);
    let proc = processor(pool.clone(), mail.clone(), catalog, directory);

    let job_id = proc.sweep(NotificationKind::JobBatch).await.unwrap();
    assert!(job_id.is_some());

    let summary = expect_summary(proc.drain_now().await);
    assert_eq!(summary.expanded, 2);
    assert_eq!(summary.delivered, 2);

    let sent = mail.sent();
    assert_eq!(sent.len(), 2);
    // Payloads are sorted and de-duplicated.
    assert!(sent[0].1.subject.contains("5 new job postings"));
    assert!(sent[0].1.body.contains("#10, #20, #30, #40, #50"));

    let delivered: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM notifications WHERE recipient_id IS NOT NULL AND delivered = 1",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(delivered, 2);

    // The broadcast row records the expansion for the day.
    let (bulk_delivered, bulk_count): (i64, i64) = sqlx::query_as(
        "SELECT delivered, job_count FROM notifications WHERE recipient_id IS NULL",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(bulk_delivered, 1);
    assert_eq!(bulk_count, 2);
}

#[tokio::test]
async fn bulk_expansion_rechecks_eligibility_at_drain_time() {
    let pool = setup_pool().await;
    let mail = RecordingMail::default();
    let catalog = StaticCatalog { postings: vec![7] };
    let directory =
        SharedDirectory::with_recipients(vec![recipient(1, "Ada"), recipient(2, "Brin")]);
    let proc = processor(
        pool.clone(),
        mail.clone(),
        catalog,
        directory.clone(),
    );

    let job_id = proc
        .enqueue_bulk_notification(NotificationKind::JobBatch, vec![7])
        .await
        .unwrap();
    assert!(job_id.is_some());

    // Brin deactivates between enqueue and drain; the accepted bulk job
    // must not deliver to them.
    directory.deactivate(2);

    let summary = expect_summary(proc.drain_now().await);
    assert_eq!(summary.expanded, 1);
    assert_eq!(summary.delivered, 1);

    let sent = mail.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "ada@agency.example");

    let brin_rows: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM notifications WHERE recipient_id = 2")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(brin_rows, 0);
}

#[tokio::test]
async fn one_bulk_job_per_kind_per_day() {
    let pool = setup_pool().await;
    let mail = RecordingMail::default();
    let directory = SharedDirectory::with_recipients(vec![recipient(1, "Ada")]);
    let proc = processor(pool, mail, StaticCatalog { postings: vec![1] }, directory);

    let first = proc
        .enqueue_bulk_notification(NotificationKind::EndOfDay, vec![1])
        .await
        .unwrap();
    let second = proc
        .enqueue_bulk_notification(NotificationKind::EndOfDay, vec![1, 2])
        .await
        .unwrap();
    assert!(first.is_some());
    assert!(second.is_none());
    assert_eq!(proc.status().queue_depth, 1);
}

#[tokio::test]
async fn idle_sweep_enqueues_nothing() {
    let pool = setup_pool().await;
    let mail = RecordingMail::default();
    let directory = SharedDirectory::with_recipients(vec![recipient(1, "Ada")]);
    let proc = processor(pool, mail.clone(), StaticCatalog::default(), directory);

    let job_id = proc.sweep(NotificationKind::JobBatch).await.unwrap();
    assert!(job_id.is_none());
    assert_eq!(proc.status().queue_depth, 0);

    let summary = expect_summary(proc.drain_now().await);
    assert_eq!(summary, jobdigest::DrainSummary::default());
    assert!(mail.sent().is_empty());
}

#[tokio::test]
async fn requeue_abandoned_after_fix_delivers() {
    let pool = setup_pool().await;
    let mail = RecordingMail::with_responses(vec![
        Err(TransportError::Transient("down".into())),
        Err(TransportError::Transient("down".into())),
        Err(TransportError::Transient("down".into())),
        Ok(()),
    ]);
    let directory = SharedDirectory::with_recipients(vec![recipient(1, "Ada")]);
    let proc = processor(pool.clone(), mail.clone(), StaticCatalog::default(), directory);

    proc.enqueue_recipient_notification(1, NotificationKind::JobBatch, vec![5])
        .await
        .unwrap();
    expect_summary(proc.drain_now().await);
    assert_eq!(proc.status().abandoned_total, 1);

    // Same-day enqueue stays suppressed; the explicit re-arm path works.
    let blocked = proc
        .enqueue_recipient_notification(1, NotificationKind::JobBatch, vec![5])
        .await
        .unwrap();
    assert!(blocked.is_none());

    let requeued = proc
        .requeue_abandoned(1, NotificationKind::JobBatch, vec![5])
        .await
        .unwrap();
    assert!(requeued.is_some());

    let summary = expect_summary(proc.drain_now().await);
    assert_eq!(summary.delivered, 1);

    let (delivered, retry_count): (i64, i64) =
        sqlx::query_as("SELECT delivered, retry_count FROM notifications WHERE recipient_id = 1")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(delivered, 1);
    assert_eq!(retry_count, 0);
}

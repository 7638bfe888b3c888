//! Decides whether a notification is due. Pure reads; callers may invoke
//! these repeatedly without side effects. The ledger's unique key is the
//! authoritative duplicate guard; the checks here are the decision layer.

use crate::catalog::CatalogReader;
use crate::config::Eligibility;
use crate::db::{self, Pool};
use crate::model::{EligibilityResult, NotificationKind, Recipient};
use crate::transport::is_valid_address;
use anyhow::Result;
use chrono::NaiveDate;
use tracing::instrument;

/// Sort, de-duplicate, and cap qualifying ids so payload construction is
/// deterministic and message size stays bounded.
pub fn normalize_ids(mut ids: Vec<i64>, cap: usize) -> Vec<i64> {
    ids.sort_unstable();
    ids.dedup();
    ids.truncate(cap);
    ids
}

/// Should a board-wide batch of `kind` go out? Counts qualifying postings
/// since the last successful broadcast of the same kind.
#[instrument(skip_all)]
pub async fn evaluate_global(
    pool: &Pool,
    catalog: &dyn CatalogReader,
    cfg: &Eligibility,
    kind: NotificationKind,
) -> Result<EligibilityResult> {
    let since = db::last_broadcast_delivery(pool, kind).await?;
    let ids = normalize_ids(
        catalog.new_qualifying_postings(since).await?,
        cfg.max_batch_size,
    );
    if ids.is_empty() || ids.len() < cfg.global_threshold {
        return Ok(EligibilityResult::skip());
    }
    let count = ids.len();
    Ok(EligibilityResult {
        should_send: true,
        qualifying_ids: ids,
        count,
    })
}

/// Same decision scoped to one recipient, additionally gated by the
/// at-most-once-per-day rule. A recipient without a routable address is
/// ineligible, not a dispatch failure.
#[instrument(skip_all, fields(recipient_id = recipient.id))]
pub async fn evaluate_for_recipient(
    pool: &Pool,
    catalog: &dyn CatalogReader,
    cfg: &Eligibility,
    recipient: &Recipient,
    kind: NotificationKind,
    day: NaiveDate,
) -> Result<EligibilityResult> {
    if !is_valid_address(&recipient.address) {
        return Ok(EligibilityResult::skip());
    }
    if db::has_delivered_today(pool, recipient.id, kind, day).await? {
        return Ok(EligibilityResult::skip());
    }

    let since = db::last_recipient_delivery(pool, recipient.id, kind).await?;
    let ids = normalize_ids(
        catalog.qualifying_postings_for(recipient.id, since).await?,
        cfg.max_batch_size,
    );
    if ids.is_empty() || ids.len() < cfg.recipient_threshold {
        return Ok(EligibilityResult::skip());
    }
    let count = ids.len();
    Ok(EligibilityResult {
        should_send: true,
        qualifying_ids: ids,
        count,
    })
}

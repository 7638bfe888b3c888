//! Read-only views over the marketplace catalogs. The processor never
//! writes through these; eligibility decisions are the only consumers.

use crate::db::Pool;
use crate::model::Recipient;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[async_trait]
pub trait CatalogReader: Send + Sync {
    /// Ids of qualifying postings across the whole board since `since`
    /// (all of them when no checkpoint exists yet).
    async fn new_qualifying_postings(&self, since: Option<DateTime<Utc>>) -> Result<Vec<i64>>;

    /// Ids of qualifying postings relevant to one recipient.
    async fn qualifying_postings_for(
        &self,
        recipient_id: i64,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<i64>>;
}

#[async_trait]
pub trait RecipientDirectory: Send + Sync {
    async fn list_active_recipients(&self) -> Result<Vec<Recipient>>;

    /// Returns `None` for unknown or deactivated recipients.
    async fn recipient(&self, id: i64) -> Result<Option<Recipient>>;
}

/// Catalog reader over the marketplace `job_postings` table.
#[derive(Clone)]
pub struct SqlCatalog {
    pool: Pool,
}

impl SqlCatalog {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn open_postings_since(&self, since: Option<DateTime<Utc>>) -> Result<Vec<i64>> {
        let ids = match since {
            Some(ts) => {
                sqlx::query_scalar::<_, i64>(
                    "SELECT id FROM job_postings \
                     WHERE status = 'open' AND datetime(posted_at) > datetime(?) \
                     ORDER BY id",
                )
                .bind(ts)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_scalar::<_, i64>(
                    "SELECT id FROM job_postings WHERE status = 'open' ORDER BY id",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(ids)
    }
}

#[async_trait]
impl CatalogReader for SqlCatalog {
    async fn new_qualifying_postings(&self, since: Option<DateTime<Utc>>) -> Result<Vec<i64>> {
        self.open_postings_since(since).await
    }

    async fn qualifying_postings_for(
        &self,
        _recipient_id: i64,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<i64>> {
        // Saved-search matching lives in the marketplace application; this
        // reader treats every open posting as relevant to every recipient
        // and leaves narrowing to the eligibility thresholds.
        self.open_postings_since(since).await
    }
}

/// Recipient directory over the marketplace `recipients` table.
#[derive(Clone)]
pub struct SqlDirectory {
    pool: Pool,
}

impl SqlDirectory {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecipientDirectory for SqlDirectory {
    async fn list_active_recipients(&self) -> Result<Vec<Recipient>> {
        let rows = sqlx::query_as::<_, (i64, String, String)>(
            "SELECT id, display_name, email FROM recipients WHERE active = 1 ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(id, display_name, address)| Recipient {
                id,
                display_name,
                address,
            })
            .collect())
    }

    async fn recipient(&self, id: i64) -> Result<Option<Recipient>> {
        let row = sqlx::query_as::<_, (i64, String, String)>(
            "SELECT id, display_name, email FROM recipients WHERE id = ? AND active = 1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(id, display_name, address)| Recipient {
            id,
            display_name,
            address,
        }))
    }
}

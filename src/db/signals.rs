use super::SqliteStore;
use crate::model::SignalFlag;
use crate::store::SignalStore;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::instrument;

#[async_trait]
impl SignalStore for SqliteStore {
    #[instrument(skip_all)]
    async fn flags(&self, id: &str) -> Result<SignalFlag> {
        let row = sqlx::query(
            "SELECT should_pause, should_cancel, updated_at FROM campaign_signals WHERE campaign_id = ?",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .context("failed to read campaign signals")?;
        let Some(row) = row else {
            return Ok(SignalFlag::default());
        };
        Ok(SignalFlag {
            should_pause: row.get("should_pause"),
            should_cancel: row.get("should_cancel"),
            updated_at: row.try_get("updated_at")?,
        })
    }

    #[instrument(skip_all)]
    async fn request_pause(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "INSERT INTO campaign_signals (campaign_id, should_pause, should_cancel, updated_at) \
             VALUES (?, 1, 0, ?) \
             ON CONFLICT(campaign_id) DO UPDATE SET should_pause = 1, updated_at = excluded.updated_at",
        )
        .bind(id)
        .bind(at)
        .execute(self.pool())
        .await
        .context("failed to persist pause signal")?;
        Ok(())
    }

    #[instrument(skip_all)]
    async fn request_cancel(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "INSERT INTO campaign_signals (campaign_id, should_pause, should_cancel, updated_at) \
             VALUES (?, 0, 1, ?) \
             ON CONFLICT(campaign_id) DO UPDATE SET should_cancel = 1, updated_at = excluded.updated_at",
        )
        .bind(id)
        .bind(at)
        .execute(self.pool())
        .await
        .context("failed to persist cancel signal")?;
        Ok(())
    }

    #[instrument(skip_all)]
    async fn clear(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "INSERT INTO campaign_signals (campaign_id, should_pause, should_cancel, updated_at) \
             VALUES (?, 0, 0, ?) \
             ON CONFLICT(campaign_id) DO UPDATE SET should_pause = 0, should_cancel = 0, \
             updated_at = excluded.updated_at",
        )
        .bind(id)
        .bind(at)
        .execute(self.pool())
        .await
        .context("failed to clear campaign signals")?;
        Ok(())
    }

    #[instrument(skip_all)]
    async fn purge_terminal(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let res = sqlx::query(
            "DELETE FROM campaign_signals WHERE updated_at < ? AND campaign_id NOT IN \
             (SELECT id FROM campaigns WHERE status NOT IN ('completed', 'cancelled'))",
        )
        .bind(older_than)
        .execute(self.pool())
        .await?;
        Ok(res.rows_affected())
    }
}

use super::SqliteStore;
use crate::model::{
    Campaign, CampaignConfiguration, CampaignStatus, Content, DeliveryLogEntry, DeliveryStatus,
    NewCampaign, Statistics, Timestamps, VariationKind, VariationUsed,
};
use crate::store::{CampaignStore, DeliveryCounts};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::instrument;

const CAMPAIGN_COLUMNS: &str = "id, name, content, configuration, status, total, pending, sent, \
     success, error, success_rate, created_at, scheduled_for, started_at, concluded_at, updated_at";

const LOG_COLUMNS: &str = "campaign_id, position, contact_id, name, number, status, attempts, \
     last_attempt_at, response_time_ms, response_code, error_message, variation_index, \
     variation_content, variation_kind";

fn campaign_from_row(row: &SqliteRow) -> Result<Campaign> {
    let id: String = row.get("id");
    let content_json: String = row.get("content");
    let content: Content = serde_json::from_str(&content_json)
        .with_context(|| format!("campaign {} has malformed content", id))?;
    let configuration_json: String = row.get("configuration");
    let configuration: CampaignConfiguration = serde_json::from_str(&configuration_json)
        .with_context(|| format!("campaign {} has malformed configuration", id))?;
    let status_str: String = row.get("status");
    let status = CampaignStatus::parse_state(&status_str)
        .ok_or_else(|| anyhow!("campaign {} has unknown status {}", id, status_str))?;

    Ok(Campaign {
        name: row.get("name"),
        content,
        status,
        configuration,
        statistics: Statistics {
            total: row.get("total"),
            pending: row.get("pending"),
            sent: row.get("sent"),
            success: row.get("success"),
            error: row.get("error"),
            success_rate: row.get("success_rate"),
        },
        timestamps: Timestamps {
            created_at: row.get("created_at"),
            scheduled_for: row.try_get("scheduled_for")?,
            started_at: row.try_get("started_at")?,
            concluded_at: row.try_get("concluded_at")?,
            updated_at: row.get("updated_at"),
        },
        id,
    })
}

fn entry_from_row(row: &SqliteRow) -> Result<DeliveryLogEntry> {
    let status_str: String = row.get("status");
    let status = DeliveryStatus::parse_state(&status_str)
        .ok_or_else(|| anyhow!("delivery log row has unknown status {}", status_str))?;

    let variation_index: Option<i64> = row.try_get("variation_index")?;
    let variation_content: Option<String> = row.try_get("variation_content")?;
    let variation_kind: Option<String> = row.try_get("variation_kind")?;
    let variation_used = match (variation_index, variation_content) {
        (Some(index), Some(content)) => Some(VariationUsed {
            index: index as usize,
            content,
            kind: variation_kind
                .as_deref()
                .and_then(VariationKind::parse_kind)
                .unwrap_or(if index == 0 {
                    VariationKind::Original
                } else {
                    VariationKind::Paraphrase
                }),
        }),
        _ => None,
    };

    Ok(DeliveryLogEntry {
        campaign_id: row.get("campaign_id"),
        position: row.get("position"),
        contact_id: row.get("contact_id"),
        name: row.get("name"),
        number: row.get("number"),
        status,
        attempts: row.get("attempts"),
        last_attempt_at: row.try_get("last_attempt_at")?,
        response_time_ms: row.try_get("response_time_ms")?,
        response_code: row.try_get("response_code")?,
        error_message: row.try_get("error_message")?,
        variation_used,
    })
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

#[async_trait]
impl CampaignStore for SqliteStore {
    #[instrument(skip_all)]
    async fn create_campaign(
        &self,
        new: &NewCampaign,
        configuration: &CampaignConfiguration,
        at: DateTime<Utc>,
    ) -> Result<Campaign> {
        let id = uuid::Uuid::new_v4().to_string();
        let status = if new.scheduled_for.is_some() {
            CampaignStatus::Scheduled
        } else {
            CampaignStatus::Draft
        };
        let total = new.recipients.len() as i64;
        let statistics = Statistics::from_counts(total, 0, 0);

        let mut tx = self.pool().begin().await?;
        sqlx::query(
            "INSERT INTO campaigns (id, name, kind, content, configuration, status, total, pending, \
             sent, success, error, success_rate, created_at, scheduled_for, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, 0, 0, 0, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&new.name)
        .bind(new.content.kind().as_str())
        .bind(serde_json::to_string(&new.content)?)
        .bind(serde_json::to_string(configuration)?)
        .bind(status.as_str())
        .bind(statistics.total)
        .bind(statistics.pending)
        .bind(at)
        .bind(new.scheduled_for)
        .bind(at)
        .execute(&mut *tx)
        .await
        .context("failed to insert campaign")?;

        for (position, recipient) in new.recipients.iter().enumerate() {
            sqlx::query(
                "INSERT INTO delivery_log (campaign_id, position, contact_id, name, number, status, attempts) \
                 VALUES (?, ?, ?, ?, ?, 'pending', 0)",
            )
            .bind(&id)
            .bind(position as i64)
            .bind(&recipient.contact_id)
            .bind(&recipient.name)
            .bind(&recipient.number)
            .execute(&mut *tx)
            .await
            .context("failed to insert delivery log row")?;
        }
        tx.commit().await?;

        Ok(Campaign {
            id,
            name: new.name.clone(),
            content: new.content.clone(),
            status,
            configuration: configuration.clone(),
            statistics,
            timestamps: Timestamps {
                created_at: at,
                scheduled_for: new.scheduled_for,
                started_at: None,
                concluded_at: None,
                updated_at: at,
            },
        })
    }

    #[instrument(skip_all)]
    async fn get(&self, id: &str) -> Result<Option<Campaign>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM campaigns WHERE id = ?",
            CAMPAIGN_COLUMNS
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(campaign_from_row).transpose()
    }

    #[instrument(skip_all)]
    async fn list(&self, limit: i64) -> Result<Vec<Campaign>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM campaigns ORDER BY created_at DESC LIMIT ?",
            CAMPAIGN_COLUMNS
        ))
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(campaign_from_row).collect()
    }

    #[instrument(skip_all)]
    async fn delete(&self, id: &str) -> Result<bool> {
        let mut tx = self.pool().begin().await?;
        sqlx::query("DELETE FROM delivery_log WHERE campaign_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM campaign_signals WHERE campaign_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let res = sqlx::query("DELETE FROM campaigns WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(res.rows_affected() > 0)
    }

    #[instrument(skip_all)]
    async fn transition(
        &self,
        id: &str,
        from: &[CampaignStatus],
        to: CampaignStatus,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        if from.is_empty() {
            return Ok(false);
        }
        let started = (to == CampaignStatus::Sending).then_some(at);
        let concluded = to.is_terminal().then_some(at);
        let sql = format!(
            "UPDATE campaigns SET status = ?, updated_at = ?, \
             started_at = COALESCE(started_at, ?), \
             concluded_at = COALESCE(concluded_at, ?) \
             WHERE id = ? AND status IN ({})",
            placeholders(from.len())
        );
        let mut query = sqlx::query(&sql)
            .bind(to.as_str())
            .bind(at)
            .bind(started)
            .bind(concluded)
            .bind(id);
        for status in from {
            query = query.bind(status.as_str());
        }
        let res = query
            .execute(self.pool())
            .await
            .with_context(|| format!("failed to move campaign {} to {}", id, to))?;
        Ok(res.rows_affected() > 0)
    }

    #[instrument(skip_all)]
    async fn set_schedule(
        &self,
        id: &str,
        scheduled_for: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let res = match scheduled_for {
            Some(when) => sqlx::query(
                "UPDATE campaigns SET status = 'scheduled', scheduled_for = ?, updated_at = ? \
                 WHERE id = ? AND status IN ('draft', 'scheduled')",
            )
            .bind(when)
            .bind(at)
            .bind(id)
            .execute(self.pool())
            .await?,
            None => sqlx::query(
                "UPDATE campaigns SET status = 'draft', scheduled_for = NULL, updated_at = ? \
                 WHERE id = ? AND status = 'scheduled'",
            )
            .bind(at)
            .bind(id)
            .execute(self.pool())
            .await?,
        };
        Ok(res.rows_affected() > 0)
    }

    #[instrument(skip_all)]
    async fn due_scheduled(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar(
            "SELECT id FROM campaigns WHERE status = 'scheduled' AND scheduled_for IS NOT NULL \
             AND scheduled_for <= ? ORDER BY scheduled_for ASC",
        )
        .bind(now)
        .fetch_all(self.pool())
        .await?;
        Ok(ids)
    }

    #[instrument(skip_all)]
    async fn update_statistics(
        &self,
        id: &str,
        statistics: &Statistics,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE campaigns SET total = ?, pending = ?, sent = ?, success = ?, error = ?, \
             success_rate = ?, updated_at = ? WHERE id = ?",
        )
        .bind(statistics.total)
        .bind(statistics.pending)
        .bind(statistics.sent)
        .bind(statistics.success)
        .bind(statistics.error)
        .bind(statistics.success_rate)
        .bind(at)
        .bind(id)
        .execute(self.pool())
        .await
        .context("failed to persist campaign statistics")?;
        Ok(())
    }

    #[instrument(skip_all)]
    async fn delivery_counts(&self, id: &str) -> Result<DeliveryCounts> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM delivery_log WHERE campaign_id = ? GROUP BY status",
        )
        .bind(id)
        .fetch_all(self.pool())
        .await?;

        let mut counts = DeliveryCounts::default();
        for (status, count) in rows {
            counts.total += count;
            match DeliveryStatus::parse_state(&status) {
                Some(DeliveryStatus::Pending) => counts.pending += count,
                Some(DeliveryStatus::Sending) => counts.sending += count,
                Some(DeliveryStatus::Success) => counts.success += count,
                Some(DeliveryStatus::Error) => counts.error += count,
                None => return Err(anyhow!("delivery log has unknown status {}", status)),
            }
        }
        Ok(counts)
    }

    #[instrument(skip_all)]
    async fn delivery_log(
        &self,
        id: &str,
        status: Option<DeliveryStatus>,
    ) -> Result<Vec<DeliveryLogEntry>> {
        let rows = match status {
            Some(status) => {
                sqlx::query(&format!(
                    "SELECT {} FROM delivery_log WHERE campaign_id = ? AND status = ? ORDER BY position",
                    LOG_COLUMNS
                ))
                .bind(id)
                .bind(status.as_str())
                .fetch_all(self.pool())
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {} FROM delivery_log WHERE campaign_id = ? ORDER BY position",
                    LOG_COLUMNS
                ))
                .bind(id)
                .fetch_all(self.pool())
                .await?
            }
        };
        rows.iter().map(entry_from_row).collect()
    }

    #[instrument(skip_all)]
    async fn retryable_recipients(
        &self,
        id: &str,
        max_retries: u32,
    ) -> Result<Vec<DeliveryLogEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM delivery_log WHERE campaign_id = ? \
             AND (status = 'pending' OR (status = 'error' AND attempts < ?)) ORDER BY position",
            LOG_COLUMNS
        ))
        .bind(id)
        .bind(max_retries as i64)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(entry_from_row).collect()
    }

    #[instrument(skip_all)]
    async fn reset_in_flight(&self, id: &str) -> Result<u64> {
        let res = sqlx::query(
            "UPDATE delivery_log SET status = 'pending' WHERE campaign_id = ? AND status = 'sending'",
        )
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(res.rows_affected())
    }

    #[instrument(skip_all)]
    async fn mark_sending(&self, id: &str, position: i64, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE delivery_log SET status = 'sending', last_attempt_at = ? \
             WHERE campaign_id = ? AND position = ?",
        )
        .bind(at)
        .bind(id)
        .bind(position)
        .execute(self.pool())
        .await
        .context("failed to mark recipient as sending")?;
        Ok(())
    }

    #[instrument(skip_all)]
    async fn record_delivery(&self, entry: &DeliveryLogEntry) -> Result<()> {
        let variation = entry.variation_used.as_ref();
        sqlx::query(
            "UPDATE delivery_log SET status = ?, attempts = MAX(attempts, ?), last_attempt_at = ?, \
             response_time_ms = ?, response_code = ?, error_message = ?, variation_index = ?, \
             variation_content = ?, variation_kind = ? WHERE campaign_id = ? AND position = ?",
        )
        .bind(entry.status.as_str())
        .bind(entry.attempts)
        .bind(entry.last_attempt_at)
        .bind(entry.response_time_ms)
        .bind(entry.response_code)
        .bind(entry.error_message.as_deref())
        .bind(variation.map(|v| v.index as i64))
        .bind(variation.map(|v| v.content.as_str()))
        .bind(variation.map(|v| v.kind.as_str()))
        .bind(&entry.campaign_id)
        .bind(entry.position)
        .execute(self.pool())
        .await
        .context("failed to persist delivery log row")?;
        Ok(())
    }
}

//! Persistence seams used by the controller and the dispatch loop.
//!
//! `CampaignStore` owns the campaign record and its delivery log;
//! `SignalStore` owns the per-campaign pause/cancel flags. Both are
//! implemented on SQLite by [`crate::db::SqliteStore`].

use crate::model::{
    Campaign, CampaignConfiguration, CampaignStatus, DeliveryLogEntry, DeliveryStatus,
    NewCampaign, SignalFlag, Statistics,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Row counts of a campaign's delivery log, grouped by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryCounts {
    pub total: i64,
    pub pending: i64,
    pub sending: i64,
    pub success: i64,
    pub error: i64,
}

impl DeliveryCounts {
    pub fn statistics(&self) -> Statistics {
        Statistics::from_counts(self.total, self.success, self.error)
    }
}

#[async_trait]
pub trait CampaignStore: Send + Sync {
    /// Insert the campaign in `draft` (or `scheduled` when a time is given)
    /// together with one pending delivery log row per recipient.
    async fn create_campaign(
        &self,
        new: &NewCampaign,
        configuration: &CampaignConfiguration,
        at: DateTime<Utc>,
    ) -> Result<Campaign>;

    async fn get(&self, id: &str) -> Result<Option<Campaign>>;

    async fn list(&self, limit: i64) -> Result<Vec<Campaign>>;

    /// Remove the campaign, its delivery log and its signal row.
    async fn delete(&self, id: &str) -> Result<bool>;

    /// Conditional status update. Returns `false` when the row's status was
    /// not in `from` at write time. Sets `started_at` on the first move to
    /// `sending` and `concluded_at` on the first move to a terminal status.
    async fn transition(
        &self,
        id: &str,
        from: &[CampaignStatus],
        to: CampaignStatus,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    /// `Some(time)` moves draft/scheduled to scheduled; `None` moves
    /// scheduled back to draft.
    async fn set_schedule(
        &self,
        id: &str,
        scheduled_for: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    async fn due_scheduled(&self, now: DateTime<Utc>) -> Result<Vec<String>>;

    async fn update_statistics(
        &self,
        id: &str,
        statistics: &Statistics,
        at: DateTime<Utc>,
    ) -> Result<()>;

    async fn delivery_counts(&self, id: &str) -> Result<DeliveryCounts>;

    async fn delivery_log(
        &self,
        id: &str,
        status: Option<DeliveryStatus>,
    ) -> Result<Vec<DeliveryLogEntry>>;

    /// Pending rows plus error rows below `max_retries`, in position order.
    async fn retryable_recipients(
        &self,
        id: &str,
        max_retries: u32,
    ) -> Result<Vec<DeliveryLogEntry>>;

    /// Return rows stranded in `sending` by an interrupted loop to `pending`.
    async fn reset_in_flight(&self, id: &str) -> Result<u64>;

    async fn mark_sending(&self, id: &str, position: i64, at: DateTime<Utc>) -> Result<()>;

    async fn record_delivery(&self, entry: &DeliveryLogEntry) -> Result<()>;
}

#[async_trait]
pub trait SignalStore: Send + Sync {
    async fn flags(&self, id: &str) -> Result<SignalFlag>;

    async fn request_pause(&self, id: &str, at: DateTime<Utc>) -> Result<()>;

    async fn request_cancel(&self, id: &str, at: DateTime<Utc>) -> Result<()>;

    /// Reset both flags. Called by `resume` before a new loop is spawned.
    async fn clear(&self, id: &str, at: DateTime<Utc>) -> Result<()>;

    /// Drop flags of terminal campaigns last touched before `older_than`.
    async fn purge_terminal(&self, older_than: DateTime<Utc>) -> Result<u64>;
}

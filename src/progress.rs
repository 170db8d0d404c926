use crate::model::Statistics;
use crate::store::CampaignStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

/// Recomputes a campaign's aggregate statistics from its delivery log.
///
/// Failures are logged and swallowed: a missed update is repaired by the
/// next one, and the loop must keep sending.
#[derive(Clone)]
pub struct ProgressReporter {
    store: Arc<dyn CampaignStore>,
}

impl ProgressReporter {
    pub fn new(store: Arc<dyn CampaignStore>) -> Self {
        Self { store }
    }

    pub async fn report(&self, campaign_id: &str, at: DateTime<Utc>) -> Option<Statistics> {
        let counts = match self.store.delivery_counts(campaign_id).await {
            Ok(counts) => counts,
            Err(err) => {
                warn!(?err, campaign_id, "failed to count delivery log");
                return None;
            }
        };
        let statistics = counts.statistics();
        if let Err(err) = self
            .store
            .update_statistics(campaign_id, &statistics, at)
            .await
        {
            warn!(?err, campaign_id, "failed to persist statistics");
            return None;
        }
        debug!(
            campaign_id,
            sent = statistics.sent,
            success = statistics.success,
            error = statistics.error,
            "statistics updated"
        );
        Some(statistics)
    }
}

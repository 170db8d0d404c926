use crate::controller::CampaignController;
use crate::error::DispatchError;
use crate::store::{CampaignStore, SignalStore};
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Start every scheduled campaign whose time has come. Returns how many
/// loops were started.
///
/// A campaign that has nobody left to send to goes back to draft; any other
/// failure leaves it scheduled for the next poll.
#[instrument(skip_all)]
pub async fn process_due_campaigns(
    store: &dyn CampaignStore,
    controller: &CampaignController,
    now: DateTime<Utc>,
) -> Result<usize> {
    let due = store.due_scheduled(now).await?;
    if due.is_empty() {
        return Ok(0);
    }
    let results = futures::future::join_all(due.iter().map(|id| controller.start(id))).await;

    let mut started = 0;
    for (id, result) in due.iter().zip(results) {
        match result {
            Ok(launched) => {
                started += 1;
                info!(
                    campaign_id = %id,
                    total = launched.snapshot.statistics.total,
                    "scheduled campaign started"
                );
            }
            Err(DispatchError::NoPendingRecipients) => {
                warn!(campaign_id = %id, "scheduled campaign has no recipients left; unscheduling");
                if let Err(err) = controller.unschedule(id).await {
                    warn!(%err, campaign_id = %id, "failed to unschedule campaign");
                }
            }
            Err(err) => warn!(%err, campaign_id = %id, "failed to start scheduled campaign"),
        }
    }
    Ok(started)
}

/// Drop signal flags of finished campaigns older than `retention`.
#[instrument(skip_all)]
pub async fn purge_signals(
    signals: &dyn SignalStore,
    now: DateTime<Utc>,
    retention: Duration,
) -> Result<u64> {
    let retention = chrono::Duration::from_std(retention)?;
    let purged = signals.purge_terminal(now - retention).await?;
    if purged > 0 {
        info!(purged, "purged stale campaign signals");
    }
    Ok(purged)
}

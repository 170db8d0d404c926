mod common;

use chrono::Utc;
use common::*;
use std::sync::Arc;
use std::time::Duration;

use tg_campaign::model::{CampaignStatus, DeliveryStatus};
use tg_campaign::scheduler;
use tg_campaign::store::{CampaignStore, SignalStore};

async fn wait_for_status(
    store: &tg_campaign::db::SqliteStore,
    id: &str,
    status: CampaignStatus,
) {
    for _ in 0..500 {
        if store.get(id).await.unwrap().unwrap().status == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("campaign {id} never reached {status}");
}

#[tokio::test]
async fn due_campaigns_are_started() {
    let store = setup_store().await;
    let clock = Arc::new(ManualClock::new());
    let sender = Arc::new(RecordingSender::new());
    let ctl = controller(store.clone(), sender.clone(), clock.clone());

    let now = Utc::now();
    let mut due = new_campaign(3, fast_config(10));
    due.scheduled_for = Some(now - chrono::Duration::minutes(1));
    let due = ctl.create(due).await.unwrap();
    assert_eq!(due.status, CampaignStatus::Scheduled);

    let mut later = new_campaign(3, fast_config(10));
    later.name = "later".into();
    later.scheduled_for = Some(now + chrono::Duration::hours(1));
    let later = ctl.create(later).await.unwrap();

    let started = scheduler::process_due_campaigns(store.as_ref(), &ctl, now)
        .await
        .unwrap();
    assert_eq!(started, 1);

    wait_for_status(&store, &due.id, CampaignStatus::Completed).await;
    assert_eq!(sender.len(), 3);
    let pending = store.get(&later.id).await.unwrap().unwrap();
    assert_eq!(pending.status, CampaignStatus::Scheduled);

    // Nothing else is due.
    let started = scheduler::process_due_campaigns(store.as_ref(), &ctl, now)
        .await
        .unwrap();
    assert_eq!(started, 0);
}

#[tokio::test]
async fn exhausted_scheduled_campaign_returns_to_draft() {
    let store = setup_store().await;
    let ctl = controller(
        store.clone(),
        Arc::new(RecordingSender::new()),
        Arc::new(ManualClock::new()),
    );
    let now = Utc::now();
    let mut new = new_campaign(1, fast_config(10));
    new.scheduled_for = Some(now - chrono::Duration::seconds(5));
    let created = ctl.create(new).await.unwrap();
    for mut entry in store.delivery_log(&created.id, None).await.unwrap() {
        entry.status = DeliveryStatus::Error;
        entry.attempts = 3;
        store.record_delivery(&entry).await.unwrap();
    }

    let started = scheduler::process_due_campaigns(store.as_ref(), &ctl, now)
        .await
        .unwrap();
    assert_eq!(started, 0);
    let campaign = store.get(&created.id).await.unwrap().unwrap();
    assert_eq!(campaign.status, CampaignStatus::Draft);
    assert!(campaign.timestamps.scheduled_for.is_none());
}

#[tokio::test]
async fn janitor_purges_only_finished_campaigns() {
    let store = setup_store().await;
    let ctl = controller(
        store.clone(),
        Arc::new(RecordingSender::new()),
        Arc::new(ManualClock::new()),
    );
    let finished = ctl.create(new_campaign(1, fast_config(10))).await.unwrap();
    ctl.start(&finished.id).await.unwrap().handle.await.unwrap();

    let mut other = new_campaign(1, fast_config(10));
    other.name = "still a draft".into();
    let draft = ctl.create(other).await.unwrap();

    let old = Utc::now() - chrono::Duration::days(3);
    store.request_pause(&finished.id, old).await.unwrap();
    store.request_pause(&draft.id, old).await.unwrap();

    let purged = scheduler::purge_signals(store.as_ref(), Utc::now(), Duration::from_secs(86_400))
        .await
        .unwrap();
    assert_eq!(purged, 1);
    assert!(store.flags(&finished.id).await.unwrap().updated_at.is_none());
    assert!(store.flags(&draft.id).await.unwrap().should_pause);
}

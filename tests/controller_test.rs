mod common;

use chrono::Utc;
use common::*;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use tg_campaign::controller::CampaignController;
use tg_campaign::dispatch::{DispatchSettings, LoopOutcome};
use tg_campaign::error::DispatchError;
use tg_campaign::model::{CampaignStatus, Content, DeliveryStatus};
use tg_campaign::paraphrase::VariationService;
use tg_campaign::sender::TelegramSender;
use tg_campaign::store::{CampaignStore, SignalStore};

#[tokio::test]
async fn cancel_is_idempotent_and_stops_the_loop() {
    let store = setup_store().await;
    let gate = Arc::new(Semaphore::new(0));
    let sender = Arc::new(RecordingSender::new().gated(gate.clone()));
    let ctl = controller(store.clone(), sender.clone(), Arc::new(ManualClock::new()));

    let created = ctl.create(new_campaign(10, fast_config(5))).await.unwrap();
    let launched = ctl.start(&created.id).await.unwrap();
    sender.wait_for_first_call().await;

    let first = ctl.cancel(&created.id).await.unwrap();
    assert_eq!(first.status, CampaignStatus::Cancelled);
    let second = ctl.cancel(&created.id).await.unwrap();
    assert_eq!(second.status, CampaignStatus::Cancelled);
    assert_eq!(
        first.timestamps.concluded_at,
        second.timestamps.concluded_at
    );

    gate.add_permits(100);
    assert_eq!(launched.handle.await.unwrap(), LoopOutcome::Cancelled);
    // Only the send that was already waiting at the gate went out.
    assert_eq!(sender.len(), 1);

    let campaign = store.get(&created.id).await.unwrap().unwrap();
    assert_eq!(campaign.status, CampaignStatus::Cancelled);
    assert!(campaign.timestamps.concluded_at.is_some());
    assert!(campaign.statistics.is_consistent());
    assert!(store.flags(&created.id).await.unwrap().should_cancel);
    assert!(!ctl.coordinator().is_running(&created.id));
}

#[tokio::test]
async fn resume_waits_for_the_paused_loop_to_exit() {
    let store = setup_store().await;
    let gate = Arc::new(Semaphore::new(0));
    let sender = Arc::new(RecordingSender::new().gated(gate.clone()));
    let ctl = CampaignController::new(
        store.clone(),
        store.clone(),
        sender.clone(),
        Arc::new(ManualClock::new()),
        DispatchSettings {
            handoff_timeout: Duration::from_millis(50),
            ..settings()
        },
    );

    let created = ctl.create(new_campaign(3, fast_config(10))).await.unwrap();
    let launched = ctl.start(&created.id).await.unwrap();
    sender.wait_for_first_call().await;
    let paused = ctl.pause(&created.id).await.unwrap();
    assert_eq!(paused.status, CampaignStatus::Paused);

    // The loop is still blocked inside its first send.
    assert!(matches!(
        ctl.resume(&created.id).await,
        Err(DispatchError::AlreadyRunning(_))
    ));

    gate.add_permits(100);
    assert_eq!(launched.handle.await.unwrap(), LoopOutcome::Paused);

    let resumed = ctl.resume(&created.id).await.unwrap();
    assert_eq!(resumed.handle.await.unwrap(), LoopOutcome::Completed);
    assert_eq!(sender.len(), 3);
    let log = store.delivery_log(&created.id, None).await.unwrap();
    assert!(log.iter().all(|e| e.status == DeliveryStatus::Success));
}

#[tokio::test]
async fn start_is_rejected_outside_startable_states() {
    let store = setup_store().await;
    let sender = Arc::new(RecordingSender::new());
    let ctl = controller(store.clone(), sender, Arc::new(ManualClock::new()));

    let created = ctl.create(new_campaign(2, fast_config(10))).await.unwrap();
    assert!(matches!(
        ctl.pause(&created.id).await,
        Err(DispatchError::InvalidState {
            status: CampaignStatus::Draft,
            operation: "pause"
        })
    ));
    assert!(matches!(
        ctl.resume(&created.id).await,
        Err(DispatchError::InvalidState { .. })
    ));
    assert!(matches!(
        ctl.cancel(&created.id).await,
        Err(DispatchError::InvalidState { .. })
    ));

    ctl.start(&created.id).await.unwrap().handle.await.unwrap();
    assert!(matches!(
        ctl.start(&created.id).await,
        Err(DispatchError::InvalidState {
            status: CampaignStatus::Completed,
            operation: "start"
        })
    ));
    assert!(matches!(
        ctl.cancel(&created.id).await,
        Err(DispatchError::InvalidState {
            status: CampaignStatus::Completed,
            ..
        })
    ));
    assert!(matches!(
        ctl.status("no-such-campaign").await,
        Err(DispatchError::NotFound(_))
    ));
}

#[tokio::test]
async fn missing_credentials_abort_before_any_write() {
    let store = setup_store().await;
    let sender = Arc::new(TelegramSender::new("", Duration::from_secs(1)));
    let ctl = controller(store.clone(), sender, Arc::new(ManualClock::new()));

    let created = ctl.create(new_campaign(2, fast_config(10))).await.unwrap();
    assert!(matches!(
        ctl.start(&created.id).await,
        Err(DispatchError::MissingCredentials)
    ));

    let campaign = store.get(&created.id).await.unwrap().unwrap();
    assert_eq!(campaign.status, CampaignStatus::Draft);
    assert!(campaign.timestamps.started_at.is_none());
    assert!(store.flags(&created.id).await.unwrap().updated_at.is_none());
    let log = store.delivery_log(&created.id, None).await.unwrap();
    assert!(log.iter().all(|e| e.status == DeliveryStatus::Pending));
}

#[tokio::test]
async fn start_on_paused_campaign_resumes_it() {
    let store = setup_store().await;
    let campaign = store
        .create_campaign(&new_campaign(3, fast_config(10)), &fast_config(10), Utc::now())
        .await
        .unwrap();
    let hook_store = store.clone();
    let id = campaign.id.clone();
    let sender = Arc::new(RecordingSender::new().after_send(move |n| {
        let store = hook_store.clone();
        let id = id.clone();
        async move {
            if n == 1 {
                external_pause(&store, &id).await;
            }
        }
    }));
    let ctl = controller(store.clone(), sender.clone(), Arc::new(ManualClock::new()));

    let first = ctl.start(&campaign.id).await.unwrap();
    assert_eq!(first.handle.await.unwrap(), LoopOutcome::Paused);
    let second = ctl.start(&campaign.id).await.unwrap();
    assert_eq!(second.handle.await.unwrap(), LoopOutcome::Completed);
    assert_eq!(sender.len(), 3);
}

#[tokio::test]
async fn create_validates_and_fills_variations() {
    let store = setup_store().await;
    let generator = FailingGenerator::default();
    let calls = generator.calls.clone();
    let service = Arc::new(VariationService::new(
        Some(Box::new(generator)),
        Duration::from_secs(1),
        1,
    ));
    let ctl = controller(
        store.clone(),
        Arc::new(RecordingSender::new()),
        Arc::new(ManualClock::new()),
    )
    .with_variations(service, 3);

    let mut new = new_campaign(2, fast_config(10));
    new.content = Content::Text {
        body: "Hello {name}, we have a new offer for you today".into(),
        variations: vec![],
    };
    let created = ctl.create(new).await.unwrap();
    // Remote failed twice (one retry), so the rule-based generator filled in.
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let campaign = store.get(&created.id).await.unwrap().unwrap();
    let variations = campaign.content.variations();
    assert!(!variations.is_empty());
    assert!(variations.len() <= 3);
    assert!(variations
        .iter()
        .all(|v| v != "Hello {name}, we have a new offer for you today"));

    let mut empty = new_campaign(0, fast_config(10));
    empty.name = "nobody".into();
    assert!(matches!(
        ctl.create(empty).await,
        Err(DispatchError::InvalidCampaign(_))
    ));

    let mut bad_config = new_campaign(1, fast_config(0));
    bad_config.name = "zero batch".into();
    assert!(matches!(
        ctl.create(bad_config).await,
        Err(DispatchError::InvalidCampaign(_))
    ));

    let mut bad_content = new_campaign(1, fast_config(10));
    bad_content.content = Content::Buttons {
        body: "Pick".into(),
        buttons: vec![],
        variations: vec![],
    };
    assert!(matches!(
        ctl.create(bad_content).await,
        Err(DispatchError::InvalidCampaign(_))
    ));
}

#[tokio::test]
async fn schedule_and_unschedule() {
    let store = setup_store().await;
    let ctl = controller(
        store.clone(),
        Arc::new(RecordingSender::new()),
        Arc::new(ManualClock::new()),
    );
    let created = ctl.create(new_campaign(1, fast_config(10))).await.unwrap();
    let at = Utc::now() + chrono::Duration::hours(2);

    let scheduled = ctl.schedule(&created.id, at).await.unwrap();
    assert_eq!(scheduled.status, CampaignStatus::Scheduled);
    assert!(scheduled.timestamps.scheduled_for.is_some());

    let draft = ctl.unschedule(&created.id).await.unwrap();
    assert_eq!(draft.status, CampaignStatus::Draft);
    assert!(matches!(
        ctl.unschedule(&created.id).await,
        Err(DispatchError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn delete_refuses_a_sending_campaign() {
    let store = setup_store().await;
    let gate = Arc::new(Semaphore::new(0));
    let sender = Arc::new(RecordingSender::new().gated(gate.clone()));
    let ctl = controller(store.clone(), sender, Arc::new(ManualClock::new()));

    let created = ctl.create(new_campaign(2, fast_config(10))).await.unwrap();
    let launched = ctl.start(&created.id).await.unwrap();
    assert!(matches!(
        ctl.delete(&created.id).await,
        Err(DispatchError::InvalidState { .. })
    ));

    gate.add_permits(100);
    launched.handle.await.unwrap();
    ctl.delete(&created.id).await.unwrap();
    assert!(matches!(
        ctl.status(&created.id).await,
        Err(DispatchError::NotFound(_))
    ));
    assert!(ctl.list(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn oversized_delays_never_reach_the_loop() {
    let store = setup_store().await;
    let sender = Arc::new(RecordingSender::new());
    let ctl = controller(store.clone(), sender.clone(), Arc::new(ManualClock::new()));

    let mut huge = fast_config(10);
    huge.delay_between_sends = u64::MAX;
    huge.delay_jitter = 1;
    assert!(matches!(
        ctl.create(new_campaign(3, huge.clone())).await,
        Err(DispatchError::InvalidCampaign(_))
    ));

    // A row written before the limits existed is refused at start.
    let stored = store
        .create_campaign(&new_campaign(3, huge.clone()), &huge, Utc::now())
        .await
        .unwrap();
    assert!(matches!(
        ctl.start(&stored.id).await,
        Err(DispatchError::InvalidCampaign(_))
    ));
    let campaign = store.get(&stored.id).await.unwrap().unwrap();
    assert_eq!(campaign.status, CampaignStatus::Draft);
    assert!(campaign.timestamps.started_at.is_none());
    assert!(!ctl.coordinator().is_running(&stored.id));
    assert_eq!(sender.len(), 0);
}

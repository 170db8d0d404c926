#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

use tg_campaign::clock::Clock;
use tg_campaign::controller::CampaignController;
use tg_campaign::db::{self, SqliteStore};
use tg_campaign::dispatch::DispatchSettings;
use tg_campaign::error::{DispatchError, DispatchResult};
use tg_campaign::model::{
    Campaign, CampaignConfiguration, CampaignStatus, Content, DeliveryLogEntry, DeliveryStatus,
    NewCampaign, Recipient, RenderedContent, SignalFlag, Statistics,
};
use tg_campaign::paraphrase::VariationGenerator;
use tg_campaign::sender::{MessageSender, SendReceipt};
use tg_campaign::store::{CampaignStore, DeliveryCounts, SignalStore};

pub async fn setup_store() -> Arc<SqliteStore> {
    // One connection: every handle sees the same in-memory database.
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    db::run_migrations(&pool).await.unwrap();
    Arc::new(SqliteStore::new(pool))
}

pub fn recipients(n: usize) -> Vec<Recipient> {
    (0..n)
        .map(|i| Recipient {
            contact_id: format!("contact-{i}"),
            name: format!("Person {i}"),
            number: format!("{}", 10_000 + i),
        })
        .collect()
}

pub fn fast_config(batch_size: usize) -> CampaignConfiguration {
    CampaignConfiguration {
        delay_between_sends: 1,
        delay_jitter: 0,
        batch_size,
        batch_delay: 60,
        max_retries: 3,
        business_hours_only: false,
    }
}

pub fn new_campaign(n: usize, configuration: CampaignConfiguration) -> NewCampaign {
    NewCampaign {
        name: "spring sale".into(),
        content: Content::Text {
            body: "Hello {name}, spring sale starts today".into(),
            variations: vec![
                "Hi {name}, the spring sale starts today".into(),
                "Hey {name}, our spring sale opens today".into(),
            ],
        },
        configuration: Some(configuration),
        scheduled_for: None,
        recipients: recipients(n),
    }
}

pub fn settings() -> DispatchSettings {
    DispatchSettings {
        send_timeout: Duration::from_secs(5),
        handoff_timeout: Duration::from_secs(5),
        ..DispatchSettings::default()
    }
}

/// Clock whose sleeps return at once and move time forward.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
    sleeps: Mutex<Vec<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::starting_at(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap())
    }

    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }

    async fn sleep(&self, duration: Duration) {
        {
            let mut now = self.now.lock().unwrap();
            *now += chrono::Duration::from_std(duration).unwrap();
            self.sleeps.lock().unwrap().push(duration);
        }
        tokio::task::yield_now().await;
    }
}

type Hook = Box<dyn Fn(usize) -> futures::future::BoxFuture<'static, ()> + Send + Sync>;

/// Sender that records every call. Numbers in `failing` always fail; the
/// optional hook runs after the n-th send (1-based); the optional gate makes
/// each send wait for a permit.
#[derive(Default)]
pub struct RecordingSender {
    pub sent: Mutex<Vec<(Recipient, RenderedContent)>>,
    failing: HashSet<String>,
    hook: Option<Hook>,
    gate: Option<Arc<Semaphore>>,
    count: AtomicUsize,
    entered: AtomicUsize,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(mut self, numbers: &[&str]) -> Self {
        self.failing = numbers.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn after_send<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(usize) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.hook = Some(Box::new(move |n| Box::pin(hook(n))));
        self
    }

    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn numbers(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(r, _)| r.number.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    /// Resolves once at least one send has begun (it may still be gated).
    pub async fn wait_for_first_call(&self) {
        while self.entered.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

#[async_trait]
impl MessageSender for RecordingSender {
    async fn send(
        &self,
        recipient: &Recipient,
        content: &RenderedContent,
    ) -> DispatchResult<SendReceipt> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        self.sent
            .lock()
            .unwrap()
            .push((recipient.clone(), content.clone()));
        let n = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(hook) = &self.hook {
            hook(n).await;
        }
        if self.failing.contains(&recipient.number) {
            return Err(DispatchError::transport(Some(403), "bot was blocked by the user"));
        }
        Ok(SendReceipt {
            response_code: Some(200),
        })
    }
}

/// Store wrapper whose campaign reads or flag reads can be switched to fail.
pub struct FlakyStore {
    pub inner: Arc<SqliteStore>,
    pub fail_get: Arc<AtomicBool>,
    pub fail_flags: Arc<AtomicBool>,
}

impl FlakyStore {
    pub fn new(inner: Arc<SqliteStore>) -> Self {
        Self {
            inner,
            fail_get: Arc::new(AtomicBool::new(false)),
            fail_flags: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl CampaignStore for FlakyStore {
    async fn create_campaign(
        &self,
        new: &NewCampaign,
        configuration: &CampaignConfiguration,
        at: DateTime<Utc>,
    ) -> Result<Campaign> {
        self.inner.create_campaign(new, configuration, at).await
    }

    async fn get(&self, id: &str) -> Result<Option<Campaign>> {
        if self.fail_get.load(Ordering::SeqCst) {
            return Err(anyhow!("database is locked"));
        }
        self.inner.get(id).await
    }

    async fn list(&self, limit: i64) -> Result<Vec<Campaign>> {
        self.inner.list(limit).await
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        self.inner.delete(id).await
    }

    async fn transition(
        &self,
        id: &str,
        from: &[CampaignStatus],
        to: CampaignStatus,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        self.inner.transition(id, from, to, at).await
    }

    async fn set_schedule(
        &self,
        id: &str,
        scheduled_for: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        self.inner.set_schedule(id, scheduled_for, at).await
    }

    async fn due_scheduled(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        self.inner.due_scheduled(now).await
    }

    async fn update_statistics(
        &self,
        id: &str,
        statistics: &Statistics,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.inner.update_statistics(id, statistics, at).await
    }

    async fn delivery_counts(&self, id: &str) -> Result<DeliveryCounts> {
        self.inner.delivery_counts(id).await
    }

    async fn delivery_log(
        &self,
        id: &str,
        status: Option<DeliveryStatus>,
    ) -> Result<Vec<DeliveryLogEntry>> {
        self.inner.delivery_log(id, status).await
    }

    async fn retryable_recipients(
        &self,
        id: &str,
        max_retries: u32,
    ) -> Result<Vec<DeliveryLogEntry>> {
        self.inner.retryable_recipients(id, max_retries).await
    }

    async fn reset_in_flight(&self, id: &str) -> Result<u64> {
        self.inner.reset_in_flight(id).await
    }

    async fn mark_sending(&self, id: &str, position: i64, at: DateTime<Utc>) -> Result<()> {
        self.inner.mark_sending(id, position, at).await
    }

    async fn record_delivery(&self, entry: &DeliveryLogEntry) -> Result<()> {
        self.inner.record_delivery(entry).await
    }
}

#[async_trait]
impl SignalStore for FlakyStore {
    async fn flags(&self, id: &str) -> Result<SignalFlag> {
        if self.fail_flags.load(Ordering::SeqCst) {
            return Err(anyhow!("signal table unavailable"));
        }
        self.inner.flags(id).await
    }

    async fn request_pause(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        self.inner.request_pause(id, at).await
    }

    async fn request_cancel(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        self.inner.request_cancel(id, at).await
    }

    async fn clear(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        self.inner.clear(id, at).await
    }

    async fn purge_terminal(&self, older_than: DateTime<Utc>) -> Result<u64> {
        self.inner.purge_terminal(older_than).await
    }
}

/// Generator that always fails and counts its calls.
#[derive(Default)]
pub struct FailingGenerator {
    pub calls: Arc<AtomicUsize>,
}

#[async_trait]
impl VariationGenerator for FailingGenerator {
    async fn generate(&self, _base_text: &str, _count: usize) -> Result<Vec<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(anyhow!("upstream returned 503"))
    }
}

pub fn controller(
    store: Arc<SqliteStore>,
    sender: Arc<dyn MessageSender>,
    clock: Arc<dyn Clock>,
) -> CampaignController {
    CampaignController::new(store.clone(), store, sender, clock, settings())
}

/// Simulate a pause issued by another process: persist the flag and move the
/// status, without touching any local loop.
pub async fn external_pause(store: &SqliteStore, id: &str) {
    let now = Utc::now();
    store.request_pause(id, now).await.unwrap();
    store
        .transition(id, &[CampaignStatus::Sending], CampaignStatus::Paused, now)
        .await
        .unwrap();
}

/// Simulate a cancel issued by another process.
pub async fn external_cancel(store: &SqliteStore, id: &str) {
    let now = Utc::now();
    store.request_cancel(id, now).await.unwrap();
    store
        .transition(
            id,
            &[CampaignStatus::Sending, CampaignStatus::Paused],
            CampaignStatus::Cancelled,
            now,
        )
        .await
        .unwrap();
}

pub async fn statistics_of(store: &SqliteStore, id: &str) -> Statistics {
    store.get(id).await.unwrap().unwrap().statistics
}

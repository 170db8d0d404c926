//! Control surface for campaigns.
//!
//! Every mutating call validates the campaign's current status before it
//! writes anything, then changes status through a conditional update. Calls
//! that start sending detach a [`DispatchLoop`] and return immediately.

use crate::clock::Clock;
use crate::config::validate_campaign;
use crate::coordinator::{DispatchCoordinator, DispatchRegistration};
use crate::dispatch::{DispatchLoop, DispatchSettings, LoopOutcome};
use crate::error::{DispatchError, DispatchResult};
use crate::model::{
    Campaign, CampaignConfiguration, CampaignSnapshot, CampaignStatus, DeliveryLogEntry,
    DeliveryStatus, NewCampaign,
};
use crate::paraphrase::VariationService;
use crate::sender::MessageSender;
use crate::store::{CampaignStore, SignalStore};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

/// A freshly started loop. Dropping `handle` leaves the loop running.
#[derive(Debug)]
pub struct Launched {
    pub snapshot: CampaignSnapshot,
    pub handle: JoinHandle<LoopOutcome>,
}

#[derive(Clone)]
pub struct CampaignController {
    store: Arc<dyn CampaignStore>,
    signals: Arc<dyn SignalStore>,
    sender: Arc<dyn MessageSender>,
    clock: Arc<dyn Clock>,
    coordinator: DispatchCoordinator,
    variations: Option<Arc<VariationService>>,
    variation_count: usize,
    defaults: CampaignConfiguration,
    settings: DispatchSettings,
}

impl CampaignController {
    pub fn new(
        store: Arc<dyn CampaignStore>,
        signals: Arc<dyn SignalStore>,
        sender: Arc<dyn MessageSender>,
        clock: Arc<dyn Clock>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            store,
            signals,
            sender,
            clock,
            coordinator: DispatchCoordinator::new(),
            variations: None,
            variation_count: 0,
            defaults: CampaignConfiguration::default(),
            settings,
        }
    }

    /// Generate up to `count` paraphrases for campaigns created without any.
    pub fn with_variations(mut self, service: Arc<VariationService>, count: usize) -> Self {
        self.variations = Some(service);
        self.variation_count = count;
        self
    }

    /// Configuration used when a new campaign does not carry its own.
    pub fn with_defaults(mut self, defaults: CampaignConfiguration) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn coordinator(&self) -> &DispatchCoordinator {
        &self.coordinator
    }

    async fn load(&self, id: &str) -> DispatchResult<Campaign> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| DispatchError::NotFound(id.to_string()))
    }

    async fn snapshot(&self, id: &str) -> DispatchResult<CampaignSnapshot> {
        let campaign = self.load(id).await?;
        Ok(CampaignSnapshot::of(
            &campaign,
            self.coordinator.is_running(id),
        ))
    }

    /// The status the row holds now, for reporting a lost conditional update.
    async fn current_status(&self, id: &str) -> DispatchResult<CampaignStatus> {
        Ok(self.load(id).await?.status)
    }

    #[instrument(skip_all, fields(name = %new.name))]
    pub async fn create(&self, mut new: NewCampaign) -> DispatchResult<CampaignSnapshot> {
        if new.name.trim().is_empty() {
            return Err(DispatchError::InvalidCampaign("name must be non-empty".into()));
        }
        new.content
            .validate()
            .map_err(|msg| DispatchError::InvalidCampaign(msg.to_string()))?;
        if new.recipients.is_empty() {
            return Err(DispatchError::InvalidCampaign(
                "at least one recipient is required".into(),
            ));
        }
        let configuration = new
            .configuration
            .clone()
            .unwrap_or_else(|| self.defaults.clone());
        validate_campaign(&configuration)
            .map_err(|err| DispatchError::InvalidCampaign(err.to_string()))?;

        if new.content.variations().is_empty() {
            if let Some(service) = &self.variations {
                let generated = service
                    .variations_for(new.content.base_text(), self.variation_count)
                    .await;
                new.content.set_variations(generated);
            }
        }

        let campaign = self
            .store
            .create_campaign(&new, &configuration, self.clock.now())
            .await?;
        info!(
            campaign_id = %campaign.id,
            recipients = campaign.statistics.total,
            variations = campaign.content.variations().len(),
            "campaign created"
        );
        Ok(CampaignSnapshot::of(&campaign, false))
    }

    pub async fn schedule(
        &self,
        id: &str,
        at: DateTime<Utc>,
    ) -> DispatchResult<CampaignSnapshot> {
        let campaign = self.load(id).await?;
        if !matches!(
            campaign.status,
            CampaignStatus::Draft | CampaignStatus::Scheduled
        ) {
            return Err(DispatchError::invalid_state(campaign.status, "schedule"));
        }
        if !self.store.set_schedule(id, Some(at), self.clock.now()).await? {
            return Err(DispatchError::invalid_state(
                self.current_status(id).await?,
                "schedule",
            ));
        }
        info!(campaign_id = id, %at, "campaign scheduled");
        self.snapshot(id).await
    }

    pub async fn unschedule(&self, id: &str) -> DispatchResult<CampaignSnapshot> {
        let campaign = self.load(id).await?;
        if campaign.status != CampaignStatus::Scheduled {
            return Err(DispatchError::invalid_state(campaign.status, "unschedule"));
        }
        if !self.store.set_schedule(id, None, self.clock.now()).await? {
            return Err(DispatchError::invalid_state(
                self.current_status(id).await?,
                "unschedule",
            ));
        }
        self.snapshot(id).await
    }

    /// Begin sending a draft or scheduled campaign. A paused campaign is
    /// resumed instead.
    #[instrument(skip_all, fields(campaign_id = id))]
    pub async fn start(&self, id: &str) -> DispatchResult<Launched> {
        let campaign = self.load(id).await?;
        match campaign.status {
            CampaignStatus::Paused => return self.resume(id).await,
            CampaignStatus::Draft | CampaignStatus::Scheduled => {}
            other => return Err(DispatchError::invalid_state(other, "start")),
        }
        self.sender.ensure_configured()?;
        self.launch(
            campaign,
            &[CampaignStatus::Draft, CampaignStatus::Scheduled],
            "start",
        )
        .await
    }

    #[instrument(skip_all, fields(campaign_id = id))]
    pub async fn pause(&self, id: &str) -> DispatchResult<CampaignSnapshot> {
        let campaign = self.load(id).await?;
        if campaign.status != CampaignStatus::Sending {
            return Err(DispatchError::invalid_state(campaign.status, "pause"));
        }
        let now = self.clock.now();
        self.signals.request_pause(id, now).await?;
        if !self
            .store
            .transition(id, &[CampaignStatus::Sending], CampaignStatus::Paused, now)
            .await?
        {
            return Err(DispatchError::invalid_state(
                self.current_status(id).await?,
                "pause",
            ));
        }
        info!("pause requested");
        self.snapshot(id).await
    }

    #[instrument(skip_all, fields(campaign_id = id))]
    pub async fn resume(&self, id: &str) -> DispatchResult<Launched> {
        let campaign = self.load(id).await?;
        if campaign.status != CampaignStatus::Paused {
            return Err(DispatchError::invalid_state(campaign.status, "resume"));
        }
        self.sender.ensure_configured()?;
        // A local loop may still be between its last send and its next
        // checkpoint; it must exit before the flags are cleared.
        if !self
            .coordinator
            .wait_idle(id, self.settings.handoff_timeout)
            .await
        {
            return Err(DispatchError::AlreadyRunning(id.to_string()));
        }
        self.launch(campaign, &[CampaignStatus::Paused], "resume")
            .await
    }

    #[instrument(skip_all, fields(campaign_id = id))]
    pub async fn cancel(&self, id: &str) -> DispatchResult<CampaignSnapshot> {
        let campaign = self.load(id).await?;
        match campaign.status {
            CampaignStatus::Cancelled => return self.snapshot(id).await,
            CampaignStatus::Sending | CampaignStatus::Paused => {}
            other => return Err(DispatchError::invalid_state(other, "cancel")),
        }
        let now = self.clock.now();
        self.signals.request_cancel(id, now).await?;
        let moved = self
            .store
            .transition(
                id,
                &[CampaignStatus::Sending, CampaignStatus::Paused],
                CampaignStatus::Cancelled,
                now,
            )
            .await?;
        if !moved {
            let status = self.current_status(id).await?;
            if status != CampaignStatus::Cancelled {
                return Err(DispatchError::invalid_state(status, "cancel"));
            }
        }
        if self.coordinator.abort(id) {
            info!("woke local dispatch loop");
        }
        info!("campaign cancelled");
        self.snapshot(id).await
    }

    pub async fn status(&self, id: &str) -> DispatchResult<CampaignSnapshot> {
        self.snapshot(id).await
    }

    pub async fn list(&self, limit: i64) -> DispatchResult<Vec<CampaignSnapshot>> {
        let campaigns = self.store.list(limit).await?;
        Ok(campaigns
            .iter()
            .map(|c| CampaignSnapshot::of(c, self.coordinator.is_running(&c.id)))
            .collect())
    }

    pub async fn delivery_log(
        &self,
        id: &str,
        status: Option<DeliveryStatus>,
    ) -> DispatchResult<Vec<DeliveryLogEntry>> {
        self.load(id).await?;
        Ok(self.store.delivery_log(id, status).await?)
    }

    /// Remove a campaign that is not currently sending.
    #[instrument(skip_all, fields(campaign_id = id))]
    pub async fn delete(&self, id: &str) -> DispatchResult<()> {
        let campaign = self.load(id).await?;
        if campaign.status == CampaignStatus::Sending || self.coordinator.is_running(id) {
            return Err(DispatchError::invalid_state(campaign.status, "delete"));
        }
        if !self.store.delete(id).await? {
            return Err(DispatchError::NotFound(id.to_string()));
        }
        info!("campaign deleted");
        Ok(())
    }

    /// Loops running in this process.
    pub fn running(&self) -> Vec<DispatchRegistration> {
        self.coordinator.registrations()
    }

    async fn launch(
        &self,
        mut campaign: Campaign,
        from: &[CampaignStatus],
        operation: &'static str,
    ) -> DispatchResult<Launched> {
        // Stored rows may predate the current limits.
        validate_campaign(&campaign.configuration)
            .map_err(|err| DispatchError::InvalidCampaign(err.to_string()))?;
        let id = campaign.id.clone();
        let now = self.clock.now();
        let guard = self.coordinator.try_register(&id, now)?;

        let stranded = self.store.reset_in_flight(&id).await?;
        if stranded > 0 {
            warn!(campaign_id = %id, stranded, "returned interrupted sends to pending");
        }
        let recipients = self
            .store
            .retryable_recipients(&id, campaign.configuration.max_retries)
            .await?;
        if recipients.is_empty() {
            return Err(DispatchError::NoPendingRecipients);
        }

        self.signals.clear(&id, now).await?;
        if !self
            .store
            .transition(&id, from, CampaignStatus::Sending, now)
            .await?
        {
            return Err(DispatchError::invalid_state(
                self.current_status(&id).await?,
                operation,
            ));
        }
        campaign.status = CampaignStatus::Sending;

        info!(
            campaign_id = %id,
            operation,
            recipients = recipients.len(),
            "spawning dispatch loop"
        );
        let handle = DispatchLoop::new(
            campaign,
            self.store.clone(),
            self.signals.clone(),
            self.sender.clone(),
            self.clock.clone(),
            self.settings.clone(),
            guard,
        )
        .spawn(recipients);

        Ok(Launched {
            snapshot: self.snapshot(&id).await?,
            handle,
        })
    }
}

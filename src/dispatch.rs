//! The paced send loop for one campaign.
//!
//! A loop owns its campaign's delivery log while it runs. It works through the
//! retryable recipients in batches, consults the signal store before every
//! batch and every message, and records one outcome per send. Control calls
//! never touch the loop directly: they persist a flag and the loop reacts at
//! its next checkpoint.

use crate::clock::Clock;
use crate::config::{BusinessHours, Config};
use crate::coordinator::LoopGuard;
use crate::error::{DispatchError, DispatchResult};
use crate::model::{Campaign, CampaignStatus, DeliveryLogEntry, DeliveryStatus};
use crate::progress::ProgressReporter;
use crate::sender::MessageSender;
use crate::store::{CampaignStore, SignalStore};
use crate::variation::{VariationSelector, DEFAULT_ORIGINAL_WEIGHT};
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// Loop-wide knobs that do not live on the campaign record.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub send_timeout: Duration,
    pub max_signal_failures: u32,
    pub business_hours: BusinessHours,
    pub original_weight: f64,
    /// How long `resume` waits for a local loop to exit after a pause.
    pub handoff_timeout: Duration,
    /// Longest single sleep while waiting for business hours.
    pub wait_slice: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(30),
            max_signal_failures: 3,
            business_hours: BusinessHours::default(),
            original_weight: DEFAULT_ORIGINAL_WEIGHT,
            handoff_timeout: Duration::from_secs(30),
            wait_slice: Duration::from_secs(60),
        }
    }
}

impl DispatchSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            send_timeout: cfg.send_timeout(),
            max_signal_failures: cfg.dispatch.max_signal_failures.max(1),
            business_hours: cfg.dispatch.business_hours,
            original_weight: cfg.variations.original_weight,
            handoff_timeout: Duration::from_secs(cfg.dispatch.handoff_timeout_seconds),
            ..Self::default()
        }
    }
}

/// How a loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopOutcome {
    Completed,
    /// Stopped on a pause request; the campaign can be resumed.
    Paused,
    Cancelled,
    /// A systemic failure ended the loop and the campaign was cancelled.
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Completed,
    Paused,
    Cancelled,
}

/// Everything a loop needs besides its recipient list.
pub struct DispatchLoop {
    campaign: Campaign,
    store: Arc<dyn CampaignStore>,
    signals: Arc<dyn SignalStore>,
    sender: Arc<dyn MessageSender>,
    clock: Arc<dyn Clock>,
    reporter: ProgressReporter,
    selector: VariationSelector,
    settings: DispatchSettings,
    guard: LoopGuard,
    signal_failures: u32,
}

impl DispatchLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        campaign: Campaign,
        store: Arc<dyn CampaignStore>,
        signals: Arc<dyn SignalStore>,
        sender: Arc<dyn MessageSender>,
        clock: Arc<dyn Clock>,
        settings: DispatchSettings,
        guard: LoopGuard,
    ) -> Self {
        Self {
            campaign,
            reporter: ProgressReporter::new(store.clone()),
            store,
            signals,
            sender,
            clock,
            selector: VariationSelector::new(settings.original_weight),
            settings,
            guard,
            signal_failures: 0,
        }
    }

    /// Detach the loop onto the runtime.
    pub fn spawn(self, recipients: Vec<DeliveryLogEntry>) -> JoinHandle<LoopOutcome> {
        tokio::spawn(self.run(recipients))
    }

    #[instrument(skip_all, fields(campaign_id = %self.campaign.id))]
    pub async fn run(mut self, recipients: Vec<DeliveryLogEntry>) -> LoopOutcome {
        info!(recipients = recipients.len(), "dispatch loop started");
        let outcome = match self.drive(&recipients).await {
            Ok(Stop::Completed) => self.conclude(CampaignStatus::Completed).await,
            Ok(Stop::Paused) => {
                info!("dispatch loop paused");
                LoopOutcome::Paused
            }
            Ok(Stop::Cancelled) => self.conclude(CampaignStatus::Cancelled).await,
            Err(err) => {
                error!(%err, "dispatch loop failed; cancelling campaign");
                self.conclude(CampaignStatus::Cancelled).await;
                LoopOutcome::Failed(err.to_string())
            }
        };
        self.reporter
            .report(&self.campaign.id, self.clock.now())
            .await;
        outcome
    }

    async fn drive(&mut self, recipients: &[DeliveryLogEntry]) -> DispatchResult<Stop> {
        let batch_size = self.campaign.configuration.batch_size.max(1);
        let batch_count = recipients.len().div_ceil(batch_size);

        for (batch_index, batch) in recipients.chunks(batch_size).enumerate() {
            if let Some(stop) = self.checkpoint().await? {
                return Ok(stop);
            }
            if let Some(stop) = self.reload().await? {
                return Ok(stop);
            }
            if let Some(stop) = self.wait_for_business_hours().await? {
                return Ok(stop);
            }
            debug!(batch = batch_index, size = batch.len(), "processing batch");

            for (i, entry) in batch.iter().enumerate() {
                if let Some(stop) = self.checkpoint().await? {
                    return Ok(stop);
                }
                self.deliver(entry).await?;
                if i + 1 < batch.len() {
                    let delay = self.jitter();
                    self.sleep(delay).await;
                }
            }

            self.reporter
                .report(&self.campaign.id, self.clock.now())
                .await;
            if batch_index + 1 < batch_count {
                self.sleep(self.campaign.configuration.batch_delay()).await;
            }
        }
        Ok(Stop::Completed)
    }

    /// Read the control flags. A local abort counts as a cancel.
    async fn checkpoint(&mut self) -> DispatchResult<Option<Stop>> {
        if self.guard.abort_token().is_cancelled() {
            return Ok(Some(Stop::Cancelled));
        }
        match self.signals.flags(&self.campaign.id).await {
            Ok(flags) => {
                self.signal_failures = 0;
                if flags.should_cancel {
                    Ok(Some(Stop::Cancelled))
                } else if flags.should_pause {
                    Ok(Some(Stop::Paused))
                } else {
                    Ok(None)
                }
            }
            Err(err) => {
                self.signal_failures += 1;
                warn!(
                    ?err,
                    failures = self.signal_failures,
                    "failed to read control signals"
                );
                if self.signal_failures >= self.settings.max_signal_failures {
                    return Err(DispatchError::Systemic(format!(
                        "signal store unavailable after {} attempts: {err:#}",
                        self.signal_failures
                    )));
                }
                Ok(None)
            }
        }
    }

    /// Confirm the campaign still exists and is still sending.
    async fn reload(&mut self) -> DispatchResult<Option<Stop>> {
        let current = self
            .store
            .get(&self.campaign.id)
            .await
            .map_err(|err| DispatchError::Systemic(format!("failed to reload campaign: {err:#}")))?
            .ok_or_else(|| {
                DispatchError::Systemic(format!("campaign {} disappeared", self.campaign.id))
            })?;
        match current.status {
            CampaignStatus::Sending => {
                self.campaign = current;
                Ok(None)
            }
            CampaignStatus::Paused => Ok(Some(Stop::Paused)),
            CampaignStatus::Cancelled => Ok(Some(Stop::Cancelled)),
            other => Err(DispatchError::Systemic(format!(
                "campaign is unexpectedly in status '{other}'"
            ))),
        }
    }

    async fn wait_for_business_hours(&mut self) -> DispatchResult<Option<Stop>> {
        if !self.campaign.configuration.business_hours_only {
            return Ok(None);
        }
        loop {
            let wait = self.settings.business_hours.until_open(self.clock.now());
            if wait.is_zero() {
                return Ok(None);
            }
            debug!(?wait, "outside business hours");
            self.sleep(wait.min(self.settings.wait_slice)).await;
            if let Some(stop) = self.checkpoint().await? {
                return Ok(Some(stop));
            }
        }
    }

    async fn deliver(&self, entry: &DeliveryLogEntry) -> DispatchResult<()> {
        let id = self.campaign.id.clone();
        let attempted_at = self.clock.now();
        if let Err(err) = self.store.mark_sending(&id, entry.position, attempted_at).await {
            warn!(?err, position = entry.position, "failed to mark recipient as sending");
        }

        let recipient = entry.recipient();
        let candidates = self.campaign.content.candidates();
        let (text, variation_used) = self.selector.select(&candidates, entry.position as u64);
        let rendered = self.campaign.content.render(text, &recipient);

        let started = Instant::now();
        let result = match tokio::time::timeout(
            self.settings.send_timeout,
            self.sender.send(&recipient, &rendered),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(DispatchError::transport(
                None,
                format!("send timed out after {:?}", self.settings.send_timeout),
            )),
        };

        let mut updated = entry.clone();
        updated.last_attempt_at = Some(attempted_at);
        updated.response_time_ms = Some(started.elapsed().as_millis() as i64);
        updated.variation_used = variation_used;

        let mut escalate = None;
        match result {
            Ok(receipt) => {
                updated.status = DeliveryStatus::Success;
                updated.response_code = receipt.response_code;
                updated.error_message = None;
            }
            Err(err) => {
                updated.status = DeliveryStatus::Error;
                updated.attempts += 1;
                updated.error_message = Some(err.to_string());
                updated.response_code = match &err {
                    DispatchError::Transport { code, .. } => *code,
                    _ => None,
                };
                warn!(
                    position = entry.position,
                    attempts = updated.attempts,
                    %err,
                    "delivery failed"
                );
                if !matches!(err, DispatchError::Transport { .. }) {
                    escalate = Some(err);
                }
            }
        }

        if let Err(err) = self.store.record_delivery(&updated).await {
            warn!(?err, position = entry.position, "failed to persist delivery outcome");
        }
        let now = self.clock.now();
        self.reporter.report(&id, now).await;
        self.guard.heartbeat(now);

        match escalate {
            Some(err) => Err(DispatchError::Systemic(err.to_string())),
            None => Ok(()),
        }
    }

    /// Write the terminal status. Completion only moves a `sending` row; if
    /// the row changed underneath, the outcome follows what is stored.
    async fn conclude(&self, to: CampaignStatus) -> LoopOutcome {
        let from: &[CampaignStatus] = match to {
            CampaignStatus::Completed => &[CampaignStatus::Sending],
            _ => &[CampaignStatus::Sending, CampaignStatus::Paused],
        };
        match self
            .store
            .transition(&self.campaign.id, from, to, self.clock.now())
            .await
        {
            Ok(true) => {
                info!(status = %to, "dispatch loop concluded");
                outcome_for(to)
            }
            Ok(false) => match self.store.get(&self.campaign.id).await {
                Ok(Some(current)) => {
                    info!(
                        wanted = %to,
                        status = %current.status,
                        "campaign status already changed; leaving it"
                    );
                    outcome_for(current.status)
                }
                Ok(None) => {
                    warn!("campaign deleted before the loop concluded");
                    LoopOutcome::Cancelled
                }
                Err(err) => {
                    error!(?err, "failed to re-read campaign after a lost transition");
                    outcome_for(to)
                }
            },
            Err(err) => {
                error!(?err, status = %to, "failed to record final status");
                outcome_for(to)
            }
        }
    }

    /// Uniform delay in `[delay_between_sends, delay_between_sends + delay_jitter]`.
    fn jitter(&self) -> Duration {
        let (min, max) = self.campaign.configuration.jitter_bounds();
        let millis = |d: Duration| u64::try_from(d.as_millis()).unwrap_or(u64::MAX);
        let (min_ms, max_ms) = (millis(min), millis(max));
        if max_ms <= min_ms {
            return min;
        }
        Duration::from_millis(rand::rng().random_range(min_ms..=max_ms))
    }

    /// Sleep through the clock, waking early on a local abort.
    async fn sleep(&self, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        tokio::select! {
            _ = self.clock.sleep(duration) => {}
            _ = self.guard.abort_token().cancelled() => {
                debug!("sleep interrupted by local abort");
            }
        }
    }
}

fn outcome_for(status: CampaignStatus) -> LoopOutcome {
    match status {
        CampaignStatus::Completed => LoopOutcome::Completed,
        CampaignStatus::Paused => LoopOutcome::Paused,
        _ => LoopOutcome::Cancelled,
    }
}

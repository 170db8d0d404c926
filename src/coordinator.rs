//! Process-local registry of running dispatch loops.
//!
//! This registry only sees loops spawned by the current process. It rejects
//! a duplicate local start and lets a local cancel wake a sleeping loop
//! early. It is never consulted to decide whether a campaign is paused or
//! cancelled; that is the signal store's job.

use crate::error::DispatchError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationStatus {
    Running,
    Aborting,
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchRegistration {
    pub campaign_id: String,
    pub status: RegistrationStatus,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

struct Entry {
    registration: DispatchRegistration,
    abort: CancellationToken,
    finished: CancellationToken,
}

#[derive(Clone, Default)]
pub struct DispatchCoordinator {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl std::fmt::Debug for DispatchCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchCoordinator")
            .field("running", &self.lock().len())
            .finish()
    }
}

impl DispatchCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim the local slot for `campaign_id`. The returned guard releases it
    /// when dropped.
    pub fn try_register(
        &self,
        campaign_id: &str,
        now: DateTime<Utc>,
    ) -> Result<LoopGuard, DispatchError> {
        let mut entries = self.lock();
        if entries.contains_key(campaign_id) {
            return Err(DispatchError::AlreadyRunning(campaign_id.to_string()));
        }
        let abort = CancellationToken::new();
        entries.insert(
            campaign_id.to_string(),
            Entry {
                registration: DispatchRegistration {
                    campaign_id: campaign_id.to_string(),
                    status: RegistrationStatus::Running,
                    started_at: now,
                    last_heartbeat: now,
                },
                abort: abort.clone(),
                finished: CancellationToken::new(),
            },
        );
        debug!(campaign_id, "registered dispatch loop");
        Ok(LoopGuard {
            campaign_id: campaign_id.to_string(),
            coordinator: self.clone(),
            abort,
        })
    }

    pub fn is_running(&self, campaign_id: &str) -> bool {
        self.lock().contains_key(campaign_id)
    }

    /// Best-effort local abort. Returns whether a local loop was found.
    pub fn abort(&self, campaign_id: &str) -> bool {
        let mut entries = self.lock();
        match entries.get_mut(campaign_id) {
            Some(entry) => {
                entry.registration.status = RegistrationStatus::Aborting;
                entry.abort.cancel();
                true
            }
            None => false,
        }
    }

    /// Wait until no local loop is registered for `campaign_id`. Returns
    /// `false` if one is still registered after `timeout`.
    pub async fn wait_idle(&self, campaign_id: &str, timeout: Duration) -> bool {
        let Some(finished) = self.finished_token(campaign_id) else {
            return true;
        };
        tokio::time::timeout(timeout, finished.cancelled())
            .await
            .is_ok()
    }

    fn finished_token(&self, campaign_id: &str) -> Option<CancellationToken> {
        self.lock().get(campaign_id).map(|e| e.finished.clone())
    }

    pub fn registrations(&self) -> Vec<DispatchRegistration> {
        let mut out: Vec<_> = self
            .lock()
            .values()
            .map(|e| e.registration.clone())
            .collect();
        out.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        out
    }

    fn heartbeat(&self, campaign_id: &str, now: DateTime<Utc>) {
        if let Some(entry) = self.lock().get_mut(campaign_id) {
            entry.registration.last_heartbeat = now;
        }
    }

    fn release(&self, campaign_id: &str) {
        if let Some(entry) = self.lock().remove(campaign_id) {
            entry.finished.cancel();
            debug!(campaign_id, "released dispatch loop");
        }
    }
}

/// Held by a running loop for its whole lifetime.
pub struct LoopGuard {
    campaign_id: String,
    coordinator: DispatchCoordinator,
    abort: CancellationToken,
}

impl LoopGuard {
    /// Fires when a local cancel was requested for this loop.
    pub fn abort_token(&self) -> &CancellationToken {
        &self.abort
    }

    pub fn heartbeat(&self, now: DateTime<Utc>) {
        self.coordinator.heartbeat(&self.campaign_id, now);
    }
}

impl Drop for LoopGuard {
    fn drop(&mut self) {
        self.coordinator.release(&self.campaign_id);
    }
}

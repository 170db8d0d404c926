//! Error taxonomy shared by the control surface and the dispatch loop.
use crate::model::CampaignStatus;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    /// The operation is not legal for the campaign's current status.
    #[error("cannot {operation} a campaign in status '{status}'")]
    InvalidState {
        status: CampaignStatus,
        operation: &'static str,
    },
    #[error("campaign has no pending or retryable recipients")]
    NoPendingRecipients,
    /// The messaging channel is not configured; raised before any send.
    #[error("messaging channel credentials are not configured")]
    MissingCredentials,
    /// Per-message delivery failure. Recorded on the delivery log entry.
    #[error("transport error{}: {message}", code_suffix(.code))]
    Transport { code: Option<i32>, message: String },
    #[error("persistence error: {0:#}")]
    Persistence(#[from] anyhow::Error),
    /// Loop-level failure; the campaign is cancelled when this escapes the loop.
    #[error("systemic failure: {0}")]
    Systemic(String),
    #[error("campaign {0} not found")]
    NotFound(String),
    #[error("a dispatch loop for campaign {0} is already running in this process")]
    AlreadyRunning(String),
    #[error("invalid campaign: {0}")]
    InvalidCampaign(String),
}

impl DispatchError {
    pub fn invalid_state(status: CampaignStatus, operation: &'static str) -> Self {
        DispatchError::InvalidState { status, operation }
    }

    pub fn transport(code: Option<i32>, message: impl Into<String>) -> Self {
        DispatchError::Transport {
            code,
            message: message.into(),
        }
    }
}

fn code_suffix(code: &Option<i32>) -> String {
    code.map(|c| format!(" ({c})")).unwrap_or_default()
}

pub type DispatchResult<T> = Result<T, DispatchError>;

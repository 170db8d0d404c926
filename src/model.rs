use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Sending,
    Paused,
    Completed,
    Cancelled,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Scheduled => "scheduled",
            CampaignStatus::Sending => "sending",
            CampaignStatus::Paused => "paused",
            CampaignStatus::Completed => "completed",
            CampaignStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse_state(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(CampaignStatus::Draft),
            "scheduled" => Some(CampaignStatus::Scheduled),
            "sending" => Some(CampaignStatus::Sending),
            "paused" => Some(CampaignStatus::Paused),
            "completed" => Some(CampaignStatus::Completed),
            "cancelled" => Some(CampaignStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CampaignStatus::Completed | CampaignStatus::Cancelled)
    }
}

impl fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Sending,
    Success,
    Error,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Sending => "sending",
            DeliveryStatus::Success => "success",
            DeliveryStatus::Error => "error",
        }
    }

    pub fn parse_state(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DeliveryStatus::Pending),
            "sending" => Some(DeliveryStatus::Sending),
            "success" => Some(DeliveryStatus::Success),
            "error" => Some(DeliveryStatus::Error),
            _ => None,
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Text,
    Image,
    Buttons,
}

impl ContentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Text => "text",
            ContentKind::Image => "image",
            ContentKind::Buttons => "buttons",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Button {
    pub label: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub callback: Option<String>,
}

/// Campaign payload. Candidate texts are the original body (or caption)
/// followed by `variations`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Content {
    Text {
        body: String,
        #[serde(default)]
        variations: Vec<String>,
    },
    Image {
        image: String,
        #[serde(default)]
        caption: Option<String>,
        #[serde(default)]
        variations: Vec<String>,
    },
    Buttons {
        body: String,
        buttons: Vec<Button>,
        #[serde(default)]
        variations: Vec<String>,
    },
}

impl Content {
    pub fn kind(&self) -> ContentKind {
        match self {
            Content::Text { .. } => ContentKind::Text,
            Content::Image { .. } => ContentKind::Image,
            Content::Buttons { .. } => ContentKind::Buttons,
        }
    }

    pub fn base_text(&self) -> &str {
        match self {
            Content::Text { body, .. } | Content::Buttons { body, .. } => body,
            Content::Image { caption, .. } => caption.as_deref().unwrap_or(""),
        }
    }

    pub fn variations(&self) -> &[String] {
        match self {
            Content::Text { variations, .. }
            | Content::Image { variations, .. }
            | Content::Buttons { variations, .. } => variations,
        }
    }

    pub fn set_variations(&mut self, generated: Vec<String>) {
        match self {
            Content::Text { variations, .. }
            | Content::Image { variations, .. }
            | Content::Buttons { variations, .. } => *variations = generated,
        }
    }

    pub fn candidates(&self) -> Vec<&str> {
        let mut out = Vec::with_capacity(1 + self.variations().len());
        out.push(self.base_text());
        out.extend(self.variations().iter().map(String::as_str));
        out
    }

    pub fn render(&self, text: &str, recipient: &Recipient) -> RenderedContent {
        let text = fill_placeholders(text, recipient);
        match self {
            Content::Text { .. } => RenderedContent::Text { text },
            Content::Image { image, caption, .. } => RenderedContent::Image {
                image: image.clone(),
                caption: if caption.is_none() && text.is_empty() {
                    None
                } else {
                    Some(text)
                },
            },
            Content::Buttons { buttons, .. } => RenderedContent::Buttons {
                text,
                buttons: buttons.clone(),
            },
        }
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        match self {
            Content::Text { body, .. } if body.trim().is_empty() => {
                Err("text content requires a non-empty body")
            }
            Content::Image { image, .. } if image.trim().is_empty() => {
                Err("image content requires an image reference")
            }
            Content::Buttons { body, .. } if body.trim().is_empty() => {
                Err("buttons content requires a non-empty body")
            }
            Content::Buttons { buttons, .. } if buttons.is_empty() => {
                Err("buttons content requires at least one button")
            }
            Content::Buttons { buttons, .. } if buttons.iter().any(|b| b.label.trim().is_empty()) => {
                Err("every button needs a label")
            }
            _ => Ok(()),
        }
    }
}

fn fill_placeholders(text: &str, recipient: &Recipient) -> String {
    text.replace("{name}", &recipient.name)
        .replace("{number}", &recipient.number)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderedContent {
    Text { text: String },
    Image { image: String, caption: Option<String> },
    Buttons { text: String, buttons: Vec<Button> },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CampaignConfiguration {
    pub delay_between_sends: u64,
    pub delay_jitter: u64,
    pub batch_size: usize,
    pub batch_delay: u64,
    pub max_retries: u32,
    pub business_hours_only: bool,
}

impl Default for CampaignConfiguration {
    fn default() -> Self {
        Self {
            delay_between_sends: 5,
            delay_jitter: 10,
            batch_size: 20,
            batch_delay: 60,
            max_retries: 3,
            business_hours_only: false,
        }
    }
}

impl CampaignConfiguration {
    pub fn jitter_bounds(&self) -> (Duration, Duration) {
        let min = Duration::from_secs(self.delay_between_sends);
        let max = Duration::from_secs(self.delay_between_sends.saturating_add(self.delay_jitter));
        (min, max)
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_secs(self.batch_delay)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Statistics {
    pub total: i64,
    pub pending: i64,
    pub sent: i64,
    pub success: i64,
    pub error: i64,
    pub success_rate: f64,
}

impl Statistics {
    pub fn from_counts(total: i64, success: i64, error: i64) -> Self {
        let sent = success + error;
        let pending = (total - sent).max(0);
        let success_rate = if sent == 0 {
            0.0
        } else {
            success as f64 / sent as f64 * 100.0
        };
        Self {
            total,
            pending,
            sent,
            success,
            error,
            success_rate,
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.total == self.pending + self.success + self.error
            && self.sent == self.success + self.error
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Timestamps {
    pub created_at: DateTime<Utc>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub concluded_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: String,
    pub name: String,
    pub content: Content,
    pub status: CampaignStatus,
    pub configuration: CampaignConfiguration,
    pub statistics: Statistics,
    pub timestamps: Timestamps,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Recipient {
    pub contact_id: String,
    pub name: String,
    pub number: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCampaign {
    pub name: String,
    pub content: Content,
    #[serde(default)]
    pub configuration: Option<CampaignConfiguration>,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    pub recipients: Vec<Recipient>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VariationKind {
    Original,
    Paraphrase,
}

impl VariationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            VariationKind::Original => "original",
            VariationKind::Paraphrase => "paraphrase",
        }
    }

    pub fn parse_kind(s: &str) -> Option<Self> {
        match s {
            "original" => Some(VariationKind::Original),
            "paraphrase" => Some(VariationKind::Paraphrase),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VariationUsed {
    pub index: usize,
    pub content: String,
    pub kind: VariationKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeliveryLogEntry {
    pub campaign_id: String,
    pub position: i64,
    pub contact_id: String,
    pub name: String,
    pub number: String,
    pub status: DeliveryStatus,
    pub attempts: i32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub response_time_ms: Option<i64>,
    pub response_code: Option<i32>,
    pub error_message: Option<String>,
    pub variation_used: Option<VariationUsed>,
}

impl DeliveryLogEntry {
    pub fn recipient(&self) -> Recipient {
        Recipient {
            contact_id: self.contact_id.clone(),
            name: self.name.clone(),
            number: self.number.clone(),
        }
    }

    pub fn is_retryable(&self, max_retries: u32) -> bool {
        match self.status {
            DeliveryStatus::Pending => true,
            DeliveryStatus::Error => self.attempts < max_retries as i32,
            _ => false,
        }
    }
}

/// Persisted pause/cancel request for one campaign. A missing row reads as
/// the default (no flags set).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignalFlag {
    pub should_pause: bool,
    pub should_cancel: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignSnapshot {
    pub id: String,
    pub name: String,
    pub status: CampaignStatus,
    pub statistics: Statistics,
    pub timestamps: Timestamps,
    pub running_locally: bool,
}

impl CampaignSnapshot {
    pub fn of(campaign: &Campaign, running_locally: bool) -> Self {
        Self {
            id: campaign.id.clone(),
            name: campaign.name.clone(),
            status: campaign.status,
            statistics: campaign.statistics.clone(),
            timestamps: campaign.timestamps.clone(),
            running_locally,
        }
    }
}

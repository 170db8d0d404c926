//! Paraphrase generation for campaign bodies.
//!
//! The remote service is a black box: it either returns alternate phrasings
//! or fails. [`VariationService`] bounds every call with a timeout, retries a
//! fixed number of times and then falls back to [`rule_based_variations`].

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::Variations;

#[async_trait]
pub trait VariationGenerator: Send + Sync {
    async fn generate(&self, base_text: &str, count: usize) -> Result<Vec<String>>;
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    text: &'a str,
    count: usize,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    variations: Vec<String>,
}

#[derive(Clone)]
pub struct HttpVariationClient {
    http: Client,
    endpoint: Url,
    api_key: Option<String>,
}

impl fmt::Debug for HttpVariationClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpVariationClient")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl HttpVariationClient {
    pub fn new(endpoint: &str, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let endpoint = Url::parse(endpoint).context("invalid variations endpoint")?;
        let http = Client::builder()
            .user_agent("tg-campaign/0.1")
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            endpoint,
            api_key,
        })
    }

    pub fn build_request(&self, base_text: &str, count: usize) -> Result<reqwest::Request> {
        let mut req = self
            .http
            .post(self.endpoint.clone())
            .json(&GenerateRequest {
                text: base_text,
                count,
            });
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        req.build().context("failed to build variations request")
    }
}

#[async_trait]
impl VariationGenerator for HttpVariationClient {
    async fn generate(&self, base_text: &str, count: usize) -> Result<Vec<String>> {
        let request = self.build_request(base_text, count)?;
        let res = self
            .http
            .execute(request)
            .await
            .context("failed to reach variations service")?;

        if res.status() == StatusCode::TOO_MANY_REQUESTS {
            return Err(anyhow!("variations service rate limited the request"));
        }
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("variations service error {}: {}", status, body));
        }

        let payload: GenerateResponse = res
            .json()
            .await
            .context("invalid variations response JSON")?;
        Ok(payload.variations)
    }
}

/// Remote generation with timeout, bounded retries and a local fallback.
pub struct VariationService {
    remote: Option<Box<dyn VariationGenerator>>,
    timeout: Duration,
    max_retries: u32,
}

impl VariationService {
    pub fn new(
        remote: Option<Box<dyn VariationGenerator>>,
        timeout: Duration,
        max_retries: u32,
    ) -> Self {
        Self {
            remote,
            timeout,
            max_retries,
        }
    }

    pub fn from_config(cfg: &Variations) -> Result<Self> {
        let timeout = Duration::from_secs(cfg.timeout_seconds);
        let remote = match &cfg.endpoint {
            Some(endpoint) => Some(Box::new(HttpVariationClient::new(
                endpoint,
                cfg.api_key.clone(),
                timeout,
            )?) as Box<dyn VariationGenerator>),
            None => None,
        };
        Ok(Self::new(remote, timeout, cfg.max_retries))
    }

    /// Up to `count` distinct paraphrases of `base_text`, never including the
    /// original itself. Always succeeds.
    pub async fn variations_for(&self, base_text: &str, count: usize) -> Vec<String> {
        if count == 0 || base_text.trim().is_empty() {
            return Vec::new();
        }
        if let Some(remote) = &self.remote {
            for attempt in 0..=self.max_retries {
                match tokio::time::timeout(self.timeout, remote.generate(base_text, count)).await {
                    Ok(Ok(generated)) => {
                        let cleaned = dedupe(base_text, generated, count);
                        if !cleaned.is_empty() {
                            info!(count = cleaned.len(), attempt, "received remote variations");
                            return cleaned;
                        }
                        warn!(attempt, "variations service returned nothing usable");
                    }
                    Ok(Err(err)) => warn!(?err, attempt, "variations service failed"),
                    Err(_) => warn!(attempt, timeout = ?self.timeout, "variations service timed out"),
                }
            }
            warn!("falling back to rule-based variations");
        }
        rule_based_variations(base_text, count)
    }
}

fn dedupe(base_text: &str, generated: Vec<String>, count: usize) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(count);
    for text in generated {
        let trimmed = text.trim();
        if trimmed.is_empty() || trimmed == base_text.trim() {
            continue;
        }
        if out.iter().any(|t| t == trimmed) {
            continue;
        }
        out.push(trimmed.to_string());
        if out.len() == count {
            break;
        }
    }
    out
}

/// Word-level substitutions used when the remote service is unavailable.
static SUBSTITUTIONS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (r"(?i)\bhello\b", "Hi"),
        (r"(?i)\bhi\b", "Hey"),
        (r"(?i)\bhey\b", "Hello"),
        (r"(?i)\bthanks\b", "Thank you"),
        (r"(?i)\bthank you\b", "Many thanks"),
        (r"(?i)\bbuy\b", "get"),
        (r"(?i)\bnow\b", "today"),
        (r"(?i)\btoday\b", "right now"),
        (r"(?i)\bcheck out\b", "take a look at"),
        (r"(?i)\bgreat\b", "excellent"),
        (r"(?i)\bnew\b", "brand-new"),
        (r"(?i)\bdon't miss\b", "don't let go of"),
        (r"(?i)\bcontact us\b", "get in touch"),
        (r"(?i)\bfree\b", "at no cost"),
    ]
    .into_iter()
    .filter_map(|(pattern, replacement)| Regex::new(pattern).ok().map(|re| (re, replacement)))
    .collect()
});

const OPENERS: [&str; 3] = ["", "Quick note: ", "Just so you know: "];
const CLOSERS: [&str; 3] = ["", " 🙂", " Have a great day!"];

/// Deterministic local paraphrases: word substitutions combined with
/// optional openers and closers. Returns at most `count` texts, all distinct
/// from each other and from the original.
pub fn rule_based_variations(base_text: &str, count: usize) -> Vec<String> {
    let base = base_text.trim();
    let mut out: Vec<String> = Vec::new();
    if base.is_empty() || count == 0 {
        return out;
    }

    let substituted = apply_substitutions(base);
    let bodies: Vec<&str> = if substituted != base {
        vec![substituted.as_str(), base]
    } else {
        vec![base]
    };

    'outer: for body in bodies {
        for opener in OPENERS {
            for closer in CLOSERS {
                let candidate = format!("{}{}{}", opener, body, closer);
                if candidate != base && !out.contains(&candidate) {
                    out.push(candidate);
                    if out.len() == count {
                        break 'outer;
                    }
                }
            }
        }
    }
    out
}

fn apply_substitutions(text: &str) -> String {
    // One pass per rule, first match only, so chained rules (hello -> hi ->
    // hey) cannot cascade through the whole sentence.
    let mut out = text.to_string();
    let mut touched: Vec<(usize, usize)> = Vec::new();
    for (re, replacement) in SUBSTITUTIONS.iter() {
        let Some(m) = re.find(&out) else { continue };
        if touched.iter().any(|(s, e)| m.start() < *e && *s < m.end()) {
            continue;
        }
        let replaced = match_case(m.as_str(), replacement);
        let delta = replaced.len() as isize - (m.end() - m.start()) as isize;
        let (start, end) = (m.start(), m.end());
        out.replace_range(start..end, &replaced);
        touched = touched
            .into_iter()
            .map(|(s, e)| {
                if s >= end {
                    ((s as isize + delta) as usize, (e as isize + delta) as usize)
                } else {
                    (s, e)
                }
            })
            .collect();
        touched.push((start, (end as isize + delta) as usize));
    }
    out
}

fn match_case(original: &str, replacement: &str) -> String {
    let starts_upper = original.chars().next().is_some_and(char::is_uppercase);
    let mut chars = replacement.chars();
    match chars.next() {
        Some(first) if starts_upper => first.to_uppercase().chain(chars).collect(),
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

//! Core domain model for the DealHub deal discovery pipeline.

use std::fmt;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dealhub-core";

/// Marketplace condition buckets shared by every source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Condition {
    Deadstock,
    NearDeadstock,
    Excellent,
    Good,
    Used,
    #[default]
    Unknown,
}

impl Condition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Condition::Deadstock => "deadstock",
            Condition::NearDeadstock => "near-deadstock",
            Condition::Excellent => "excellent",
            Condition::Good => "good",
            Condition::Used => "used",
            Condition::Unknown => "unknown",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "deadstock" => Condition::Deadstock,
            "near-deadstock" | "near_deadstock" | "vnds" => Condition::NearDeadstock,
            "excellent" => Condition::Excellent,
            "good" => Condition::Good,
            "used" => Condition::Used,
            _ => Condition::Unknown,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Condition::Unknown)
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable listing identity: the same `(source, dedup key)` always maps to the same id.
pub fn listing_id_for(source: &str, dedup_key: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, format!("{source}:{dedup_key}").as_bytes())
}

/// Parsed handoff contract from adapters into the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingDraft {
    pub source: String,
    pub url: String,
    pub external_id: Option<String>,
    pub title: String,
    pub brand: Option<String>,
    pub model: Option<String>,
    pub size: Option<String>,
    pub colorway: Option<String>,
    pub price: f64,
    pub original_price: Option<f64>,
    pub condition: Condition,
    pub images: Vec<String>,
    pub seller: Option<String>,
    pub posted_at: Option<DateTime<Utc>>,
}

impl ListingDraft {
    /// Sources with a stable identifier dedup on it; everything else on the canonical url.
    pub fn dedup_key(&self) -> &str {
        self.external_id.as_deref().unwrap_or(&self.url)
    }

    pub fn listing_id(&self) -> Uuid {
        listing_id_for(&self.source, self.dedup_key())
    }
}

/// Canonical persisted marketplace offer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: Uuid,
    pub source: String,
    pub url: String,
    pub external_id: Option<String>,
    pub title: String,
    pub brand: Option<String>,
    pub model: Option<String>,
    pub size: Option<String>,
    pub colorway: Option<String>,
    pub price: f64,
    pub original_price: Option<f64>,
    pub condition: Condition,
    pub images: Vec<String>,
    pub seller: Option<String>,
    pub created_at: DateTime<Utc>,
    pub observed_at: DateTime<Utc>,
    pub score: Option<f64>,
}

impl Listing {
    pub fn from_draft(draft: ListingDraft, observed_at: DateTime<Utc>) -> Self {
        let id = draft.listing_id();
        Self {
            id,
            created_at: draft.posted_at.unwrap_or(observed_at).min(observed_at),
            observed_at,
            source: draft.source,
            url: draft.url,
            external_id: draft.external_id,
            title: draft.title,
            brand: draft.brand,
            model: draft.model,
            size: draft.size,
            colorway: draft.colorway,
            price: draft.price,
            original_price: draft.original_price,
            condition: draft.condition,
            images: draft.images,
            seller: draft.seller,
            score: None,
        }
    }

    pub fn dedup_key(&self) -> &str {
        self.external_id.as_deref().unwrap_or(&self.url)
    }

    /// Lowercased `title brand model` with whitespace collapsed; the text targets match against.
    pub fn combined_text(&self) -> String {
        let raw = format!(
            "{} {} {}",
            self.title,
            self.brand.as_deref().unwrap_or_default(),
            self.model.as_deref().unwrap_or_default()
        );
        normalize_text(&raw)
    }

    pub fn age_hours(&self, as_of: DateTime<Utc>) -> f64 {
        let age = as_of.signed_duration_since(self.created_at);
        (age.num_seconds().max(0) as f64) / 3600.0
    }
}

/// Lowercase, replace punctuation with spaces, collapse whitespace.
pub fn normalize_text(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '.' { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Immutable price observation, written only when a listing's price changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceSnapshot {
    pub id: Uuid,
    pub listing_id: Uuid,
    pub price: f64,
    pub previous_price: Option<f64>,
    pub captured_at: DateTime<Utc>,
}

impl PriceSnapshot {
    pub fn new(listing_id: Uuid, price: f64, previous_price: Option<f64>, captured_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            listing_id,
            price,
            previous_price,
            captured_at,
        }
    }
}

/// A user's standing price/brand interest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchTarget {
    pub id: Uuid,
    pub owner_id: String,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub model_keywords: Option<String>,
    pub target_price: f64,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub channel: Option<String>,
}

fn default_active() -> bool {
    true
}

impl WatchTarget {
    pub fn new(owner_id: impl Into<String>, brand: Option<&str>, model_keywords: Option<&str>, target_price: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.into(),
            brand: brand.map(ToString::to_string),
            model_keywords: model_keywords.map(ToString::to_string),
            target_price,
            active: true,
            channel: None,
        }
    }
}

/// Record of a delivered notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub listing_id: Uuid,
    pub target_id: Option<Uuid>,
    pub owner_id: Option<String>,
    pub channel: String,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewAlert {
    pub listing_id: Uuid,
    pub target_id: Option<Uuid>,
    pub owner_id: Option<String>,
    pub channel: String,
    pub sent_at: DateTime<Utc>,
}

impl NewAlert {
    pub fn into_alert(self) -> Alert {
        Alert {
            id: Uuid::new_v4(),
            listing_id: self.listing_id,
            target_id: self.target_id,
            owner_id: self.owner_id,
            channel: self.channel,
            sent_at: self.sent_at,
        }
    }
}

/// Deal quality on the canonical 0-10 scale, one decimal.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DealScore(f64);

impl DealScore {
    pub const MIN: f64 = 0.0;
    pub const MAX: f64 = 10.0;

    pub fn new(raw: f64) -> Self {
        let clamped = if raw.is_nan() { Self::MIN } else { raw.clamp(Self::MIN, Self::MAX) };
        Self(round_to_tenth(clamped))
    }

    pub fn value(&self) -> f64 {
        self.0
    }

    /// Conversion for callers that speak the 0-100 convention.
    pub fn as_percent(&self) -> f64 {
        round_to_tenth(self.0 * 10.0)
    }

    pub fn from_percent(percent: f64) -> Self {
        Self::new(percent / 10.0)
    }
}

impl fmt::Display for DealScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1}/10", self.0)
    }
}

pub fn round_to_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Time source injected everywhere the pipeline reads "now".
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Hand-driven clock for simulating elapsed time.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = to;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

//! Outbound notification channels.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::matcher::MatchResult;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendOptions {
    pub parse_mode: Option<String>,
    pub disable_link_preview: bool,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            parse_mode: Some("Markdown".to_string()),
            disable_link_preview: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("delivery request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("channel {channel} rejected the message: {reason}")]
    Rejected { channel: String, reason: String },
}

#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    fn name(&self) -> &str;

    async fn send_message(&self, channel_id: &str, text: &str, options: &SendOptions) -> Result<(), DeliveryError>;
}

/// Telegram Bot API `sendMessage`.
#[derive(Debug, Clone)]
pub struct TelegramChannel {
    client: reqwest::Client,
    token: String,
    api_base: String,
}

#[derive(Debug, Deserialize)]
struct TelegramResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

impl TelegramChannel {
    pub fn new(token: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            client,
            token: token.into(),
            api_base: "https://api.telegram.org".to_string(),
        })
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/bot{}/sendMessage", self.api_base.trim_end_matches('/'), self.token)
    }
}

#[async_trait]
impl DeliveryChannel for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn send_message(&self, channel_id: &str, text: &str, options: &SendOptions) -> Result<(), DeliveryError> {
        let mut body = serde_json::json!({
            "chat_id": channel_id,
            "text": text,
            "disable_web_page_preview": options.disable_link_preview,
        });
        if let Some(mode) = &options.parse_mode {
            body["parse_mode"] = serde_json::Value::String(mode.clone());
        }
        let resp = self.client.post(self.endpoint()).json(&body).send().await?;
        let status = resp.status();
        let parsed: TelegramResponse = resp.json().await?;
        if !status.is_success() || !parsed.ok {
            return Err(DeliveryError::Rejected {
                channel: channel_id.to_string(),
                reason: parsed
                    .description
                    .unwrap_or_else(|| format!("http status {status}")),
            });
        }
        Ok(())
    }
}

/// Writes alerts to the log instead of sending them.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogChannel;

#[async_trait]
impl DeliveryChannel for LogChannel {
    fn name(&self) -> &str {
        "log"
    }

    async fn send_message(&self, channel_id: &str, text: &str, _options: &SendOptions) -> Result<(), DeliveryError> {
        info!(channel = channel_id, message = text, "deal alert (log channel)");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub channel_id: String,
    pub text: String,
}

/// Keeps every message in memory; can be told to fail.
#[derive(Debug, Default)]
pub struct RecordingChannel {
    sent: Mutex<Vec<SentMessage>>,
    failing: Mutex<bool>,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap_or_else(PoisonError::into_inner) = failing;
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl DeliveryChannel for RecordingChannel {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send_message(&self, channel_id: &str, text: &str, _options: &SendOptions) -> Result<(), DeliveryError> {
        if *self.failing.lock().unwrap_or_else(PoisonError::into_inner) {
            return Err(DeliveryError::Rejected {
                channel: channel_id.to_string(),
                reason: "channel configured to fail".to_string(),
            });
        }
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(SentMessage {
                channel_id: channel_id.to_string(),
                text: text.to_string(),
            });
        Ok(())
    }
}

fn format_money(value: f64) -> String {
    let whole = value.round() as i64;
    let digits = whole.abs().to_string();
    let mut out = String::new();
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    if whole < 0 {
        format!("-${out}")
    } else {
        format!("${out}")
    }
}

/// Escapes the characters legacy Telegram Markdown treats as entity delimiters.
pub fn escape_markdown(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        if matches!(ch, '_' | '*' | '`' | '[') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

pub fn format_alert_message(m: &MatchResult) -> String {
    let listing = &m.listing;
    let heading = if m.savings_percent >= 30.0 {
        "HOT DEAL"
    } else {
        "DEAL ALERT"
    };
    let mut msg = format!("*{heading}*\n\n*{}*\n\n", escape_markdown(&listing.title));
    msg.push_str(&format!("Price: *{}*\n", format_money(listing.price)));
    msg.push_str(&format!("Your target: {}\n", format_money(m.target.target_price)));
    msg.push_str(&format!(
        "Savings: *{} ({:.1}% off)*\n",
        format_money(m.savings),
        m.savings_percent
    ));
    if let Some(score) = listing.score {
        msg.push_str(&format!("Deal score: {score:.1}/10\n"));
    }
    msg.push_str(&format!(
        "Source: {}\n\n{}",
        escape_markdown(&listing.source),
        escape_markdown(&listing.url)
    ));
    msg
}

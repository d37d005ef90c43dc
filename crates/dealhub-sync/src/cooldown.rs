//! Alert cooldown: which owner key a match is deduplicated under and how long.

use chrono::{DateTime, Duration, Utc};
use dealhub_core::{Alert, NewAlert};
use dealhub_storage::{AlertStore, StoreError};
use serde::Serialize;

use crate::matcher::MatchResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CooldownScope {
    /// One alert per listing per window, whoever asked.
    #[default]
    Global,
    /// One alert per listing per owner per window.
    PerOwner,
}

impl CooldownScope {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "owner" | "per-owner" | "per_owner" | "user" => CooldownScope::PerOwner,
            _ => CooldownScope::Global,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooldownPolicy {
    pub window: Duration,
    pub scope: CooldownScope,
}

impl Default for CooldownPolicy {
    fn default() -> Self {
        Self {
            window: Duration::minutes(60),
            scope: CooldownScope::Global,
        }
    }
}

impl CooldownPolicy {
    pub fn new(window_minutes: i64, scope: CooldownScope) -> Self {
        Self {
            window: Duration::minutes(window_minutes.max(0)),
            scope,
        }
    }

    /// `None` keys the global ledger.
    pub fn owner_key<'a>(&self, m: &'a MatchResult) -> Option<&'a str> {
        match self.scope {
            CooldownScope::Global => None,
            CooldownScope::PerOwner => Some(m.target.owner_id.as_str()),
        }
    }

    pub fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.window
    }

    pub fn new_alert(&self, m: &MatchResult, channel: &str, now: DateTime<Utc>) -> NewAlert {
        NewAlert {
            listing_id: m.listing.id,
            target_id: Some(m.target.id),
            owner_id: self.owner_key(m).map(ToString::to_string),
            channel: channel.to_string(),
            sent_at: now,
        }
    }

    pub async fn is_cooling_down(
        &self,
        store: &dyn AlertStore,
        m: &MatchResult,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        store
            .has_recent_alert(m.listing.id, self.owner_key(m), self.window_start(now))
            .await
    }

    /// Compare-and-set reservation; `None` means another alert already holds the window.
    pub async fn reserve(
        &self,
        store: &dyn AlertStore,
        m: &MatchResult,
        channel: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Alert>, StoreError> {
        store
            .try_reserve(self.new_alert(m, channel, now), self.window_start(now))
            .await
    }
}

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dealhub_core::{Alert, DealScore, Listing, ListingDraft, NewAlert, PriceSnapshot, WatchTarget};
use thiserror::Error;
use uuid::Uuid;

/// Prices closer than this are treated as unchanged.
pub const PRICE_EPSILON: f64 = 0.005;

pub fn price_changed(previous: f64, current: f64) -> bool {
    (previous - current).abs() > PRICE_EPSILON
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("record not found: {0}")]
    NotFound(Uuid),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("write rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UpsertOutcome {
    Inserted { id: Uuid },
    Updated { id: Uuid, previous_price: f64, snapshot_id: Uuid },
    Unchanged { id: Uuid },
}

impl UpsertOutcome {
    pub fn id(&self) -> Uuid {
        match self {
            UpsertOutcome::Inserted { id }
            | UpsertOutcome::Updated { id, .. }
            | UpsertOutcome::Unchanged { id } => *id,
        }
    }

    /// Inserted and updated listings need (re)scoring.
    pub fn is_write(&self) -> bool {
        !matches!(self, UpsertOutcome::Unchanged { .. })
    }
}

#[async_trait]
pub trait ListingStore: Send + Sync {
    /// Insert, price-update (plus one snapshot) or no-op, keyed on `(source, dedup key)`.
    async fn upsert(&self, draft: ListingDraft, observed_at: DateTime<Utc>) -> Result<UpsertOutcome, StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<Listing>, StoreError>;

    async fn set_score(&self, id: Uuid, score: DealScore) -> Result<(), StoreError>;

    /// Listings observed at or after `since`, newest first.
    async fn recent(&self, since: DateTime<Utc>) -> Result<Vec<Listing>, StoreError>;

    /// Keyset page ordered by id.
    async fn page(&self, after_id: Option<Uuid>, limit: usize) -> Result<Vec<Listing>, StoreError>;

    async fn latest_snapshot_prices(&self, ids: &[Uuid]) -> Result<HashMap<Uuid, f64>, StoreError>;

    async fn insert_snapshots(&self, snapshots: &[PriceSnapshot]) -> Result<usize, StoreError>;

    async fn snapshots_for(&self, listing_id: Uuid) -> Result<Vec<PriceSnapshot>, StoreError>;

    async fn count(&self) -> Result<usize, StoreError>;
}

#[async_trait]
pub trait TargetStore: Send + Sync {
    async fn active_targets(&self) -> Result<Vec<WatchTarget>, StoreError>;

    async fn save_target(&self, target: WatchTarget) -> Result<(), StoreError>;
}

/// Alert history doubling as the cooldown ledger. `owner_id: None` means a global check.
#[async_trait]
pub trait AlertStore: Send + Sync {
    async fn has_recent_alert(
        &self,
        listing_id: Uuid,
        owner_id: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn record_alert(&self, alert: NewAlert) -> Result<Alert, StoreError>;

    /// Atomically checks the window starting at `window_start` and inserts; `None` when already alerted.
    async fn try_reserve(&self, alert: NewAlert, window_start: DateTime<Utc>) -> Result<Option<Alert>, StoreError>;

    async fn release(&self, alert_id: Uuid) -> Result<(), StoreError>;

    /// Newest first.
    async fn recent_alerts(&self, limit: usize) -> Result<Vec<Alert>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_changes_ignore_sub_cent_noise() {
        assert!(!price_changed(100.0, 100.001));
        assert!(price_changed(100.0, 99.0));
    }

    #[test]
    fn only_unchanged_outcomes_skip_rescoring() {
        let id = Uuid::new_v4();
        assert!(UpsertOutcome::Inserted { id }.is_write());
        assert!(!UpsertOutcome::Unchanged { id }.is_write());
        assert_eq!(UpsertOutcome::Unchanged { id }.id(), id);
    }
}

//! Mutex-guarded in-process store; the default backend when no database is configured.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dealhub_core::{Alert, DealScore, Listing, ListingDraft, NewAlert, PriceSnapshot, WatchTarget};
use uuid::Uuid;

use crate::store::{price_changed, AlertStore, ListingStore, StoreError, TargetStore, UpsertOutcome};

#[derive(Debug, Default)]
struct MemoryState {
    listings: BTreeMap<Uuid, Listing>,
    snapshots: Vec<PriceSnapshot>,
    targets: Vec<WatchTarget>,
    alerts: Vec<Alert>,
    #[cfg(any(test, feature = "test-util"))]
    failing_urls: HashSet<String>,
}

impl MemoryState {
    #[cfg(any(test, feature = "test-util"))]
    fn rejects(&self, url: &str) -> bool {
        self.failing_urls.contains(url)
    }

    #[cfg(not(any(test, feature = "test-util")))]
    fn rejects(&self, _url: &str) -> bool {
        false
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_targets(targets: Vec<WatchTarget>) -> Self {
        let store = Self::new();
        store.state().targets = targets;
        store
    }

    /// Makes every upsert of `url` fail, for exercising per-listing persistence errors.
    #[cfg(any(test, feature = "test-util"))]
    pub fn fail_upserts_for(&self, url: impl Into<String>) {
        self.state().failing_urls.insert(url.into());
    }

    pub fn alert_count(&self) -> usize {
        self.state().alerts.len()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn alert_in_window(alert: &Alert, listing_id: Uuid, owner_id: Option<&str>, since: DateTime<Utc>) -> bool {
    alert.listing_id == listing_id
        && alert.sent_at >= since
        && owner_id.map_or(true, |owner| alert.owner_id.as_deref() == Some(owner))
}

#[async_trait]
impl ListingStore for MemoryStore {
    async fn upsert(&self, draft: ListingDraft, observed_at: DateTime<Utc>) -> Result<UpsertOutcome, StoreError> {
        let mut state = self.state();
        if state.rejects(&draft.url) {
            return Err(StoreError::Rejected(draft.url));
        }

        let id = draft.listing_id();
        let Some(existing) = state.listings.get_mut(&id) else {
            state.listings.insert(id, Listing::from_draft(draft, observed_at));
            return Ok(UpsertOutcome::Inserted { id });
        };

        if !price_changed(existing.price, draft.price) {
            return Ok(UpsertOutcome::Unchanged { id });
        }

        let previous_price = existing.price;
        existing.price = draft.price;
        existing.observed_at = observed_at;
        let snapshot = PriceSnapshot::new(id, draft.price, Some(previous_price), observed_at);
        let snapshot_id = snapshot.id;
        state.snapshots.push(snapshot);
        Ok(UpsertOutcome::Updated {
            id,
            previous_price,
            snapshot_id,
        })
    }

    async fn get(&self, id: Uuid) -> Result<Option<Listing>, StoreError> {
        Ok(self.state().listings.get(&id).cloned())
    }

    async fn set_score(&self, id: Uuid, score: DealScore) -> Result<(), StoreError> {
        let mut state = self.state();
        let listing = state.listings.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        listing.score = Some(score.value());
        Ok(())
    }

    async fn recent(&self, since: DateTime<Utc>) -> Result<Vec<Listing>, StoreError> {
        let mut listings = self
            .state()
            .listings
            .values()
            .filter(|l| l.observed_at >= since)
            .cloned()
            .collect::<Vec<_>>();
        listings.sort_by(|a, b| b.observed_at.cmp(&a.observed_at).then(a.id.cmp(&b.id)));
        Ok(listings)
    }

    async fn page(&self, after_id: Option<Uuid>, limit: usize) -> Result<Vec<Listing>, StoreError> {
        let state = self.state();
        let page = match after_id {
            Some(after) => state
                .listings
                .range((std::ops::Bound::Excluded(after), std::ops::Bound::Unbounded))
                .take(limit)
                .map(|(_, l)| l.clone())
                .collect(),
            None => state.listings.values().take(limit).cloned().collect(),
        };
        Ok(page)
    }

    async fn latest_snapshot_prices(&self, ids: &[Uuid]) -> Result<HashMap<Uuid, f64>, StoreError> {
        let wanted = ids.iter().copied().collect::<HashSet<_>>();
        let mut latest: HashMap<Uuid, (DateTime<Utc>, f64)> = HashMap::new();
        for snap in self.state().snapshots.iter().filter(|s| wanted.contains(&s.listing_id)) {
            let entry = latest.entry(snap.listing_id).or_insert((snap.captured_at, snap.price));
            if snap.captured_at >= entry.0 {
                *entry = (snap.captured_at, snap.price);
            }
        }
        Ok(latest.into_iter().map(|(id, (_, price))| (id, price)).collect())
    }

    async fn insert_snapshots(&self, snapshots: &[PriceSnapshot]) -> Result<usize, StoreError> {
        self.state().snapshots.extend(snapshots.iter().cloned());
        Ok(snapshots.len())
    }

    async fn snapshots_for(&self, listing_id: Uuid) -> Result<Vec<PriceSnapshot>, StoreError> {
        let mut snaps = self
            .state()
            .snapshots
            .iter()
            .filter(|s| s.listing_id == listing_id)
            .cloned()
            .collect::<Vec<_>>();
        snaps.sort_by_key(|s| s.captured_at);
        Ok(snaps)
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.state().listings.len())
    }
}

#[async_trait]
impl TargetStore for MemoryStore {
    async fn active_targets(&self) -> Result<Vec<WatchTarget>, StoreError> {
        Ok(self.state().targets.iter().filter(|t| t.active).cloned().collect())
    }

    async fn save_target(&self, target: WatchTarget) -> Result<(), StoreError> {
        let mut state = self.state();
        match state.targets.iter_mut().find(|t| t.id == target.id) {
            Some(existing) => *existing = target,
            None => state.targets.push(target),
        }
        Ok(())
    }
}

#[async_trait]
impl AlertStore for MemoryStore {
    async fn has_recent_alert(
        &self,
        listing_id: Uuid,
        owner_id: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        Ok(self
            .state()
            .alerts
            .iter()
            .any(|a| alert_in_window(a, listing_id, owner_id, since)))
    }

    async fn record_alert(&self, alert: NewAlert) -> Result<Alert, StoreError> {
        let alert = alert.into_alert();
        self.state().alerts.push(alert.clone());
        Ok(alert)
    }

    async fn try_reserve(&self, alert: NewAlert, window_start: DateTime<Utc>) -> Result<Option<Alert>, StoreError> {
        let mut state = self.state();
        let owner = alert.owner_id.clone();
        if state
            .alerts
            .iter()
            .any(|a| alert_in_window(a, alert.listing_id, owner.as_deref(), window_start))
        {
            return Ok(None);
        }
        let alert = alert.into_alert();
        state.alerts.push(alert.clone());
        Ok(Some(alert))
    }

    async fn release(&self, alert_id: Uuid) -> Result<(), StoreError> {
        self.state().alerts.retain(|a| a.id != alert_id);
        Ok(())
    }

    async fn recent_alerts(&self, limit: usize) -> Result<Vec<Alert>, StoreError> {
        let mut alerts = self.state().alerts.clone();
        alerts.sort_by(|a, b| b.sent_at.cmp(&a.sent_at));
        alerts.truncate(limit);
        Ok(alerts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use dealhub_core::Condition;
    use std::sync::Arc;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn draft(url: &str, price: f64) -> ListingDraft {
        ListingDraft {
            source: "reddit-watchexchange".into(),
            url: url.into(),
            external_id: None,
            title: "[WTS] Tudor Black Bay 58".into(),
            brand: Some("Tudor".into()),
            model: Some("Black Bay 58".into()),
            size: None,
            colorway: None,
            price,
            original_price: None,
            condition: Condition::Excellent,
            images: vec![],
            seller: Some("u/seller".into()),
            posted_at: Some(t0()),
        }
    }

    fn new_alert(listing_id: Uuid, owner: Option<&str>, at: DateTime<Utc>) -> NewAlert {
        NewAlert {
            listing_id,
            target_id: None,
            owner_id: owner.map(ToString::to_string),
            channel: "@deals".into(),
            sent_at: at,
        }
    }

    #[tokio::test]
    async fn repeated_upsert_with_same_price_is_a_no_op() {
        let store = MemoryStore::new();
        let first = store.upsert(draft("https://r.test/1", 3200.0), t0()).await.unwrap();
        let second = store
            .upsert(draft("https://r.test/1", 3200.0), t0() + Duration::minutes(15))
            .await
            .unwrap();
        assert!(matches!(first, UpsertOutcome::Inserted { .. }));
        assert_eq!(second, UpsertOutcome::Unchanged { id: first.id() });
        assert_eq!(store.count().await.unwrap(), 1);
        assert!(store.snapshots_for(first.id()).await.unwrap().is_empty());
        assert_eq!(store.get(first.id()).await.unwrap().unwrap().observed_at, t0());
    }

    #[tokio::test]
    async fn price_change_writes_exactly_one_snapshot() {
        let store = MemoryStore::new();
        let id = store.upsert(draft("https://r.test/1", 3200.0), t0()).await.unwrap().id();
        let later = t0() + Duration::hours(1);
        let outcome = store.upsert(draft("https://r.test/1", 3000.0), later).await.unwrap();
        match outcome {
            UpsertOutcome::Updated { previous_price, .. } => assert_eq!(previous_price, 3200.0),
            other => panic!("expected update, got {other:?}"),
        }
        let snaps = store.snapshots_for(id).await.unwrap();
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].price, 3000.0);
        assert_eq!(snaps[0].previous_price, Some(3200.0));
        let listing = store.get(id).await.unwrap().unwrap();
        assert_eq!(listing.price, 3000.0);
        assert_eq!(listing.observed_at, later);
    }

    #[tokio::test]
    async fn injected_failures_only_hit_the_named_url() {
        let store = MemoryStore::new();
        store.fail_upserts_for("https://r.test/bad");
        assert!(store.upsert(draft("https://r.test/bad", 10.0), t0()).await.is_err());
        assert!(store.upsert(draft("https://r.test/good", 10.0), t0()).await.is_ok());
    }

    #[tokio::test]
    async fn keyset_pages_cover_every_listing_once() {
        let store = MemoryStore::new();
        for i in 0..7 {
            store.upsert(draft(&format!("https://r.test/{i}"), 100.0), t0()).await.unwrap();
        }
        let mut seen = Vec::new();
        let mut after = None;
        loop {
            let page = store.page(after, 3).await.unwrap();
            if page.is_empty() {
                break;
            }
            after = page.last().map(|l| l.id);
            seen.extend(page.into_iter().map(|l| l.id));
        }
        assert_eq!(seen.len(), 7);
        let unique = seen.iter().collect::<HashSet<_>>();
        assert_eq!(unique.len(), 7);
    }

    #[tokio::test]
    async fn cooldown_window_respects_owner_scope() {
        let store = MemoryStore::new();
        let listing = Uuid::new_v4();
        store.record_alert(new_alert(listing, Some("alice"), t0())).await.unwrap();

        let since = t0() - Duration::minutes(60);
        assert!(store.has_recent_alert(listing, None, since).await.unwrap());
        assert!(store.has_recent_alert(listing, Some("alice"), since).await.unwrap());
        assert!(!store.has_recent_alert(listing, Some("bob"), since).await.unwrap());
        assert!(!store
            .has_recent_alert(listing, None, t0() + Duration::minutes(1))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn released_reservation_frees_the_slot() {
        let store = MemoryStore::new();
        let listing = Uuid::new_v4();
        let window = t0() - Duration::minutes(60);
        let reserved = store.try_reserve(new_alert(listing, None, t0()), window).await.unwrap().unwrap();
        assert!(store.try_reserve(new_alert(listing, None, t0()), window).await.unwrap().is_none());
        store.release(reserved.id).await.unwrap();
        assert!(store.try_reserve(new_alert(listing, None, t0()), window).await.unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reservations_have_a_single_winner() {
        let store = Arc::new(MemoryStore::new());
        let listing = Uuid::new_v4();
        let window = t0() - Duration::minutes(60);
        let attempts = (0..16).map(|_| {
            let store = store.clone();
            tokio::spawn(async move { store.try_reserve(new_alert(listing, None, t0()), window).await })
        });
        let results = futures::future::join_all(attempts).await;
        let winners = results
            .into_iter()
            .filter(|r| matches!(r, Ok(Ok(Some(_)))))
            .count();
        assert_eq!(winners, 1);
        assert_eq!(store.alert_count(), 1);
    }

    #[tokio::test]
    async fn inactive_targets_are_filtered() {
        let mut paused = WatchTarget::new("alice", Some("Omega"), Some("Speedmaster"), 5000.0);
        paused.active = false;
        let store = MemoryStore::with_targets(vec![
            WatchTarget::new("alice", Some("Tudor"), Some("Black Bay"), 3500.0),
            paused,
        ]);
        let active = store.active_targets().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].brand.as_deref(), Some("Tudor"));
    }
}

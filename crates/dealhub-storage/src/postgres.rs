//! Postgres backend (sqlx, runtime-checked queries).

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dealhub_core::{Alert, Condition, DealScore, Listing, ListingDraft, NewAlert, PriceSnapshot, WatchTarget};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, QueryBuilder, Row};
use tracing::info;
use uuid::Uuid;

use crate::store::{price_changed, AlertStore, ListingStore, StoreError, TargetStore, UpsertOutcome};

const LISTING_COLUMNS: &str = "id, source, url, external_id, title, brand, model, size, colorway, price, \
     original_price, condition, images, seller, score, created_at, observed_at";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new().max_connections(8).connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

fn listing_from_row(row: &PgRow) -> Result<Listing, StoreError> {
    let images: serde_json::Value = row.try_get("images")?;
    let images = serde_json::from_value::<Vec<String>>(images)
        .map_err(|err| StoreError::Corrupt(format!("listing images: {err}")))?;
    let condition: String = row.try_get("condition")?;
    Ok(Listing {
        id: row.try_get("id")?,
        source: row.try_get("source")?,
        url: row.try_get("url")?,
        external_id: row.try_get("external_id")?,
        title: row.try_get("title")?,
        brand: row.try_get("brand")?,
        model: row.try_get("model")?,
        size: row.try_get("size")?,
        colorway: row.try_get("colorway")?,
        price: row.try_get("price")?,
        original_price: row.try_get("original_price")?,
        condition: Condition::parse(&condition),
        images,
        seller: row.try_get("seller")?,
        score: row.try_get("score")?,
        created_at: row.try_get("created_at")?,
        observed_at: row.try_get("observed_at")?,
    })
}

fn snapshot_from_row(row: &PgRow) -> Result<PriceSnapshot, StoreError> {
    Ok(PriceSnapshot {
        id: row.try_get("id")?,
        listing_id: row.try_get("listing_id")?,
        price: row.try_get("price")?,
        previous_price: row.try_get("previous_price")?,
        captured_at: row.try_get("captured_at")?,
    })
}

fn alert_from_row(row: &PgRow) -> Result<Alert, StoreError> {
    Ok(Alert {
        id: row.try_get("id")?,
        listing_id: row.try_get("listing_id")?,
        target_id: row.try_get("target_id")?,
        owner_id: row.try_get("owner_id")?,
        channel: row.try_get("channel")?,
        sent_at: row.try_get("sent_at")?,
    })
}

#[async_trait]
impl ListingStore for PgStore {
    async fn upsert(&self, draft: ListingDraft, observed_at: DateTime<Utc>) -> Result<UpsertOutcome, StoreError> {
        let listing = Listing::from_draft(draft, observed_at);
        let images = serde_json::to_value(&listing.images)
            .map_err(|err| StoreError::Corrupt(format!("listing images: {err}")))?;
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO listings (id, source, dedup_key, url, external_id, title, brand, model, size, colorway,
                                  price, original_price, condition, images, seller, created_at, observed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ON CONFLICT (source, dedup_key) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(listing.id)
        .bind(&listing.source)
        .bind(listing.dedup_key())
        .bind(&listing.url)
        .bind(&listing.external_id)
        .bind(&listing.title)
        .bind(&listing.brand)
        .bind(&listing.model)
        .bind(&listing.size)
        .bind(&listing.colorway)
        .bind(listing.price)
        .bind(listing.original_price)
        .bind(listing.condition.as_str())
        .bind(&images)
        .bind(&listing.seller)
        .bind(listing.created_at)
        .bind(listing.observed_at)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = inserted {
            let id: Uuid = row.try_get("id")?;
            tx.commit().await?;
            return Ok(UpsertOutcome::Inserted { id });
        }

        let row = sqlx::query("SELECT id, price FROM listings WHERE source = $1 AND dedup_key = $2 FOR UPDATE")
            .bind(&listing.source)
            .bind(listing.dedup_key())
            .fetch_one(&mut *tx)
            .await?;
        let id: Uuid = row.try_get("id")?;
        let previous_price: f64 = row.try_get("price")?;

        if !price_changed(previous_price, listing.price) {
            tx.commit().await?;
            return Ok(UpsertOutcome::Unchanged { id });
        }

        sqlx::query("UPDATE listings SET price = $2, observed_at = $3 WHERE id = $1")
            .bind(id)
            .bind(listing.price)
            .bind(observed_at)
            .execute(&mut *tx)
            .await?;

        let snapshot = PriceSnapshot::new(id, listing.price, Some(previous_price), observed_at);
        sqlx::query(
            "INSERT INTO price_snapshots (id, listing_id, price, previous_price, captured_at) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(snapshot.id)
        .bind(snapshot.listing_id)
        .bind(snapshot.price)
        .bind(snapshot.previous_price)
        .bind(snapshot.captured_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(UpsertOutcome::Updated {
            id,
            previous_price,
            snapshot_id: snapshot.id,
        })
    }

    async fn get(&self, id: Uuid) -> Result<Option<Listing>, StoreError> {
        let row = sqlx::query(&format!("SELECT {LISTING_COLUMNS} FROM listings WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(listing_from_row).transpose()
    }

    async fn set_score(&self, id: Uuid, score: DealScore) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE listings SET score = $2 WHERE id = $1")
            .bind(id)
            .bind(score.value())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn recent(&self, since: DateTime<Utc>) -> Result<Vec<Listing>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {LISTING_COLUMNS} FROM listings WHERE observed_at >= $1 ORDER BY observed_at DESC, id"
        ))
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(listing_from_row).collect()
    }

    async fn page(&self, after_id: Option<Uuid>, limit: usize) -> Result<Vec<Listing>, StoreError> {
        let mut qb = QueryBuilder::<sqlx::Postgres>::new(format!("SELECT {LISTING_COLUMNS} FROM listings"));
        if let Some(after) = after_id {
            qb.push(" WHERE id > ").push_bind(after);
        }
        qb.push(" ORDER BY id LIMIT ").push_bind(limit as i64);
        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(listing_from_row).collect()
    }

    async fn latest_snapshot_prices(&self, ids: &[Uuid]) -> Result<HashMap<Uuid, f64>, StoreError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT ON (listing_id) listing_id, price
              FROM price_snapshots
             WHERE listing_id = ANY($1)
             ORDER BY listing_id, captured_at DESC
            "#,
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;
        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            out.insert(row.try_get("listing_id")?, row.try_get("price")?);
        }
        Ok(out)
    }

    async fn insert_snapshots(&self, snapshots: &[PriceSnapshot]) -> Result<usize, StoreError> {
        if snapshots.is_empty() {
            return Ok(0);
        }
        let mut qb = QueryBuilder::<sqlx::Postgres>::new(
            "INSERT INTO price_snapshots (id, listing_id, price, previous_price, captured_at) ",
        );
        qb.push_values(snapshots, |mut b, snap| {
            b.push_bind(snap.id)
                .push_bind(snap.listing_id)
                .push_bind(snap.price)
                .push_bind(snap.previous_price)
                .push_bind(snap.captured_at);
        });
        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected() as usize)
    }

    async fn snapshots_for(&self, listing_id: Uuid) -> Result<Vec<PriceSnapshot>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, listing_id, price, previous_price, captured_at FROM price_snapshots \
             WHERE listing_id = $1 ORDER BY captured_at",
        )
        .bind(listing_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(snapshot_from_row).collect()
    }

    async fn count(&self) -> Result<usize, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM listings")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }
}

#[async_trait]
impl TargetStore for PgStore {
    async fn active_targets(&self) -> Result<Vec<WatchTarget>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, owner_id, brand, model_keywords, target_price, active, channel \
             FROM watch_targets WHERE active ORDER BY owner_id, id",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(WatchTarget {
                id: row.try_get("id")?,
                owner_id: row.try_get("owner_id")?,
                brand: row.try_get("brand")?,
                model_keywords: row.try_get("model_keywords")?,
                target_price: row.try_get("target_price")?,
                active: row.try_get("active")?,
                channel: row.try_get("channel")?,
            });
        }
        Ok(out)
    }

    async fn save_target(&self, target: WatchTarget) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO watch_targets (id, owner_id, brand, model_keywords, target_price, active, channel)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE
            SET owner_id = EXCLUDED.owner_id, brand = EXCLUDED.brand, model_keywords = EXCLUDED.model_keywords,
                target_price = EXCLUDED.target_price, active = EXCLUDED.active, channel = EXCLUDED.channel
            "#,
        )
        .bind(target.id)
        .bind(&target.owner_id)
        .bind(&target.brand)
        .bind(&target.model_keywords)
        .bind(target.target_price)
        .bind(target.active)
        .bind(&target.channel)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl AlertStore for PgStore {
    async fn has_recent_alert(
        &self,
        listing_id: Uuid,
        owner_id: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let found: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM alerts
                 WHERE listing_id = $1 AND sent_at >= $2 AND ($3::text IS NULL OR owner_id = $3)
            )
            "#,
        )
        .bind(listing_id)
        .bind(since)
        .bind(owner_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(found)
    }

    async fn record_alert(&self, alert: NewAlert) -> Result<Alert, StoreError> {
        let alert = alert.into_alert();
        insert_alert(&self.pool, &alert).await?;
        Ok(alert)
    }

    async fn try_reserve(&self, alert: NewAlert, window_start: DateTime<Utc>) -> Result<Option<Alert>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let lock_key = format!("{}:{}", alert.listing_id, alert.owner_id.as_deref().unwrap_or("*"));
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&lock_key)
            .execute(&mut *tx)
            .await?;

        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM alerts
                 WHERE listing_id = $1 AND sent_at >= $2 AND ($3::text IS NULL OR owner_id = $3)
            )
            "#,
        )
        .bind(alert.listing_id)
        .bind(window_start)
        .bind(alert.owner_id.as_deref())
        .fetch_one(&mut *tx)
        .await?;
        if exists {
            tx.rollback().await?;
            return Ok(None);
        }

        let alert = alert.into_alert();
        insert_alert(&mut *tx, &alert).await?;
        tx.commit().await?;
        Ok(Some(alert))
    }

    async fn release(&self, alert_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM alerts WHERE id = $1")
            .bind(alert_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn recent_alerts(&self, limit: usize) -> Result<Vec<Alert>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, listing_id, target_id, owner_id, channel, sent_at FROM alerts ORDER BY sent_at DESC LIMIT $1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(alert_from_row).collect()
    }
}

async fn insert_alert<'e, E>(executor: E, alert: &Alert) -> Result<(), StoreError>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query(
        "INSERT INTO alerts (id, listing_id, target_id, owner_id, channel, sent_at) VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(alert.id)
    .bind(alert.listing_id)
    .bind(alert.target_id)
    .bind(&alert.owner_id)
    .bind(&alert.channel)
    .bind(alert.sent_at)
    .execute(executor)
    .await?;
    Ok(())
}

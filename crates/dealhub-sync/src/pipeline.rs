//! One discovery cycle: fetch, parse, store, score, match, reserve, deliver.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dealhub_adapters::{adapter_for_kind, ParseContext, SourceAdapter};
use dealhub_core::{Clock, Listing, ListingDraft};
use dealhub_storage::{AlertStore, FetchGateway, ListingStore, TargetStore, UpsertOutcome};
use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::SourceConfig;
use crate::cooldown::CooldownPolicy;
use crate::delivery::{format_alert_message, DeliveryChannel, SendOptions};
use crate::matcher::{match_listing, rank_matches, MatchResult};
use crate::scoring::ScoringEngine;

/// The three store seams, usually all backed by the same value.
#[derive(Clone)]
pub struct Stores {
    pub listings: Arc<dyn ListingStore>,
    pub targets: Arc<dyn TargetStore>,
    pub alerts: Arc<dyn AlertStore>,
}

impl Stores {
    pub fn shared<S>(backend: Arc<S>) -> Self
    where
        S: ListingStore + TargetStore + AlertStore + 'static,
    {
        Self {
            listings: backend.clone(),
            targets: backend.clone(),
            alerts: backend,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub max_alerts_per_cycle: usize,
    pub delivery_delay: Duration,
    pub lookback: chrono::Duration,
    pub default_channel: Option<String>,
    pub send_options: SendOptions,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_alerts_per_cycle: 5,
            delivery_delay: Duration::from_secs(1),
            lookback: chrono::Duration::hours(24),
            default_channel: None,
            send_options: SendOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SourceReport {
    pub source_id: String,
    pub pages_fetched: usize,
    pub pages_failed: usize,
    pub parsed: usize,
    pub skipped: usize,
    pub parse_errors: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed_writes: usize,
    pub scored: usize,
    pub providers: Vec<String>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: Vec<SourceReport>,
    pub listings_considered: usize,
    pub targets: usize,
    pub deals_found: usize,
    pub alerts_sent: usize,
    pub alerts_suppressed: usize,
    pub alerts_failed: usize,
    pub errors: Vec<String>,
    /// Set when matching could not run; ingest counts above are still valid.
    pub aborted: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DealPreview {
    #[serde(flatten)]
    pub deal: MatchResult,
    pub on_cooldown: bool,
}

pub struct DealPipeline {
    gateway: Arc<FetchGateway>,
    stores: Stores,
    scorer: ScoringEngine,
    sources: Vec<SourceConfig>,
    cooldown: CooldownPolicy,
    delivery: Arc<dyn DeliveryChannel>,
    clock: Arc<dyn Clock>,
    settings: PipelineSettings,
}

impl DealPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gateway: Arc<FetchGateway>,
        stores: Stores,
        scorer: ScoringEngine,
        sources: Vec<SourceConfig>,
        cooldown: CooldownPolicy,
        delivery: Arc<dyn DeliveryChannel>,
        clock: Arc<dyn Clock>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            gateway,
            stores,
            scorer,
            sources,
            cooldown,
            delivery,
            clock,
            settings,
        }
    }

    pub fn gateway(&self) -> &Arc<FetchGateway> {
        &self.gateway
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn sources(&self) -> &[SourceConfig] {
        &self.sources
    }

    /// Runs every enabled source concurrently, then matches and delivers.
    /// `channel_override` replaces every target's channel for this run.
    pub async fn run_cycle(&self, channel_override: Option<&str>) -> Result<CycleReport> {
        let run_id = Uuid::new_v4();
        let span = info_span!("deal_cycle", %run_id);
        self.run_cycle_inner(run_id, channel_override).instrument(span).await
    }

    async fn run_cycle_inner(&self, run_id: Uuid, channel_override: Option<&str>) -> Result<CycleReport> {
        let started_at = self.clock.now();
        let enabled = self.sources.iter().filter(|s| s.enabled).collect::<Vec<_>>();
        info!(sources = enabled.len(), "deal cycle started");

        let sources = join_all(enabled.into_iter().map(|source| self.ingest_source(source))).await;
        let mut report = CycleReport {
            run_id,
            started_at,
            finished_at: started_at,
            sources,
            listings_considered: 0,
            targets: 0,
            deals_found: 0,
            alerts_sent: 0,
            alerts_suppressed: 0,
            alerts_failed: 0,
            errors: Vec::new(),
            aborted: None,
        };

        match self.ranked_matches().await {
            Ok((ranked, listings_considered, targets)) => {
                report.listings_considered = listings_considered;
                report.targets = targets;
                report.deals_found = ranked.len();
                self.deliver(ranked, channel_override, &mut report).await;
            }
            Err(err) => {
                let message = format!("{err:#}");
                warn!(error = message.as_str(), "matching skipped this cycle");
                report.errors.push(message.clone());
                report.aborted = Some(message);
            }
        }

        report.finished_at = self.clock.now();
        for source in &report.sources {
            report
                .errors
                .extend(source.errors.iter().map(|e| format!("{}: {e}", source.source_id)));
        }
        info!(
            deals = report.deals_found,
            sent = report.alerts_sent,
            suppressed = report.alerts_suppressed,
            failed = report.alerts_failed,
            "deal cycle finished"
        );
        Ok(report)
    }

    async fn ingest_source(&self, source: &SourceConfig) -> SourceReport {
        let mut report = SourceReport {
            source_id: source.source_id.clone(),
            ..SourceReport::default()
        };
        let adapter = adapter_for_kind(source.kind, &source.source_id);

        for url in &source.listing_urls {
            let outcome = match adapter.fetch_listing(&self.gateway, url).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(source = source.source_id.as_str(), url = url.as_str(), error = %err, "listing page fetch failed");
                    report.pages_failed += 1;
                    report.errors.push(err.to_string());
                    continue;
                }
            };
            report.pages_fetched += 1;
            if !report.providers.contains(&outcome.provider_used) {
                report.providers.push(outcome.provider_used.clone());
            }

            let document = outcome.document;
            let ctx = ParseContext::for_document(&source.source_id, &document);
            let parsed = match adapter.parse(&document, &ctx) {
                Ok(parsed) => parsed,
                Err(err) => {
                    warn!(source = source.source_id.as_str(), url = url.as_str(), error = %err, "listing page did not parse");
                    report.pages_failed += 1;
                    report.errors.push(err.to_string());
                    continue;
                }
            };
            report.parsed += parsed.listings.len();
            report.skipped += parsed.skipped;
            report.parse_errors += parsed.errors.len();

            for draft in parsed.listings {
                self.store_draft(adapter.as_ref(), draft, &mut report).await;
            }
        }

        info!(
            source = source.source_id.as_str(),
            parsed = report.parsed,
            inserted = report.inserted,
            updated = report.updated,
            failed = report.failed_writes,
            "source ingested"
        );
        report
    }

    async fn store_draft(&self, adapter: &dyn SourceAdapter, draft: ListingDraft, report: &mut SourceReport) {
        let url = draft.url.clone();
        let observed_at = self.clock.now();
        let outcome = match self.stores.listings.upsert(draft, observed_at).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(source = adapter.source_id(), url = url.as_str(), error = %err, "listing dropped this cycle");
                report.failed_writes += 1;
                report.errors.push(format!("{url}: {err}"));
                return;
            }
        };
        match outcome {
            UpsertOutcome::Inserted { .. } => report.inserted += 1,
            UpsertOutcome::Updated { previous_price, .. } => {
                debug!(url = url.as_str(), previous_price, "listing price changed");
                report.updated += 1;
            }
            UpsertOutcome::Unchanged { .. } => report.unchanged += 1,
        }
        if outcome.is_write() {
            match self.score_listing(outcome.id()).await {
                Ok(true) => report.scored += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(url = url.as_str(), error = %err, "scoring failed");
                    report.errors.push(format!("{url}: {err}"));
                }
            }
        }
    }

    async fn score_listing(&self, id: Uuid) -> Result<bool> {
        let Some(listing) = self.stores.listings.get(id).await? else {
            return Ok(false);
        };
        let score = self.scorer.score(&listing, None, self.clock.now());
        self.stores.listings.set_score(id, score).await?;
        Ok(true)
    }

    async fn ranked_matches(&self) -> Result<(Vec<MatchResult>, usize, usize)> {
        let now = self.clock.now();
        let listings: Vec<Listing> = self
            .stores
            .listings
            .recent(now - self.settings.lookback)
            .await
            .context("loading recent listings")?;
        let targets = self
            .stores
            .targets
            .active_targets()
            .await
            .context("loading watch targets")?;
        let matches = listings
            .iter()
            .flat_map(|listing| match_listing(listing, &targets, now))
            .collect::<Vec<_>>();
        Ok((rank_matches(matches), listings.len(), targets.len()))
    }

    async fn deliver(
        &self,
        ranked: Vec<MatchResult>,
        channel_override: Option<&str>,
        report: &mut CycleReport,
    ) {
        for deal in ranked {
            if report.alerts_sent >= self.settings.max_alerts_per_cycle {
                break;
            }
            let Some(channel) = channel_override
                .map(ToString::to_string)
                .or_else(|| deal.target.channel.clone())
                .or_else(|| self.settings.default_channel.clone())
            else {
                report.alerts_failed += 1;
                report
                    .errors
                    .push(format!("no delivery channel for target {}", deal.target.id));
                continue;
            };

            let now = self.clock.now();
            let reservation = match self
                .cooldown
                .reserve(self.stores.alerts.as_ref(), &deal, &channel, now)
                .await
            {
                Ok(Some(reservation)) => reservation,
                Ok(None) => {
                    report.alerts_suppressed += 1;
                    continue;
                }
                Err(err) => {
                    warn!(listing = %deal.listing.id, error = %err, "alert reservation failed");
                    report.alerts_failed += 1;
                    report.errors.push(format!("reserving alert for {}: {err}", deal.listing.id));
                    continue;
                }
            };

            if report.alerts_sent > 0 && !self.settings.delivery_delay.is_zero() {
                tokio::time::sleep(self.settings.delivery_delay).await;
            }

            let text = format_alert_message(&deal);
            match self
                .delivery
                .send_message(&channel, &text, &self.settings.send_options)
                .await
            {
                Ok(()) => {
                    info!(
                        listing = %deal.listing.id,
                        owner = deal.target.owner_id.as_str(),
                        channel = channel.as_str(),
                        savings = deal.savings,
                        "deal alert delivered"
                    );
                    report.alerts_sent += 1;
                }
                Err(err) => {
                    warn!(listing = %deal.listing.id, channel = channel.as_str(), error = %err, "deal alert delivery failed");
                    report.alerts_failed += 1;
                    report.errors.push(err.to_string());
                    if let Err(err) = self.stores.alerts.release(reservation.id).await {
                        warn!(alert = %reservation.id, error = %err, "could not release alert reservation");
                        report
                            .errors
                            .push(format!("releasing alert {}: {err}", reservation.id));
                    }
                }
            }
        }
    }

    /// Ranked matches with their cooldown state; no fetching, writes or delivery.
    pub async fn preview_deals(&self, limit: usize) -> Result<Vec<DealPreview>> {
        let (ranked, _, _) = self.ranked_matches().await?;
        let now = self.clock.now();
        let mut out = Vec::with_capacity(ranked.len().min(limit));
        for deal in ranked.into_iter().take(limit) {
            let on_cooldown = self
                .cooldown
                .is_cooling_down(self.stores.alerts.as_ref(), &deal, now)
                .await?;
            out.push(DealPreview { deal, on_cooldown });
        }
        Ok(out)
    }
}

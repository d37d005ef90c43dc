//! Deal discovery pipeline: configuration, scoring, matching, cooldown,
//! delivery and the scheduler that drives them.

use std::sync::Arc;

use anyhow::{Context, Result};
use dealhub_core::{Clock, SystemClock};
use dealhub_storage::{FetchGateway, MemoryStore, PgStore};
use tracing::info;

pub mod config;
pub mod cooldown;
pub mod delivery;
pub mod matcher;
pub mod pipeline;
pub mod scheduler;
pub mod scoring;
pub mod snapshot;

pub use config::{load_source_registry, load_targets, DealHubConfig, SourceConfig, SourceRegistry};
pub use cooldown::{CooldownPolicy, CooldownScope};
pub use delivery::{
    escape_markdown, format_alert_message, DeliveryChannel, DeliveryError, LogChannel, RecordingChannel, SendOptions, TelegramChannel,
};
pub use matcher::{match_listing, rank_matches, MatchResult};
pub use pipeline::{CycleReport, DealPipeline, DealPreview, PipelineSettings, SourceReport, Stores};
pub use scheduler::{normalize_cron, Scheduler, SchedulerStats, SchedulerStatus};
pub use scoring::{MarketPrice, MarketReference, MarketTable, ReferenceBasis, ScoringEngine};
pub use snapshot::{snapshot_catalog, SnapshotOptions, SnapshotReport};

pub const CRATE_NAME: &str = "dealhub-sync";

/// Everything a running process needs, wired from one [`DealHubConfig`].
pub struct DealHub {
    pub config: DealHubConfig,
    pub gateway: Arc<FetchGateway>,
    pub stores: Stores,
    pub pipeline: Arc<DealPipeline>,
    pub scheduler: Scheduler,
    pub postgres: Option<PgStore>,
}

impl DealHub {
    pub async fn from_config(config: DealHubConfig) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Self::with_clock(config, clock, None).await
    }

    /// `delivery` overrides the channel picked from the config.
    pub async fn with_clock(
        config: DealHubConfig,
        clock: Arc<dyn Clock>,
        delivery: Option<Arc<dyn DeliveryChannel>>,
    ) -> Result<Self> {
        let root = config.workspace_root.clone();
        let registry = load_source_registry(&root)?;
        let targets = load_targets(&root)?;
        let market = MarketTable::load(&root)?;
        let gateway = Arc::new(config.build_gateway(clock.clone())?);

        let (stores, postgres) = match &config.database_url {
            Some(url) => {
                let pg = PgStore::connect(url).await.context("connecting to postgres")?;
                pg.migrate().await.context("applying migrations")?;
                let stores = Stores::shared(Arc::new(pg.clone()));
                for target in targets.iter().cloned() {
                    stores.targets.save_target(target).await.context("seeding watch targets")?;
                }
                (stores, Some(pg))
            }
            None => {
                info!(targets = targets.len(), "no DATABASE_URL; using the in-memory store");
                (Stores::shared(Arc::new(MemoryStore::with_targets(targets))), None)
            }
        };

        let delivery: Arc<dyn DeliveryChannel> = match (delivery, &config.telegram_bot_token) {
            (Some(channel), _) => channel,
            (None, Some(token)) => Arc::new(TelegramChannel::new(token)?),
            (None, None) => {
                info!("no TELEGRAM_BOT_TOKEN; alerts go to the log");
                Arc::new(LogChannel)
            }
        };

        let settings = PipelineSettings {
            max_alerts_per_cycle: config.max_alerts_per_cycle,
            delivery_delay: config.delivery_delay,
            lookback: chrono::Duration::hours(config.lookback_hours),
            default_channel: config.default_channel.clone(),
            ..PipelineSettings::default()
        };
        let pipeline = Arc::new(DealPipeline::new(
            gateway.clone(),
            stores.clone(),
            ScoringEngine::new(market, registry.trust_table()),
            registry.sources.clone(),
            CooldownPolicy::new(config.cooldown_minutes, config.alert_scope),
            delivery,
            clock,
            settings,
        ));
        let scheduler = Scheduler::new(pipeline.clone(), config.cron.clone(), config.initial_delay);

        Ok(Self {
            config,
            gateway,
            stores,
            pipeline,
            scheduler,
            postgres,
        })
    }
}

//! Environment configuration and the YAML registries under the workspace root.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dealhub_adapters::AdapterKind;
use dealhub_core::{Clock, WatchTarget};
use dealhub_storage::{
    ApifyActorProvider, BackoffPolicy, BreakerPolicy, DirectHttpProvider, FetchGateway, FetchProvider,
    FixtureProvider, HttpClientConfig, ProviderSettings, QueryProxyProvider,
};
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use crate::cooldown::CooldownScope;

#[derive(Debug, Clone)]
pub struct DealHubConfig {
    pub database_url: Option<String>,
    pub workspace_root: PathBuf,
    pub scheduler_enabled: bool,
    pub cron: String,
    pub initial_delay: Duration,
    pub cooldown_minutes: i64,
    pub alert_scope: CooldownScope,
    pub max_alerts_per_cycle: usize,
    pub delivery_delay: Duration,
    pub lookback_hours: i64,
    pub telegram_bot_token: Option<String>,
    pub default_channel: Option<String>,
    pub fixture_mode: bool,
    pub direct_fetch: bool,
    pub scraperapi_key: Option<String>,
    pub apify_token: Option<String>,
    pub crawlbase_token: Option<String>,
    pub monthly_limits: HashMap<String, u64>,
    pub fetch_min_spacing: Duration,
    pub fetch_timeout: Duration,
    pub circuit_cooldown: Duration,
    pub user_agent: String,
    pub web_port: u16,
}

impl DealHubConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let flag = |key: &str, default: bool| {
            get(key)
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True" | "yes"))
                .unwrap_or(default)
        };
        let number = |key: &str, default: u64| get(key).and_then(|v| v.parse::<u64>().ok()).unwrap_or(default);

        let mut monthly_limits = HashMap::new();
        for (name, key, default) in [
            ("scraperapi", "SCRAPERAPI_MONTHLY_LIMIT", 1_000),
            ("apify", "APIFY_MONTHLY_LIMIT", 5_000),
            ("crawlbase", "CRAWLBASE_MONTHLY_LIMIT", 1_000),
            ("direct", "DIRECT_MONTHLY_LIMIT", 100_000),
        ] {
            monthly_limits.insert(name.to_string(), number(key, default));
        }

        Self {
            database_url: get("DATABASE_URL"),
            workspace_root: get("DEALHUB_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            scheduler_enabled: flag("DEALHUB_SCHEDULER_ENABLED", true),
            cron: get("DEALHUB_CRON").unwrap_or_else(|| "*/15 * * * *".to_string()),
            initial_delay: Duration::from_secs(number("DEALHUB_INITIAL_DELAY_SECS", 30)),
            cooldown_minutes: number("ALERT_COOLDOWN_MINUTES", 60) as i64,
            alert_scope: get("ALERT_SCOPE")
                .map(|v| CooldownScope::parse(&v))
                .unwrap_or_default(),
            max_alerts_per_cycle: number("MAX_ALERTS_PER_CYCLE", 5) as usize,
            delivery_delay: Duration::from_millis(number("ALERT_DELIVERY_DELAY_MS", 1_000)),
            lookback_hours: number("LISTING_LOOKBACK_HOURS", 24) as i64,
            telegram_bot_token: get("TELEGRAM_BOT_TOKEN"),
            default_channel: get("TELEGRAM_ALERT_CHAT_ID").or_else(|| get("TELEGRAM_CHANNEL_ID")),
            fixture_mode: flag("DEALHUB_FIXTURE_MODE", false),
            direct_fetch: flag("DEALHUB_DIRECT_FETCH", true),
            scraperapi_key: get("SCRAPERAPI_KEY"),
            apify_token: get("APIFY_TOKEN"),
            crawlbase_token: get("CRAWLBASE_TOKEN"),
            monthly_limits,
            fetch_min_spacing: Duration::from_millis(number("FETCH_MIN_SPACING_MS", 2_500)),
            fetch_timeout: Duration::from_secs(number("FETCH_TIMEOUT_SECS", 30)),
            circuit_cooldown: Duration::from_secs(number("CIRCUIT_COOLDOWN_SECS", 600)),
            user_agent: get("DEALHUB_USER_AGENT").unwrap_or_else(|| "dealhub-bot/0.1".to_string()),
            web_port: get("DEALHUB_WEB_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: self.fetch_timeout,
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn breaker_policy(&self) -> BreakerPolicy {
        BreakerPolicy {
            open_cooldown: chrono::Duration::seconds(self.circuit_cooldown.as_secs() as i64),
            ..BreakerPolicy::default()
        }
    }

    fn provider_settings(&self, name: &str, priority: u32) -> ProviderSettings {
        ProviderSettings {
            priority,
            monthly_limit: self.monthly_limits.get(name).copied().unwrap_or(1_000),
            min_spacing: self.fetch_min_spacing,
            timeout: self.fetch_timeout,
            available: true,
        }
    }

    /// Assembles the provider chain: fixtures (offline mode), then the proxy
    /// vendors with credentials, then direct HTTP.
    pub fn build_gateway(&self, clock: Arc<dyn Clock>) -> Result<FetchGateway> {
        let mut providers: Vec<(Arc<dyn FetchProvider>, ProviderSettings)> = Vec::new();

        if self.fixture_mode {
            let manifest = self.workspace_root.join("fixtures").join("routes.yaml");
            let fixtures = FixtureProvider::from_manifest(&manifest, clock.clone())
                .with_context(|| format!("loading fixture routes from {}", manifest.display()))?;
            info!(routes = fixtures.route_count(), "fixture mode: serving fetches from local documents");
            providers.push((
                Arc::new(fixtures),
                ProviderSettings {
                    priority: 0,
                    monthly_limit: u64::MAX,
                    min_spacing: Duration::ZERO,
                    ..self.provider_settings("fixture", 0)
                },
            ));
        } else {
            let http = self.http_client_config();
            if let Some(key) = &self.scraperapi_key {
                providers.push((
                    Arc::new(QueryProxyProvider::scraperapi(key, http.clone())?),
                    self.provider_settings("scraperapi", 1),
                ));
            }
            if let Some(token) = &self.apify_token {
                providers.push((
                    Arc::new(ApifyActorProvider::new(token, http.clone())?),
                    self.provider_settings("apify", 2),
                ));
            }
            if let Some(token) = &self.crawlbase_token {
                providers.push((
                    Arc::new(QueryProxyProvider::crawlbase(token, http.clone())?),
                    self.provider_settings("crawlbase", 3),
                ));
            }
            if self.direct_fetch {
                providers.push((
                    Arc::new(DirectHttpProvider::new(http)?),
                    self.provider_settings("direct", 100),
                ));
            }
        }

        let names = providers.iter().map(|(p, _)| p.name().to_string()).collect::<Vec<_>>();
        let gateway = FetchGateway::new(providers, self.breaker_policy(), clock)
            .context("fetch gateway needs at least one provider")?;
        info!(providers = ?names, "fetch gateway ready");
        Ok(gateway)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub kind: AdapterKind,
    #[serde(default)]
    pub listing_urls: Vec<String>,
    #[serde(default)]
    pub trust_bonus: f64,
    #[serde(default)]
    pub notes: Option<String>,
}

impl SourceRegistry {
    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }

    pub fn trust_table(&self) -> HashMap<String, f64> {
        self.sources
            .iter()
            .map(|s| (s.source_id.clone(), s.trust_bonus))
            .collect()
    }
}

pub fn load_source_registry(root: &Path) -> Result<SourceRegistry> {
    let path = root.join("sources.yaml");
    let text = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Clone, Deserialize)]
struct TargetsFile {
    #[serde(default)]
    targets: Vec<TargetEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct TargetEntry {
    owner_id: String,
    #[serde(default)]
    brand: Option<String>,
    #[serde(default)]
    model_keywords: Option<String>,
    target_price: f64,
    #[serde(default = "default_true")]
    active: bool,
    #[serde(default)]
    channel: Option<String>,
}

fn default_true() -> bool {
    true
}

impl TargetEntry {
    /// Stable id so reloading the file does not mint new targets.
    fn into_target(self) -> WatchTarget {
        let key = format!(
            "target:{}:{}:{}",
            self.owner_id,
            self.brand.as_deref().unwrap_or("*"),
            self.model_keywords.as_deref().unwrap_or("*")
        );
        WatchTarget {
            id: Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes()),
            owner_id: self.owner_id,
            brand: self.brand,
            model_keywords: self.model_keywords,
            target_price: self.target_price,
            active: self.active,
            channel: self.channel,
        }
    }
}

/// Missing file means no targets.
pub fn load_targets(root: &Path) -> Result<Vec<WatchTarget>> {
    let path = root.join("targets.yaml");
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    let file: TargetsFile = serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(file.targets.into_iter().map(TargetEntry::into_target).collect())
}

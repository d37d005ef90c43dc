//! Multi-provider fetch gateway with quota tracking and failure isolation.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dealhub_core::Clock;
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, info_span, warn, Instrument};

#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub render_js: bool,
    pub country: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedDocument {
    pub url: String,
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub document: FetchedDocument,
    pub provider_used: String,
}

#[derive(Debug, Error)]
pub enum ProviderFetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("empty response body for {0}")]
    EmptyBody(String),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("no fetch providers configured")]
    NoProvidersConfigured,
    #[error("all fetch providers exhausted for {url} after {attempts} attempt(s)")]
    AllProvidersExhausted {
        url: String,
        attempts: usize,
        last_error: Option<String>,
    },
}

/// One interchangeable backend able to retrieve a raw document.
#[async_trait]
pub trait FetchProvider: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    async fn fetch(&self, url: &str, options: &FetchOptions) -> Result<FetchedDocument, ProviderFetchError>;
}

#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub priority: u32,
    pub monthly_limit: u64,
    pub min_spacing: Duration,
    pub timeout: Duration,
    pub available: bool,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            priority: 100,
            monthly_limit: 1_000,
            min_spacing: Duration::from_millis(2_500),
            timeout: Duration::from_secs(30),
            available: true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerPolicy {
    pub failure_threshold: u32,
    pub open_cooldown: chrono::Duration,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            open_cooldown: chrono::Duration::minutes(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Per-provider counters owned by the gateway instance.
#[derive(Debug, Clone)]
struct ProviderQuota {
    used: u64,
    limit: u64,
    failures: u32,
    circuit: CircuitState,
    opened_at: Option<DateTime<Utc>>,
}

impl ProviderQuota {
    fn new(limit: u64) -> Self {
        Self {
            used: 0,
            limit,
            failures: 0,
            circuit: CircuitState::Closed,
            opened_at: None,
        }
    }

    /// Decides whether a call may go out now, moving OPEN to HALF-OPEN once the cooldown passed.
    fn admit(&mut self, now: DateTime<Utc>, policy: &BreakerPolicy) -> bool {
        if self.used >= self.limit {
            return false;
        }
        match self.circuit {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => false,
            CircuitState::Open => {
                let reopen_at = self.opened_at.unwrap_or(now) + policy.open_cooldown;
                if now >= reopen_at {
                    self.circuit = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn record_success(&mut self) {
        self.used += 1;
        self.failures = 0;
        self.circuit = CircuitState::Closed;
        self.opened_at = None;
    }

    fn record_failure(&mut self, now: DateTime<Utc>, policy: &BreakerPolicy) {
        self.failures += 1;
        let trip = self.circuit == CircuitState::HalfOpen || self.failures >= policy.failure_threshold;
        if trip {
            self.circuit = CircuitState::Open;
            self.opened_at = Some(now);
        }
    }

    /// A half-open trial that never reported back; the next caller may try again.
    fn abandon_trial(&mut self) {
        if self.circuit == CircuitState::HalfOpen {
            self.circuit = CircuitState::Open;
        }
    }

    fn reset(&mut self) {
        self.used = 0;
        self.failures = 0;
        self.circuit = CircuitState::Closed;
        self.opened_at = None;
    }
}

/// At most one in-flight request, with a minimum gap between dispatches.
#[derive(Debug)]
pub struct SpacingLimiter {
    min_spacing: Duration,
    last_dispatch: tokio::sync::Mutex<Option<Instant>>,
}

pub struct SpacingPermit<'a> {
    _guard: tokio::sync::MutexGuard<'a, Option<Instant>>,
}

impl SpacingLimiter {
    pub fn new(min_spacing: Duration) -> Self {
        Self {
            min_spacing,
            last_dispatch: tokio::sync::Mutex::new(None),
        }
    }

    /// The permit holds the slot until dropped, so callers keep it across the request.
    pub async fn acquire(&self) -> SpacingPermit<'_> {
        let mut last = self.last_dispatch.lock().await;
        if let Some(previous) = *last {
            let ready_at = previous + self.min_spacing;
            if Instant::now() < ready_at {
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
        SpacingPermit { _guard: last }
    }
}

#[derive(Debug)]
struct ProviderSlot {
    provider: Arc<dyn FetchProvider>,
    settings: ProviderSettings,
    quota: Arc<Mutex<ProviderQuota>>,
    limiter: SpacingLimiter,
}

impl ProviderSlot {
    fn quota(&self) -> MutexGuard<'_, ProviderQuota> {
        self.quota.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Reopens the circuit if a half-open trial is dropped before its outcome is recorded.
struct TrialGuard<'a> {
    slot: &'a ProviderSlot,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.slot.quota().abandon_trial();
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderStats {
    pub name: String,
    pub priority: u32,
    pub available: bool,
    pub used: u64,
    pub limit: u64,
    pub remaining: u64,
    pub failures: u32,
    pub circuit: CircuitState,
}

#[derive(Debug)]
pub struct FetchGateway {
    slots: Vec<ProviderSlot>,
    breaker: BreakerPolicy,
    clock: Arc<dyn Clock>,
}

impl FetchGateway {
    pub fn new(
        providers: Vec<(Arc<dyn FetchProvider>, ProviderSettings)>,
        breaker: BreakerPolicy,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, GatewayError> {
        if providers.is_empty() {
            return Err(GatewayError::NoProvidersConfigured);
        }
        let mut slots = providers
            .into_iter()
            .map(|(provider, settings)| ProviderSlot {
                quota: Arc::new(Mutex::new(ProviderQuota::new(settings.monthly_limit))),
                limiter: SpacingLimiter::new(settings.min_spacing),
                provider,
                settings,
            })
            .collect::<Vec<_>>();
        slots.sort_by_key(|slot| slot.settings.priority);
        Ok(Self {
            slots,
            breaker,
            clock,
        })
    }

    /// Tries eligible providers in priority order, falling through on each failure.
    pub async fn fetch(&self, url: &str, options: &FetchOptions) -> Result<FetchOutcome, GatewayError> {
        let span = info_span!("gateway_fetch", url);
        self.fetch_inner(url, options).instrument(span).await
    }

    async fn fetch_inner(&self, url: &str, options: &FetchOptions) -> Result<FetchOutcome, GatewayError> {
        let mut attempts = 0usize;
        let mut last_error: Option<String> = None;

        for slot in &self.slots {
            let name = slot.provider.name().to_string();
            if !slot.settings.available {
                continue;
            }
            let trial = {
                let mut quota = slot.quota();
                if !quota.admit(self.clock.now(), &self.breaker) {
                    continue;
                }
                quota.circuit == CircuitState::HalfOpen
            };
            let mut trial_guard = TrialGuard { slot, armed: trial };
            attempts += 1;

            let result = {
                let _permit = slot.limiter.acquire().await;
                match tokio::time::timeout(slot.settings.timeout, slot.provider.fetch(url, options)).await {
                    Ok(result) => result,
                    Err(_) => Err(ProviderFetchError::Timeout(slot.settings.timeout)),
                }
            };

            trial_guard.armed = false;
            match result {
                Ok(document) => {
                    let (used, limit) = {
                        let mut quota = slot.quota();
                        quota.record_success();
                        (quota.used, quota.limit)
                    };
                    info!(provider = name.as_str(), used, limit, "fetch succeeded");
                    return Ok(FetchOutcome {
                        document,
                        provider_used: name,
                    });
                }
                Err(err) => {
                    let (failures, circuit) = {
                        let mut quota = slot.quota();
                        quota.record_failure(self.clock.now(), &self.breaker);
                        (quota.failures, quota.circuit)
                    };
                    warn!(provider = name.as_str(), failures, ?circuit, error = %err, "provider fetch failed");
                    last_error = Some(format!("{name}: {err}"));
                }
            }
        }

        Err(GatewayError::AllProvidersExhausted {
            url: url.to_string(),
            attempts,
            last_error,
        })
    }

    pub fn stats(&self) -> Vec<ProviderStats> {
        self.slots
            .iter()
            .map(|slot| {
                let quota = slot.quota();
                ProviderStats {
                    name: slot.provider.name().to_string(),
                    priority: slot.settings.priority,
                    available: slot.settings.available,
                    used: quota.used,
                    limit: quota.limit,
                    remaining: quota.limit.saturating_sub(quota.used),
                    failures: quota.failures,
                    circuit: quota.circuit,
                }
            })
            .collect()
    }

    /// Any provider that could take a call right now, without moving circuit state.
    pub fn is_available(&self) -> bool {
        let now = self.clock.now();
        self.slots.iter().any(|slot| {
            if !slot.settings.available {
                return false;
            }
            let quota = slot.quota();
            if quota.used >= quota.limit {
                return false;
            }
            match quota.circuit {
                CircuitState::Closed => true,
                CircuitState::HalfOpen => false,
                CircuitState::Open => quota
                    .opened_at
                    .map(|at| now >= at + self.breaker.open_cooldown)
                    .unwrap_or(true),
            }
        })
    }

    /// Monthly reset of usage, failure counters and circuits.
    pub fn reset_usage(&self) {
        info!("resetting monthly fetch provider usage counters");
        for slot in &self.slots {
            slot.quota().reset();
        }
    }
}

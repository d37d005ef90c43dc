//! Concrete fetch providers: direct HTTP, query-string proxy APIs, the Apify
//! actor endpoint and an offline fixture router.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use dealhub_core::Clock;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, info_span, Instrument};

use crate::gateway::{FetchOptions, FetchProvider, FetchedDocument, ProviderFetchError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: Some("dealhub-bot/0.1".to_string()),
            backoff: BackoffPolicy::default(),
        }
    }
}

fn build_client(config: &HttpClientConfig) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(config.timeout);
    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }
    builder.build().context("building reqwest client")
}

/// Sends one GET, retrying transient statuses with backoff, and returns a non-empty body.
async fn get_with_retries(
    client: &reqwest::Client,
    backoff: &BackoffPolicy,
    request_url: &str,
    params: &[(String, String)],
    original_url: &str,
) -> Result<FetchedDocument, ProviderFetchError> {
    let mut attempt = 0;
    loop {
        let resp = client.get(request_url).query(params).send().await?;
        let status = resp.status();
        if status.is_success() {
            let content_type = resp
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(ToString::to_string);
            let final_url = if params.is_empty() {
                resp.url().to_string()
            } else {
                original_url.to_string()
            };
            let body = resp.text().await?;
            if body.trim().is_empty() {
                return Err(ProviderFetchError::EmptyBody(original_url.to_string()));
            }
            return Ok(FetchedDocument {
                url: original_url.to_string(),
                final_url,
                content_type,
                body,
                fetched_at: Utc::now(),
            });
        }

        if classify_status(status) == RetryDisposition::Retryable && attempt < backoff.max_retries {
            tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
            attempt += 1;
            continue;
        }
        return Err(ProviderFetchError::HttpStatus {
            status: status.as_u16(),
            url: original_url.to_string(),
        });
    }
}

/// Fetches the target url itself, with no intermediary.
#[derive(Debug)]
pub struct DirectHttpProvider {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl DirectHttpProvider {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: build_client(&config)?,
            backoff: config.backoff,
        })
    }
}

#[async_trait]
impl FetchProvider for DirectHttpProvider {
    fn name(&self) -> &str {
        "direct"
    }

    async fn fetch(&self, url: &str, _options: &FetchOptions) -> Result<FetchedDocument, ProviderFetchError> {
        get_with_retries(&self.client, &self.backoff, url, &[], url)
            .instrument(info_span!("direct_fetch", url))
            .await
    }
}

/// A scraping API that takes the target url plus a credential as query parameters.
#[derive(Debug)]
pub struct QueryProxyProvider {
    name: String,
    endpoint: String,
    credential_param: String,
    credential: String,
    target_param: String,
    extra_params: Vec<(String, String)>,
    render_param: Option<String>,
    country_param: Option<String>,
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl QueryProxyProvider {
    pub fn new(
        name: impl Into<String>,
        endpoint: impl Into<String>,
        credential_param: impl Into<String>,
        credential: impl Into<String>,
        config: HttpClientConfig,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            name: name.into(),
            endpoint: endpoint.into(),
            credential_param: credential_param.into(),
            credential: credential.into(),
            target_param: "url".to_string(),
            extra_params: Vec::new(),
            render_param: None,
            country_param: None,
            client: build_client(&config)?,
            backoff: config.backoff,
        })
    }

    /// ScraperAPI: `api_key`, `url`, `render`, `country_code`.
    pub fn scraperapi(api_key: impl Into<String>, config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut provider = Self::new("scraperapi", "http://api.scraperapi.com", "api_key", api_key, config)?;
        provider.render_param = Some("render".to_string());
        provider.country_param = Some("country_code".to_string());
        Ok(provider)
    }

    /// Crawlbase: `token`, `url`.
    pub fn crawlbase(token: impl Into<String>, config: HttpClientConfig) -> anyhow::Result<Self> {
        Self::new("crawlbase", "https://api.crawlbase.com/", "token", token, config)
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_params.push((key.into(), value.into()));
        self
    }

    fn params_for(&self, url: &str, options: &FetchOptions) -> Vec<(String, String)> {
        let mut params = vec![
            (self.credential_param.clone(), self.credential.clone()),
            (self.target_param.clone(), url.to_string()),
        ];
        if let Some(render) = &self.render_param {
            params.push((render.clone(), options.render_js.to_string()));
        }
        if let Some(country_param) = &self.country_param {
            let country = options.country.clone().unwrap_or_else(|| "us".to_string());
            params.push((country_param.clone(), country));
        }
        params.extend(self.extra_params.iter().cloned());
        params
    }
}

#[async_trait]
impl FetchProvider for QueryProxyProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, url: &str, options: &FetchOptions) -> Result<FetchedDocument, ProviderFetchError> {
        let params = self.params_for(url, options);
        get_with_retries(&self.client, &self.backoff, &self.endpoint, &params, url)
            .instrument(info_span!("proxy_fetch", provider = self.name.as_str(), url))
            .await
    }
}

/// Apify's synchronous actor run; the page html comes back inside the dataset items.
#[derive(Debug)]
pub struct ApifyActorProvider {
    token: String,
    actor_id: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ApifyItem {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    html: Option<String>,
}

impl ApifyActorProvider {
    pub fn new(token: impl Into<String>, config: HttpClientConfig) -> anyhow::Result<Self> {
        Ok(Self {
            token: token.into(),
            actor_id: "apify~cheerio-scraper".to_string(),
            client: build_client(&config)?,
        })
    }
}

#[async_trait]
impl FetchProvider for ApifyActorProvider {
    fn name(&self) -> &str {
        "apify"
    }

    async fn fetch(&self, url: &str, _options: &FetchOptions) -> Result<FetchedDocument, ProviderFetchError> {
        let run_url = format!(
            "https://api.apify.com/v2/acts/{}/run-sync-get-dataset-items",
            self.actor_id
        );
        let input = serde_json::json!({
            "startUrls": [{ "url": url }],
            "pageFunction": "async function pageFunction(context) { return { url: context.request.url, html: context.body }; }",
            "proxyConfiguration": { "useApifyProxy": true },
        });
        let resp = self
            .client
            .post(&run_url)
            .query(&[("token", self.token.as_str())])
            .json(&input)
            .send()
            .instrument(info_span!("apify_fetch", url))
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ProviderFetchError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        let items: Vec<ApifyItem> = resp.json().await?;
        let item = items
            .into_iter()
            .find(|item| item.html.as_deref().is_some_and(|h| !h.trim().is_empty()))
            .ok_or_else(|| ProviderFetchError::EmptyBody(url.to_string()))?;
        Ok(FetchedDocument {
            url: url.to_string(),
            final_url: item.url.unwrap_or_else(|| url.to_string()),
            content_type: Some("text/html".to_string()),
            body: item.html.unwrap_or_default(),
            fetched_at: Utc::now(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct FixtureManifest {
    routes: Vec<FixtureRoute>,
}

#[derive(Debug, Deserialize)]
struct FixtureRoute {
    url: String,
    file: String,
    #[serde(default)]
    content_type: Option<String>,
}

#[derive(Debug, Clone)]
struct FixtureDocument {
    body: String,
    content_type: Option<String>,
}

/// Serves recorded documents keyed by url; unknown urls answer 404.
#[derive(Debug, Clone)]
pub struct FixtureProvider {
    routes: HashMap<String, FixtureDocument>,
    clock: Arc<dyn Clock>,
}

impl FixtureProvider {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            routes: HashMap::new(),
            clock,
        }
    }

    pub fn with_document(
        mut self,
        url: impl Into<String>,
        body: impl Into<String>,
        content_type: Option<&str>,
    ) -> Self {
        self.routes.insert(
            url.into(),
            FixtureDocument {
                body: body.into(),
                content_type: content_type.map(ToString::to_string),
            },
        );
        self
    }

    /// Loads `routes.yaml`-style manifests; file paths resolve relative to the manifest.
    pub fn from_manifest(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading fixture manifest {}", path.display()))?;
        let manifest: FixtureManifest = serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing fixture manifest {}", path.display()))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));

        let mut provider = Self::new(clock);
        for route in manifest.routes {
            let file = base.join(&route.file);
            let body = std::fs::read_to_string(&file)
                .with_context(|| format!("reading fixture document {}", file.display()))?;
            provider = provider.with_document(route.url, body, route.content_type.as_deref());
        }
        Ok(provider)
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }
}

#[async_trait]
impl FetchProvider for FixtureProvider {
    fn name(&self) -> &str {
        "fixture"
    }

    async fn fetch(&self, url: &str, _options: &FetchOptions) -> Result<FetchedDocument, ProviderFetchError> {
        let Some(doc) = self.routes.get(url) else {
            debug!(url, "no fixture route");
            return Err(ProviderFetchError::HttpStatus {
                status: 404,
                url: url.to_string(),
            });
        };
        Ok(FetchedDocument {
            url: url.to_string(),
            final_url: url.to_string(),
            content_type: doc.content_type.clone(),
            body: doc.body.clone(),
            fetched_at: self.clock.now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dealhub_core::SystemClock;
    use tempfile::tempdir;

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 4,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
    }

    #[test]
    fn only_server_errors_and_throttling_are_retryable() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::FORBIDDEN), RetryDisposition::NonRetryable);
    }

    #[test]
    fn scraperapi_params_carry_render_and_country() {
        let provider = QueryProxyProvider::scraperapi("k3y", HttpClientConfig::default()).unwrap();
        let params = provider.params_for(
            "https://www.reddit.com/r/Watchexchange/new.json",
            &FetchOptions {
                render_js: true,
                country: None,
            },
        );
        assert!(params.contains(&("api_key".to_string(), "k3y".to_string())));
        assert!(params.contains(&("render".to_string(), "true".to_string())));
        assert!(params.contains(&("country_code".to_string(), "us".to_string())));
        assert_eq!(provider.name(), "scraperapi");
    }

    #[tokio::test]
    async fn fixture_provider_serves_known_routes_and_404s_the_rest() {
        let provider = FixtureProvider::new(Arc::new(SystemClock))
            .with_document("https://a.test/1", "{\"ok\":true}", Some("application/json"));
        let doc = provider.fetch("https://a.test/1", &FetchOptions::default()).await.unwrap();
        assert_eq!(doc.body, "{\"ok\":true}");

        let err = provider.fetch("https://a.test/2", &FetchOptions::default()).await.unwrap_err();
        assert!(matches!(err, ProviderFetchError::HttpStatus { status: 404, .. }));
    }

    #[test]
    fn fixture_manifest_resolves_files_relative_to_itself() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("page.html"), "<html></html>").unwrap();
        std::fs::write(
            dir.path().join("routes.yaml"),
            "routes:\n  - url: https://w.test/forum\n    file: page.html\n    content_type: text/html\n",
        )
        .unwrap();
        let provider = FixtureProvider::from_manifest(dir.path().join("routes.yaml"), Arc::new(SystemClock)).unwrap();
        assert_eq!(provider.route_count(), 1);
    }
}

//! Source adapter contracts, shared extraction heuristics and the
//! reddit/forum adapter implementations.

use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dealhub_core::ListingDraft;
use dealhub_storage::{FetchGateway, FetchOptions, FetchOutcome, FetchedDocument, GatewayError};
use scraper::{ElementRef, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use url::Url;

pub mod extract;
pub mod reddit;
pub mod watchuseek;

pub use reddit::{RedditListingAdapter, RedditProfile};
pub use watchuseek::WatchUseekAdapter;

pub const CRATE_NAME: &str = "dealhub-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdapterKind {
    RedditWatches,
    RedditSneakers,
    WatchuseekForum,
}

impl fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AdapterKind::RedditWatches => "reddit-watches",
            AdapterKind::RedditSneakers => "reddit-sneakers",
            AdapterKind::WatchuseekForum => "watchuseek-forum",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseContext {
    pub source_id: String,
    pub page_url: String,
    pub fetched_at: DateTime<Utc>,
}

impl ParseContext {
    pub fn for_document(source_id: &str, document: &FetchedDocument) -> Self {
        Self {
            source_id: source_id.to_string(),
            page_url: document.final_url.clone(),
            fetched_at: document.fetched_at,
        }
    }
}

/// Per-item failure; the rest of the document still parses.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("item {item}: {reason}")]
pub struct ParseError {
    pub item: String,
    pub reason: String,
}

impl ParseError {
    pub fn new(item: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            item: item.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid document from {url}: {reason}")]
    InvalidDocument { url: String, reason: String },
    #[error("bad selector {selector}: {reason}")]
    Selector { selector: String, reason: String },
    #[error("no adapter registered for source {0}")]
    UnknownSource(String),
    #[error(transparent)]
    Fetch(#[from] GatewayError),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParseOutcome {
    pub listings: Vec<ListingDraft>,
    /// Items without a for-sale marker, sold, or pinned.
    pub skipped: usize,
    pub errors: Vec<ParseError>,
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;

    fn kind(&self) -> AdapterKind;

    fn fetch_options(&self) -> FetchOptions {
        FetchOptions::default()
    }

    async fn fetch_listing(&self, gateway: &FetchGateway, url: &str) -> Result<FetchOutcome, AdapterError> {
        Ok(gateway.fetch(url, &self.fetch_options()).await?)
    }

    /// Pure: no I/O.
    fn parse(&self, document: &FetchedDocument, ctx: &ParseContext) -> Result<ParseOutcome, AdapterError>;
}

pub fn adapter_for_kind(kind: AdapterKind, source_id: &str) -> Box<dyn SourceAdapter> {
    match kind {
        AdapterKind::RedditWatches => Box::new(RedditListingAdapter::new(source_id, RedditProfile::Watches)),
        AdapterKind::RedditSneakers => Box::new(RedditListingAdapter::new(source_id, RedditProfile::Sneakers)),
        AdapterKind::WatchuseekForum => Box::new(WatchUseekAdapter::new(source_id)),
    }
}

pub fn adapter_for_source(source_id: &str) -> Option<Box<dyn SourceAdapter>> {
    let kind = match source_id {
        "reddit-watchexchange" => AdapterKind::RedditWatches,
        "reddit-sneakermarket" => AdapterKind::RedditSneakers,
        "watchuseek" => AdapterKind::WatchuseekForum,
        _ => return None,
    };
    Some(adapter_for_kind(kind, source_id))
}

pub(crate) fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Selector {
        selector: css.to_string(),
        reason: e.to_string(),
    })
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

pub(crate) fn select_first_text(element: &ElementRef<'_>, sel: &Selector) -> Option<String> {
    element
        .select(sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

pub(crate) fn select_first_attr(element: &ElementRef<'_>, sel: &Selector, attr: &str) -> Option<String> {
    element
        .select(sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string()))
}

pub(crate) fn select_all_attrs(element: &ElementRef<'_>, sel: &Selector, attr: &str) -> Vec<String> {
    element
        .select(sel)
        .filter_map(|n| n.value().attr(attr))
        .filter_map(|s| text_or_none(s.to_string()))
        .collect()
}

pub(crate) fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str()
}

pub(crate) fn json_f64(value: &JsonValue, path: &[&str]) -> Option<f64> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_f64()
}

pub(crate) fn json_bool(value: &JsonValue, path: &[&str]) -> bool {
    let mut cur = value;
    for segment in path {
        match cur.get(*segment) {
            Some(next) => cur = next,
            None => return false,
        }
    }
    cur.as_bool().unwrap_or(false)
}

/// Resolves `href` against `base`; an unparseable base leaves `href` as given.
pub(crate) fn absolutize(base: &str, href: &str) -> String {
    Url::parse(base)
        .and_then(|base| base.join(href))
        .map(String::from)
        .unwrap_or_else(|_| href.to_string())
}

/// Recorded document plus the expected parse, as stored under `fixtures/<source>/sample/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceFixture {
    pub source_id: String,
    pub captured_from_url: String,
    pub fetched_at: DateTime<Utc>,
    pub content_type: String,
    pub document: String,
}

#[derive(Debug, Deserialize)]
struct FixtureMeta {
    source_id: String,
    captured_from_url: String,
    fetched_at: DateTime<Utc>,
    content_type: String,
    document_path: String,
}

/// Loads `fixture.json` and the raw document it points at.
pub fn load_source_fixture(path: impl AsRef<Path>) -> Result<SourceFixture> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let meta: FixtureMeta = serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
    let doc_path = path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(&meta.document_path);
    let document = fs::read_to_string(&doc_path)
        .with_context(|| format!("reading fixture document {}", doc_path.display()))?;
    Ok(SourceFixture {
        source_id: meta.source_id,
        captured_from_url: meta.captured_from_url,
        fetched_at: meta.fetched_at,
        content_type: meta.content_type,
        document,
    })
}

impl SourceFixture {
    pub fn as_document(&self) -> FetchedDocument {
        FetchedDocument {
            url: self.captured_from_url.clone(),
            final_url: self.captured_from_url.clone(),
            content_type: Some(self.content_type.clone()),
            body: self.document.clone(),
            fetched_at: self.fetched_at,
        }
    }

    pub fn parse_with(&self, adapter: &dyn SourceAdapter) -> Result<ParseOutcome, AdapterError> {
        let document = self.as_document();
        let ctx = ParseContext::for_document(&self.source_id, &document);
        adapter.parse(&document, &ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_knows_the_builtin_sources() {
        for id in ["reddit-watchexchange", "reddit-sneakermarket", "watchuseek"] {
            let adapter = adapter_for_source(id).expect("registered");
            assert_eq!(adapter.source_id(), id);
        }
        assert!(adapter_for_source("craigslist").is_none());
        assert_eq!(
            adapter_for_kind(AdapterKind::RedditWatches, "reddit-rolex").source_id(),
            "reddit-rolex"
        );
    }

    #[test]
    fn kinds_use_kebab_case_names() {
        let kind: AdapterKind = serde_json::from_str("\"watchuseek-forum\"").unwrap();
        assert_eq!(kind, AdapterKind::WatchuseekForum);
        assert_eq!(AdapterKind::RedditSneakers.to_string(), "reddit-sneakers");
    }

    #[test]
    fn relative_links_resolve_against_origin() {
        let base = "https://www.watchuseek.com/forums/sales-corner.30/";
        assert_eq!(
            absolutize(base, "/threads/fs-tudor.123/"),
            "https://www.watchuseek.com/threads/fs-tudor.123/"
        );
        assert_eq!(absolutize(base, "https://x.test/a"), "https://x.test/a");
        assert_eq!(absolutize(base, "//cdn.test/i.jpg"), "https://cdn.test/i.jpg");
        assert_eq!(
            absolutize(base, "../watch-talk.2/"),
            "https://www.watchuseek.com/forums/watch-talk.2/"
        );
        assert_eq!(
            absolutize(base, "?page=2"),
            "https://www.watchuseek.com/forums/sales-corner.30/?page=2"
        );
        assert_eq!(absolutize("not a url", "/threads/x.1/"), "/threads/x.1/");
    }

    #[test]
    fn json_helpers_walk_nested_paths() {
        let value = serde_json::json!({"data": {"title": "x", "price": 12.5, "stickied": true}});
        assert_eq!(json_str(&value, &["data", "title"]), Some("x"));
        assert_eq!(json_f64(&value, &["data", "price"]), Some(12.5));
        assert!(json_bool(&value, &["data", "stickied"]));
        assert!(!json_bool(&value, &["data", "missing"]));
    }
}

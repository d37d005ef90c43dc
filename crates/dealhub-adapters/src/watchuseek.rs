//! WatchUSeek sales-corner thread lists (XenForo markup).

use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use dealhub_core::ListingDraft;
use dealhub_storage::FetchedDocument;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::debug;

use crate::extract::{self, BrandVocabulary, PriceBounds, SaleMarker};
use crate::{
    absolutize, select_all_attrs, select_first_attr, select_first_text, selector, AdapterError, AdapterKind,
    ParseContext, ParseError, ParseOutcome, SourceAdapter,
};

static THREAD_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\.(\d+)/?(?:[?#].*)?$").expect("valid thread id regex"));

#[derive(Debug)]
struct ThreadSelectors {
    item: Selector,
    title_block: Selector,
    title_link: Selector,
    author: Selector,
    started: Selector,
    thumbnail: Selector,
}

impl ThreadSelectors {
    fn build() -> Result<Self, AdapterError> {
        Ok(Self {
            item: selector(".structItem--thread")?,
            title_block: selector(".structItem-title")?,
            title_link: selector(r#".structItem-title a[href*="/threads/"]"#)?,
            author: selector(".username")?,
            started: selector(".structItem-startDate time")?,
            thumbnail: selector(".structItem-iconContainer img[src]")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct WatchUseekAdapter {
    source_id: String,
}

impl WatchUseekAdapter {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
        }
    }

    fn parse_thread(
        &self,
        thread: &ElementRef<'_>,
        sel: &ThreadSelectors,
        index: usize,
        ctx: &ParseContext,
    ) -> Result<Option<ListingDraft>, ParseError> {
        let href = select_first_attr(thread, &sel.title_link, "href")
            .ok_or_else(|| ParseError::new(format!("#{index}"), "missing thread link"))?;
        let url = absolutize(&ctx.page_url, &href);
        let external_id = THREAD_ID_RE
            .captures(&href)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string());
        let item = external_id.clone().unwrap_or_else(|| url.clone());

        let title = select_first_text(thread, &sel.title_link).ok_or_else(|| ParseError::new(&item, "empty title"))?;
        // The prefix label ("For Sale", "Sold") lives beside the link.
        let title_block = select_first_text(thread, &sel.title_block).unwrap_or_else(|| title.clone());
        if extract::sale_marker(&title_block) != SaleMarker::ForSale {
            return Ok(None);
        }

        let price = extract::extract_price(&title_block, PriceBounds::LUXURY)
            .ok_or_else(|| ParseError::new(&item, "no price within bounds"))?;

        let vocabulary = BrandVocabulary::watches();
        let brand = vocabulary.detect(&title);
        let model = extract::derive_model(&title, brand.as_ref(), vocabulary);

        let posted_at = thread
            .select(&sel.started)
            .next()
            .and_then(|time| {
                time.value()
                    .attr("datetime")
                    .and_then(parse_forum_datetime)
                    .or_else(|| {
                        time.value()
                            .attr("data-time")
                            .and_then(|secs| secs.parse::<i64>().ok())
                            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
                    })
            })
            .map(|at| at.min(ctx.fetched_at));

        let images = extract::dedup_images(
            select_all_attrs(thread, &sel.thumbnail, "src")
                .into_iter()
                .filter(|src| !src.contains("/avatars/"))
                .map(|src| absolutize(&ctx.page_url, &src)),
        );

        Ok(Some(ListingDraft {
            source: self.source_id.clone(),
            url,
            external_id,
            size: extract::extract_case_size(&title),
            colorway: None,
            price,
            original_price: extract::extract_retail_price(&title_block, PriceBounds::LUXURY),
            condition: extract::extract_condition(&title),
            images,
            seller: select_first_text(thread, &sel.author),
            posted_at,
            brand: brand.map(|b| b.brand),
            model,
            title,
        }))
    }
}

/// XenForo writes `2026-03-01T09:30:00-0500`; plain RFC 3339 is accepted too.
fn parse_forum_datetime(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%z"))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[async_trait]
impl SourceAdapter for WatchUseekAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::WatchuseekForum
    }

    fn parse(&self, document: &FetchedDocument, ctx: &ParseContext) -> Result<ParseOutcome, AdapterError> {
        if !document.body.trim_start().starts_with('<') {
            return Err(AdapterError::InvalidDocument {
                url: document.url.clone(),
                reason: "expected an html document".to_string(),
            });
        }
        let sel = ThreadSelectors::build()?;
        let html = Html::parse_document(&document.body);

        let mut outcome = ParseOutcome::default();
        for (index, thread) in html.select(&sel.item).enumerate() {
            match self.parse_thread(&thread, &sel, index, ctx) {
                Ok(Some(draft)) => outcome.listings.push(draft),
                Ok(None) => outcome.skipped += 1,
                Err(err) => {
                    debug!(source = self.source_id.as_str(), error = %err, "skipping unparseable thread");
                    outcome.errors.push(err);
                }
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(body: &str) -> (FetchedDocument, ParseContext) {
        let fetched_at = Utc.with_ymd_and_hms(2026, 3, 1, 18, 0, 0).unwrap();
        let doc = FetchedDocument {
            url: "https://www.watchuseek.com/forums/sales-corner.30/".into(),
            final_url: "https://www.watchuseek.com/forums/sales-corner.30/".into(),
            content_type: Some("text/html".into()),
            body: body.into(),
            fetched_at,
        };
        let ctx = ParseContext::for_document("watchuseek", &doc);
        (doc, ctx)
    }

    #[test]
    fn non_html_body_is_rejected() {
        let (doc, ctx) = doc("{\"error\":\"blocked\"}");
        assert!(WatchUseekAdapter::new("watchuseek").parse(&doc, &ctx).is_err());
    }

    #[test]
    fn thread_rows_become_listings() {
        let (doc, ctx) = doc(
            r#"<html><body>
            <div class="structItem structItem--thread">
              <div class="structItem-title">
                <a href="/forums/sales-corner.30/?prefix_id=1" class="labelLink"><span class="label">For Sale</span></a>
                <a href="/threads/tudor-pelagos-39.5550001/">Tudor Pelagos 39 25407N $3,900</a>
              </div>
              <ul class="structItem-parts">
                <li><a class="username" href="/members/diver.9/">diver</a></li>
                <li class="structItem-startDate"><time datetime="2026-03-01T09:30:00-0500" data-time="1772375400">Mar 1</time></li>
              </ul>
            </div>
            <div class="structItem structItem--thread">
              <div class="structItem-title">
                <a href="/forums/sales-corner.30/?prefix_id=3" class="labelLink"><span class="label">Sold</span></a>
                <a href="/threads/omega-seamaster.5550002/">Omega Seamaster 300M $3,100</a>
              </div>
            </div>
            </body></html>"#,
        );
        let outcome = WatchUseekAdapter::new("watchuseek").parse(&doc, &ctx).unwrap();
        assert_eq!(outcome.listings.len(), 1);
        assert_eq!(outcome.skipped, 1);

        let pelagos = &outcome.listings[0];
        assert_eq!(pelagos.url, "https://www.watchuseek.com/threads/tudor-pelagos-39.5550001/");
        assert_eq!(pelagos.external_id.as_deref(), Some("5550001"));
        assert_eq!(pelagos.brand.as_deref(), Some("Tudor"));
        assert_eq!(pelagos.price, 3900.0);
        assert_eq!(pelagos.seller.as_deref(), Some("diver"));
        assert_eq!(
            pelagos.posted_at,
            Some(Utc.with_ymd_and_hms(2026, 3, 1, 14, 30, 0).unwrap())
        );
    }
}

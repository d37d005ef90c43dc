//! Reddit listing JSON (`/r/<sub>/new.json`) for marketplace subreddits.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use dealhub_core::ListingDraft;
use dealhub_storage::FetchedDocument;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::extract::{self, BrandVocabulary, PriceBounds, SaleMarker};
use crate::{
    json_bool, json_f64, json_str, AdapterError, AdapterKind, ParseContext, ParseError, ParseOutcome,
    SourceAdapter,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedditProfile {
    Watches,
    Sneakers,
}

impl RedditProfile {
    fn bounds(&self) -> PriceBounds {
        match self {
            RedditProfile::Watches => PriceBounds::LUXURY,
            RedditProfile::Sneakers => PriceBounds::APPAREL,
        }
    }

    fn vocabulary(&self) -> &'static BrandVocabulary {
        match self {
            RedditProfile::Watches => BrandVocabulary::watches(),
            RedditProfile::Sneakers => BrandVocabulary::sneakers(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RedditListingAdapter {
    source_id: String,
    profile: RedditProfile,
}

impl RedditListingAdapter {
    pub fn new(source_id: impl Into<String>, profile: RedditProfile) -> Self {
        Self {
            source_id: source_id.into(),
            profile,
        }
    }

    fn parse_post(&self, post: &JsonValue, index: usize, ctx: &ParseContext) -> Result<Option<ListingDraft>, ParseError> {
        let item = json_str(post, &["name"])
            .or_else(|| json_str(post, &["id"]))
            .map(ToString::to_string)
            .unwrap_or_else(|| format!("#{index}"));

        let title = json_str(post, &["title"])
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ParseError::new(&item, "missing title"))?;

        if json_bool(post, &["stickied"]) {
            return Ok(None);
        }
        let flair = json_str(post, &["link_flair_text"]).unwrap_or_default();
        if flair.eq_ignore_ascii_case("sold") || extract::sale_marker(title) != SaleMarker::ForSale {
            return Ok(None);
        }

        let selftext = json_str(post, &["selftext"]).unwrap_or_default();
        let full_text = format!("{title} {selftext}");
        let bounds = self.profile.bounds();
        let price = extract::extract_price(&full_text, bounds)
            .ok_or_else(|| ParseError::new(&item, "no price within bounds"))?;

        let permalink = json_str(post, &["permalink"]).ok_or_else(|| ParseError::new(&item, "missing permalink"))?;
        let url = format!("https://www.reddit.com{permalink}");

        let vocabulary = self.profile.vocabulary();
        let brand = vocabulary.detect(title);
        let model = extract::derive_model(title, brand.as_ref(), vocabulary);
        let (size, colorway) = match self.profile {
            RedditProfile::Sneakers => (extract::extract_sneaker_size(title), extract::extract_colorway(title)),
            RedditProfile::Watches => (extract::extract_case_size(&full_text), None),
        };

        let posted_at = json_f64(post, &["created_utc"])
            .and_then(|secs| Utc.timestamp_opt(secs as i64, 0).single())
            .map(|at: DateTime<Utc>| at.min(ctx.fetched_at));

        Ok(Some(ListingDraft {
            source: self.source_id.clone(),
            url,
            external_id: json_str(post, &["id"]).map(ToString::to_string),
            title: title.to_string(),
            brand: brand.map(|b| b.brand),
            model,
            size,
            colorway,
            price,
            original_price: extract::extract_retail_price(&full_text, bounds),
            condition: extract::extract_condition(&full_text),
            images: images_for(post),
            seller: json_str(post, &["author"]).map(ToString::to_string),
            posted_at,
        }))
    }
}

/// Preview images, gallery media and a direct image link, in that order.
fn images_for(post: &JsonValue) -> Vec<String> {
    let mut urls = Vec::new();
    if let Some(images) = post.pointer("/preview/images").and_then(JsonValue::as_array) {
        urls.extend(
            images
                .iter()
                .filter_map(|img| json_str(img, &["source", "url"]))
                .map(ToString::to_string),
        );
    }
    if let Some(media) = post.get("media_metadata").and_then(JsonValue::as_object) {
        urls.extend(
            media
                .values()
                .filter_map(|m| json_str(m, &["s", "u"]))
                .map(ToString::to_string),
        );
    }
    if let Some(direct) = json_str(post, &["url"]).filter(|u| extract::looks_like_image_url(u)) {
        urls.push(direct.to_string());
    }
    extract::dedup_images(urls)
}

#[async_trait]
impl SourceAdapter for RedditListingAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> AdapterKind {
        match self.profile {
            RedditProfile::Watches => AdapterKind::RedditWatches,
            RedditProfile::Sneakers => AdapterKind::RedditSneakers,
        }
    }

    fn parse(&self, document: &FetchedDocument, ctx: &ParseContext) -> Result<ParseOutcome, AdapterError> {
        let value: JsonValue = serde_json::from_str(&document.body).map_err(|e| AdapterError::InvalidDocument {
            url: document.url.clone(),
            reason: format!("invalid listing JSON: {e}"),
        })?;
        let children = value
            .pointer("/data/children")
            .and_then(JsonValue::as_array)
            .ok_or_else(|| AdapterError::InvalidDocument {
                url: document.url.clone(),
                reason: "missing data.children".to_string(),
            })?;

        let mut outcome = ParseOutcome::default();
        for (index, child) in children.iter().enumerate() {
            let Some(post) = child.get("data").filter(|d| d.is_object()) else {
                outcome.errors.push(ParseError::new(format!("#{index}"), "child without data object"));
                continue;
            };
            match self.parse_post(post, index, ctx) {
                Ok(Some(draft)) => outcome.listings.push(draft),
                Ok(None) => outcome.skipped += 1,
                Err(err) => {
                    debug!(source = self.source_id.as_str(), error = %err, "skipping unparseable post");
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
    use chrono::TimeZone;
    use serde_json::json;

    fn document(body: JsonValue) -> (FetchedDocument, ParseContext) {
        let fetched_at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let doc = FetchedDocument {
            url: "https://www.reddit.com/r/Watchexchange/new.json".into(),
            final_url: "https://www.reddit.com/r/Watchexchange/new.json".into(),
            content_type: Some("application/json".into()),
            body: body.to_string(),
            fetched_at,
        };
        let ctx = ParseContext::for_document("reddit-watchexchange", &doc);
        (doc, ctx)
    }

    fn listing(children: Vec<JsonValue>) -> JsonValue {
        json!({ "kind": "Listing", "data": { "children": children } })
    }

    #[test]
    fn invalid_json_is_a_document_error() {
        let adapter = RedditListingAdapter::new("reddit-watchexchange", RedditProfile::Watches);
        let (mut doc, ctx) = document(json!({}));
        doc.body = "<html>rate limited</html>".into();
        assert!(matches!(
            adapter.parse(&doc, &ctx),
            Err(AdapterError::InvalidDocument { .. })
        ));
    }

    #[test]
    fn bad_items_do_not_sink_their_siblings() {
        let adapter = RedditListingAdapter::new("reddit-watchexchange", RedditProfile::Watches);
        let (doc, ctx) = document(listing(vec![
            json!({"kind": "t3", "data": {
                "id": "a1", "name": "t3_a1", "title": "[WTS] Omega Speedmaster 3570.50 $4,100",
                "permalink": "/r/Watchexchange/comments/a1/x/", "author": "seller1",
                "created_utc": 1772362800.0
            }}),
            json!({"kind": "t3", "data": {
                "id": "a2", "name": "t3_a2", "title": "[WTS] Rolex Datejust, make an offer",
                "permalink": "/r/Watchexchange/comments/a2/x/"
            }}),
            json!({"kind": "t3"}),
            json!({"kind": "t3", "data": {
                "id": "a3", "name": "t3_a3", "title": "[WTB] Tudor Pelagos",
                "permalink": "/r/Watchexchange/comments/a3/x/"
            }}),
        ]));
        let outcome = adapter.parse(&doc, &ctx).unwrap();
        assert_eq!(outcome.listings.len(), 1);
        assert_eq!(outcome.skipped, 1);
        assert_eq!(outcome.errors.len(), 2);
        assert_eq!(outcome.errors[0].item, "t3_a2");

        let speedy = &outcome.listings[0];
        assert_eq!(speedy.brand.as_deref(), Some("Omega"));
        assert_eq!(speedy.price, 4100.0);
        assert_eq!(speedy.external_id.as_deref(), Some("a1"));
        assert_eq!(speedy.url, "https://www.reddit.com/r/Watchexchange/comments/a1/x/");
    }

    #[test]
    fn sold_flair_and_stickied_posts_are_skipped() {
        let adapter = RedditListingAdapter::new("reddit-watchexchange", RedditProfile::Watches);
        let (doc, ctx) = document(listing(vec![
            json!({"data": {"id": "s1", "title": "[WTS] Tudor Black Bay $3,000", "link_flair_text": "Sold",
                            "permalink": "/r/x/comments/s1/"}}),
            json!({"data": {"id": "s2", "title": "[WTS] Monthly rules thread $100", "stickied": true,
                            "permalink": "/r/x/comments/s2/"}}),
        ]));
        let outcome = adapter.parse(&doc, &ctx).unwrap();
        assert!(outcome.listings.is_empty());
        assert_eq!(outcome.skipped, 2);
    }

    #[test]
    fn posted_at_is_never_after_fetch_time() {
        let adapter = RedditListingAdapter::new("reddit-watchexchange", RedditProfile::Watches);
        let (doc, ctx) = document(listing(vec![json!({"data": {
            "id": "f1", "title": "[WTS] Seiko SPB143 $900", "permalink": "/r/x/comments/f1/",
            "created_utc": 1900000000.0
        }})]));
        let outcome = adapter.parse(&doc, &ctx).unwrap();
        assert_eq!(outcome.listings[0].posted_at, Some(ctx.fetched_at));
    }
}

//! Watch-target matching and deal ranking.

use chrono::{DateTime, Utc};
use dealhub_core::{normalize_text, round_to_tenth, Listing, WatchTarget};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub listing: Listing,
    pub target: WatchTarget,
    pub savings: f64,
    pub savings_percent: f64,
    pub rank_score: f64,
}

fn is_wildcard(term: &str) -> bool {
    let term = term.trim();
    term == "*" || term.eq_ignore_ascii_case("any")
}

/// A missing or blank brand never matches; only an explicit wildcard stands in for it.
fn brand_satisfied(target: &WatchTarget, text: &str) -> bool {
    let Some(brand) = target.brand.as_deref() else {
        return false;
    };
    if is_wildcard(brand) {
        return true;
    }
    let brand = normalize_text(brand);
    !brand.is_empty() && text.contains(&brand)
}

/// Keywords are comma-separated alternatives; any one present satisfies the target.
fn keywords_satisfied(target: &WatchTarget, text: &str) -> bool {
    let Some(keywords) = target.model_keywords.as_deref() else {
        return false;
    };
    if is_wildcard(keywords) {
        return true;
    }
    keywords
        .split(',')
        .any(|k| {
            if is_wildcard(k) {
                return true;
            }
            let k = normalize_text(k);
            !k.is_empty() && text.contains(&k)
        })
}

fn source_trust(source: &str) -> f64 {
    if source.starts_with("reddit") {
        10.0
    } else if source.starts_with("watchuseek") {
        5.0
    } else {
        0.0
    }
}

fn recency_bonus(age_hours: f64) -> f64 {
    if age_hours < 1.0 {
        15.0
    } else if age_hours < 6.0 {
        10.0
    } else if age_hours < 12.0 {
        5.0
    } else {
        0.0
    }
}

pub fn match_listing(listing: &Listing, targets: &[WatchTarget], as_of: DateTime<Utc>) -> Vec<MatchResult> {
    let text = listing.combined_text();
    targets
        .iter()
        .filter(|t| t.active && t.target_price > 0.0)
        .filter(|t| listing.price <= t.target_price)
        .filter(|t| brand_satisfied(t, &text) && keywords_satisfied(t, &text))
        .map(|target| {
            let savings = target.target_price - listing.price;
            let savings_percent = round_to_tenth(savings / target.target_price * 100.0);
            let rank_score =
                savings_percent + source_trust(&listing.source) + recency_bonus(listing.age_hours(as_of));
            MatchResult {
                listing: listing.clone(),
                target: target.clone(),
                savings,
                savings_percent,
                rank_score,
            }
        })
        .collect()
}

/// Best first: rank score, then savings, then listing id.
pub fn rank_matches(mut matches: Vec<MatchResult>) -> Vec<MatchResult> {
    matches.sort_by(|a, b| {
        b.rank_score
            .total_cmp(&a.rank_score)
            .then_with(|| b.savings.total_cmp(&a.savings))
            .then_with(|| a.listing.id.cmp(&b.listing.id))
            .then_with(|| a.target.id.cmp(&b.target.id))
    });
    matches
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use dealhub_core::{Condition, ListingDraft};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn listing(source: &str, id: &str, title: &str, brand: Option<&str>, price: f64, age: Duration) -> Listing {
        Listing::from_draft(
            ListingDraft {
                source: source.into(),
                url: format!("https://example.test/{id}"),
                external_id: Some(id.into()),
                title: title.into(),
                brand: brand.map(ToString::to_string),
                model: None,
                size: None,
                colorway: None,
                price,
                original_price: None,
                condition: Condition::Unknown,
                images: vec![],
                seller: None,
                posted_at: Some(now() - age),
            },
            now(),
        )
    }

    #[test]
    fn both_brand_and_keyword_must_appear() {
        let target = WatchTarget::new("ops", Some("Omega"), Some("Speedmaster"), 6000.0);
        let speedy = listing("reddit-watchexchange", "a", "[WTS] Omega Speedmaster 3861", Some("Omega"), 5000.0, Duration::hours(2));
        let seamaster = listing("reddit-watchexchange", "b", "[WTS] Omega Seamaster 300M", Some("Omega"), 3500.0, Duration::hours(2));
        let homage = listing("reddit-watchexchange", "c", "[WTS] Speedmaster homage by Pagani", None, 90.0, Duration::hours(2));

        assert_eq!(match_listing(&speedy, &[target.clone()], now()).len(), 1);
        assert!(match_listing(&seamaster, &[target.clone()], now()).is_empty());
        assert!(match_listing(&homage, &[target], now()).is_empty());
    }

    #[test]
    fn a_missing_half_never_matches() {
        let seamaster = listing("reddit-watchexchange", "s", "[WTS] Omega Seamaster 300M", Some("Omega"), 3500.0, Duration::hours(2));
        let brand_only = WatchTarget::new("ops", Some("Omega"), None, 6000.0);
        let keywords_only = WatchTarget::new("ops", None, Some("Seamaster"), 6000.0);
        let blank_brand = WatchTarget::new("ops", Some("  "), Some("Seamaster"), 6000.0);
        let blank_keywords = WatchTarget::new("ops", Some("Omega"), Some(" , "), 6000.0);

        for target in [brand_only, keywords_only, blank_brand, blank_keywords] {
            assert!(
                match_listing(&seamaster, &[target.clone()], now()).is_empty(),
                "target {:?}/{:?} should not match",
                target.brand,
                target.model_keywords
            );
        }

        let explicit = WatchTarget::new("ops", Some("Omega"), Some("any"), 6000.0);
        assert_eq!(match_listing(&seamaster, &[explicit], now()).len(), 1);
    }

    #[test]
    fn wildcards_and_keyword_alternatives() {
        let any_brand = WatchTarget::new("ops", Some("any"), Some("Black Bay, Pelagos"), 5000.0);
        let any_model = WatchTarget::new("ops", Some("Tudor"), Some("*"), 5000.0);
        let pelagos = listing("watchuseek", "p", "Tudor Pelagos 39", Some("Tudor"), 3900.0, Duration::hours(8));
        let results = match_listing(&pelagos, &[any_brand, any_model], now());
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn inactive_and_over_budget_targets_never_match() {
        let mut inactive = WatchTarget::new("ops", Some("Tudor"), Some("Pelagos"), 5000.0);
        inactive.active = false;
        let cheap = WatchTarget::new("ops", Some("Tudor"), Some("Pelagos"), 3000.0);
        let pelagos = listing("watchuseek", "p", "Tudor Pelagos 39", Some("Tudor"), 3900.0, Duration::hours(8));
        assert!(match_listing(&pelagos, &[inactive, cheap], now()).is_empty());
    }

    #[test]
    fn savings_and_rank_score() {
        let target = WatchTarget::new("ops", Some("Tudor"), Some("Black Bay 58"), 3500.0);
        let bb58 = listing(
            "reddit-watchexchange",
            "bb",
            "[WTS] Tudor Black Bay 58 Navy",
            Some("Tudor"),
            3200.0,
            Duration::minutes(30),
        );
        let results = match_listing(&bb58, &[target], now());
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].savings, 300.0);
        assert_eq!(results[0].savings_percent, 8.6);
        // 8.6 + 10 (reddit) + 15 (<1h)
        assert!((results[0].rank_score - 33.6).abs() < 1e-9);
    }

    #[test]
    fn ranking_is_deterministic() {
        let target = WatchTarget::new("ops", Some("Tudor"), Some("Ranger"), 5000.0);
        let older = listing("watchuseek", "old", "Tudor Ranger", Some("Tudor"), 2500.0, Duration::hours(20));
        let fresh = listing("reddit-watchexchange", "new", "Tudor Ranger", Some("Tudor"), 2600.0, Duration::minutes(5));
        let twin_a = listing("watchuseek", "twin-a", "Tudor Ranger", Some("Tudor"), 2500.0, Duration::hours(20));

        let mut all = Vec::new();
        for l in [&older, &fresh, &twin_a] {
            all.extend(match_listing(l, &[target.clone()], now()));
        }
        let ranked = rank_matches(all.clone());
        assert_eq!(ranked[0].listing.id, fresh.id);
        let (first, second) = if older.id < twin_a.id { (older.id, twin_a.id) } else { (twin_a.id, older.id) };
        assert_eq!(ranked[1].listing.id, first);
        assert_eq!(ranked[2].listing.id, second);

        all.reverse();
        let again: Vec<_> = rank_matches(all).into_iter().map(|m| m.listing.id).collect();
        assert_eq!(again, ranked.iter().map(|m| m.listing.id).collect::<Vec<_>>());
    }
}

//! Deal-quality scoring on the 0-10 scale.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dealhub_core::{normalize_text, Condition, DealScore, Listing};
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;

const BASE_SCORE: f64 = 5.0;
const FUZZY_MODEL_THRESHOLD: f64 = 0.9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketPrice {
    pub brand: String,
    pub model: String,
    pub avg_price: f64,
    #[serde(default)]
    pub sample_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReferenceBasis {
    Explicit,
    OriginalPrice,
    MarketExact,
    MarketFuzzy,
    MarketBrand,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MarketReference {
    pub price: f64,
    pub basis: ReferenceBasis,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct MarketFile {
    #[serde(default)]
    prices: Vec<MarketPrice>,
}

/// Average prices keyed on normalized `brand::model`.
#[derive(Debug, Clone, Default)]
pub struct MarketTable {
    entries: Vec<(String, String, MarketPrice)>,
}

impl MarketTable {
    pub fn new(prices: Vec<MarketPrice>) -> Self {
        let entries = prices
            .into_iter()
            .filter(|p| p.avg_price > 0.0)
            .map(|p| (normalize_text(&p.brand), normalize_text(&p.model), p))
            .collect();
        Self { entries }
    }

    /// `market_prices.yaml` under `root`; an absent file yields an empty table.
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join("market_prices.yaml");
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        let file: MarketFile = serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self::new(file.prices))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Exact `brand::model`, then fuzzy model within the brand, then the
    /// best-sampled entry for the brand alone.
    pub fn lookup(&self, brand: Option<&str>, model: Option<&str>) -> Option<MarketReference> {
        let brand = normalize_text(brand?);
        if brand.is_empty() {
            return None;
        }
        let model = model.map(normalize_text).unwrap_or_default();
        let brand_rows = || {
            self.entries
                .iter()
                .filter(|(b, _, _)| b.contains(&brand) || brand.contains(b.as_str()))
        };

        if let Some((_, _, row)) = brand_rows().find(|(b, m, _)| *b == brand && *m == model) {
            return Some(MarketReference {
                price: row.avg_price,
                basis: ReferenceBasis::MarketExact,
            });
        }

        if !model.is_empty() {
            let fuzzy = brand_rows()
                .filter(|(_, m, _)| {
                    model.contains(m.as_str()) || m.contains(&model) || jaro_winkler(m, &model) >= FUZZY_MODEL_THRESHOLD
                })
                .max_by_key(|(_, m, _)| m.len());
            if let Some((_, _, row)) = fuzzy {
                return Some(MarketReference {
                    price: row.avg_price,
                    basis: ReferenceBasis::MarketFuzzy,
                });
            }
        }

        brand_rows()
            .max_by_key(|(_, _, row)| row.sample_count)
            .map(|(_, _, row)| MarketReference {
                price: row.avg_price,
                basis: ReferenceBasis::MarketBrand,
            })
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScoringEngine {
    market: MarketTable,
    source_trust: HashMap<String, f64>,
}

impl ScoringEngine {
    pub fn new(market: MarketTable, source_trust: HashMap<String, f64>) -> Self {
        Self { market, source_trust }
    }

    pub fn market(&self) -> &MarketTable {
        &self.market
    }

    /// Reference precedence: caller-supplied, seller-stated retail, market table.
    pub fn reference_for(&self, listing: &Listing, explicit: Option<f64>) -> Option<MarketReference> {
        if let Some(price) = explicit.filter(|p| *p > 0.0) {
            return Some(MarketReference {
                price,
                basis: ReferenceBasis::Explicit,
            });
        }
        if let Some(price) = listing.original_price.filter(|p| *p > 0.0) {
            return Some(MarketReference {
                price,
                basis: ReferenceBasis::OriginalPrice,
            });
        }
        self.market.lookup(listing.brand.as_deref(), listing.model.as_deref())
    }

    /// Pure in its inputs: the same listing, reference and `as_of` give the same score.
    pub fn score(&self, listing: &Listing, market_reference: Option<f64>, as_of: DateTime<Utc>) -> DealScore {
        let mut score = BASE_SCORE;

        if let Some(reference) = self.reference_for(listing, market_reference) {
            score += discount_points(listing.price, reference.price);
        }

        score += self.source_trust.get(&listing.source).copied().unwrap_or(0.0);

        let age = listing.age_hours(as_of);
        score += if age < 1.0 {
            1.0
        } else if age < 6.0 {
            0.5
        } else if age < 24.0 {
            0.25
        } else {
            0.0
        };

        score += if listing.brand.is_some() { 0.5 } else { -1.0 };
        score += match listing.condition {
            Condition::Deadstock => 1.0,
            Condition::Unknown => 0.0,
            _ => 0.5,
        };
        score += if listing.size.is_some() { 0.25 } else { -0.5 };

        DealScore::new(score)
    }
}

fn discount_points(price: f64, reference: f64) -> f64 {
    if reference <= 0.0 {
        return 0.0;
    }
    let discount = (reference - price) / reference * 100.0;
    if discount >= 50.0 {
        3.0
    } else if discount >= 30.0 {
        2.0
    } else if discount >= 20.0 {
        1.0
    } else if discount <= -20.0 {
        -1.0
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use dealhub_core::ListingDraft;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn listing(brand: Option<&str>, model: Option<&str>, price: f64, age: Duration) -> Listing {
        let draft = ListingDraft {
            source: "reddit-watchexchange".into(),
            url: "https://www.reddit.com/r/Watchexchange/comments/x/".into(),
            external_id: Some("x".into()),
            title: "listing".into(),
            brand: brand.map(ToString::to_string),
            model: model.map(ToString::to_string),
            size: None,
            colorway: None,
            price,
            original_price: None,
            condition: Condition::Unknown,
            images: vec![],
            seller: None,
            posted_at: Some(now() - age),
        };
        Listing::from_draft(draft, now())
    }

    fn table() -> MarketTable {
        MarketTable::new(vec![
            MarketPrice {
                brand: "Tudor".into(),
                model: "Black Bay 58".into(),
                avg_price: 3600.0,
                sample_count: 40,
            },
            MarketPrice {
                brand: "Tudor".into(),
                model: "Pelagos".into(),
                avg_price: 4000.0,
                sample_count: 12,
            },
            MarketPrice {
                brand: "Omega".into(),
                model: "Speedmaster Professional".into(),
                avg_price: 5200.0,
                sample_count: 30,
            },
        ])
    }

    #[test]
    fn lookup_prefers_exact_then_fuzzy_then_brand() {
        let table = table();
        let exact = table.lookup(Some("Tudor"), Some("Black Bay 58")).unwrap();
        assert_eq!(exact.basis, ReferenceBasis::MarketExact);
        assert_eq!(exact.price, 3600.0);

        let fuzzy = table.lookup(Some("tudor"), Some("Black Bay 58 Navy 79030B")).unwrap();
        assert_eq!(fuzzy.basis, ReferenceBasis::MarketFuzzy);
        assert_eq!(fuzzy.price, 3600.0);

        let brand_only = table.lookup(Some("Tudor"), Some("Ranger")).unwrap();
        assert_eq!(brand_only.basis, ReferenceBasis::MarketBrand);
        assert_eq!(brand_only.price, 3600.0);

        assert!(table.lookup(Some("Seiko"), Some("SPB143")).is_none());
        assert!(table.lookup(None, Some("Black Bay 58")).is_none());
    }

    #[test]
    fn deep_discount_fresh_complete_listing_scores_high() {
        let engine = ScoringEngine::new(table(), HashMap::new());
        let mut item = listing(Some("Tudor"), Some("Black Bay 58"), 1700.0, Duration::minutes(20));
        item.condition = Condition::Deadstock;
        item.size = Some("39mm".into());
        // 5 + 3 (52.8% off) + 1 (fresh) + 0.5 + 1.0 + 0.25
        assert_eq!(engine.score(&item, None, now()).value(), 10.0);
    }

    #[test]
    fn unknown_brand_stale_listing_is_penalised() {
        let engine = ScoringEngine::default();
        let item = listing(None, None, 500.0, Duration::hours(30));
        // 5 - 1.0 (brand) - 0.5 (size)
        assert_eq!(engine.score(&item, None, now()).value(), 3.5);
    }

    #[test]
    fn overpriced_listing_loses_a_point() {
        let engine = ScoringEngine::default();
        let item = listing(Some("Omega"), None, 6500.0, Duration::hours(3));
        // 5 - 1 (25% above) + 0.5 (age) + 0.5 (brand) - 0.5 (size)
        assert_eq!(engine.score(&item, Some(5200.0), now()).value(), 4.5);
    }

    #[test]
    fn original_price_beats_market_table() {
        let engine = ScoringEngine::new(table(), HashMap::new());
        let mut item = listing(Some("Tudor"), Some("Black Bay 58"), 3000.0, Duration::hours(12));
        item.original_price = Some(4000.0);
        let reference = engine.reference_for(&item, None).unwrap();
        assert_eq!(reference.basis, ReferenceBasis::OriginalPrice);
        // 5 + 1 (25% off retail) + 0.25 (age) + 0.5 (brand) - 0.5 (size)
        assert_eq!(engine.score(&item, None, now()).value(), 6.3);
    }

    #[test]
    fn source_trust_is_added_and_scoring_is_deterministic() {
        let trust = HashMap::from([("reddit-watchexchange".to_string(), 0.5)]);
        let engine = ScoringEngine::new(table(), trust);
        let item = listing(Some("Tudor"), Some("Pelagos"), 3900.0, Duration::hours(2));
        let first = engine.score(&item, None, now());
        let second = engine.score(&item, None, now());
        assert_eq!(first, second);
        // 5 + 0.5 trust + 0.5 age + 0.5 brand - 0.5 size
        assert_eq!(first.value(), 6.0);
    }
}

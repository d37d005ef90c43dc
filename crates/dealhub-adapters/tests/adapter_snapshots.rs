// Golden snapshot tests: each recorded document under fixtures/<source>/sample
// must parse to exactly what snapshot.json records.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use dealhub_adapters::{adapter_for_source, load_source_fixture, ParseOutcome};
use serde::Deserialize;

#[derive(Debug, PartialEq, Deserialize)]
struct GoldenListing {
    external_id: Option<String>,
    url: String,
    title: String,
    brand: Option<String>,
    model: Option<String>,
    size: Option<String>,
    colorway: Option<String>,
    price: f64,
    original_price: Option<f64>,
    condition: String,
    images: Vec<String>,
    seller: Option<String>,
    posted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, PartialEq, Deserialize)]
struct GoldenSnapshot {
    listings: Vec<GoldenListing>,
    skipped: usize,
    errors: Vec<String>,
}

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

fn as_golden(outcome: ParseOutcome) -> GoldenSnapshot {
    GoldenSnapshot {
        listings: outcome
            .listings
            .into_iter()
            .map(|draft| GoldenListing {
                external_id: draft.external_id,
                url: draft.url,
                title: draft.title,
                brand: draft.brand,
                model: draft.model,
                size: draft.size,
                colorway: draft.colorway,
                price: draft.price,
                original_price: draft.original_price,
                condition: serde_json::to_value(draft.condition)
                    .ok()
                    .and_then(|v| v.as_str().map(ToString::to_string))
                    .unwrap_or_default(),
                images: draft.images,
                seller: draft.seller,
                posted_at: draft.posted_at,
            })
            .collect(),
        skipped: outcome.skipped,
        errors: outcome.errors.into_iter().map(|e| e.item).collect(),
    }
}

fn assert_matches_snapshot(source: &str) {
    let dir = workspace_root().join("fixtures").join(source).join("sample");
    let fixture = load_source_fixture(dir.join("fixture.json")).expect("fixture loads");
    assert_eq!(fixture.source_id, source);

    let adapter = adapter_for_source(source).expect("adapter registered");
    let outcome = fixture.parse_with(adapter.as_ref()).expect("document parses");

    let raw = std::fs::read_to_string(dir.join("snapshot.json")).expect("snapshot exists");
    let expected: GoldenSnapshot = serde_json::from_str(&raw).expect("snapshot is valid json");
    assert_eq!(as_golden(outcome), expected, "{source} drifted from its snapshot");
}

#[test]
fn reddit_watchexchange_matches_snapshot() {
    assert_matches_snapshot("reddit-watchexchange");
}

#[test]
fn reddit_sneakermarket_matches_snapshot() {
    assert_matches_snapshot("reddit-sneakermarket");
}

#[test]
fn watchuseek_matches_snapshot() {
    assert_matches_snapshot("watchuseek");
}

#[test]
fn every_fixture_route_points_at_a_file() {
    let root = workspace_root().join("fixtures");
    let routes = std::fs::read_to_string(root.join("routes.yaml")).expect("routes.yaml");
    let files: Vec<&str> = routes
        .lines()
        .filter_map(|line| line.trim().strip_prefix("file:"))
        .map(str::trim)
        .collect();
    assert_eq!(files.len(), 3);
    for file in files {
        assert!(root.join(file).exists(), "missing fixture document {file}");
    }
}

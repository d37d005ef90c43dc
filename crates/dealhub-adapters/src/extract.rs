//! Text heuristics shared by every adapter: price, brand, size, colorway,
//! condition, model, images and the for-sale marker.

use std::sync::LazyLock;

use dealhub_core::Condition;
use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceBounds {
    pub min: f64,
    pub max: f64,
}

impl PriceBounds {
    pub const APPAREL: PriceBounds = PriceBounds {
        min: 20.0,
        max: 10_000.0,
    };
    pub const LUXURY: PriceBounds = PriceBounds {
        min: 25.0,
        max: 500_000.0,
    };

    pub fn contains(&self, price: f64) -> bool {
        price >= self.min && price <= self.max
    }
}

const AMOUNT: &str = r"(\d{1,3}(?:,\d{3})+(?:\.\d{1,2})?|\d+(?:\.\d{1,2})?)";

// Order matters: thousand-separated amounts must win before `$3` is read out of `$3,200`.
static PRICE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"\$\s?(\d{1,3}(?:,\d{3})+(?:\.\d{1,2})?)".to_string(),
        r"\$\s?(\d{3,6})(?:\.\d{1,2})?\b".to_string(),
        format!(r"{AMOUNT}\s?\$"),
        format!(r"(?i){AMOUNT}\s?usd\b"),
        format!(r"(?i)\bprice\s*[:\-]?\s*\$?\s?{AMOUNT}"),
        r"\$\s?(\d{1,3})(?:\.\d{1,2})?\b".to_string(),
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid price regex"))
    .collect()
});

static RETAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"(?i)\b(?:retail(?:ed)?|msrp)\s*(?:price|for|at|was)?\s*[:\-]?\s*\$?\s?{AMOUNT}"))
        .expect("valid retail regex")
});

fn parse_amount(raw: &str) -> Option<f64> {
    raw.replace(',', "").parse::<f64>().ok()
}

/// First pattern match that falls inside `bounds`.
pub fn extract_price(text: &str, bounds: PriceBounds) -> Option<f64> {
    PRICE_PATTERNS.iter().find_map(|pattern| {
        pattern
            .captures_iter(text)
            .filter_map(|caps| caps.get(1).and_then(|m| parse_amount(m.as_str())))
            .find(|price| bounds.contains(*price))
    })
}

/// "Retail $200" / "MSRP: 7,500" style reference prices.
pub fn extract_retail_price(text: &str, bounds: PriceBounds) -> Option<f64> {
    RETAIL_RE
        .captures_iter(text)
        .filter_map(|caps| caps.get(1).and_then(|m| parse_amount(m.as_str())))
        .find(|price| bounds.contains(*price))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrandMatch {
    pub brand: String,
    pub line: Option<String>,
}

#[derive(Debug)]
struct BrandEntry {
    name: &'static str,
    pattern: Regex,
}

#[derive(Debug)]
struct LineEntry {
    brand: &'static str,
    line: &'static str,
    pattern: Regex,
}

/// Case-insensitive brand vocabulary plus product lines that imply a brand.
#[derive(Debug)]
pub struct BrandVocabulary {
    brands: Vec<BrandEntry>,
    lines: Vec<LineEntry>,
}

fn word_regex(alternatives: &str) -> Regex {
    Regex::new(&format!(r"(?i)\b(?:{alternatives})\b")).expect("valid vocabulary regex")
}

impl BrandVocabulary {
    fn build(brands: &[(&'static str, &str)], lines: &[(&'static str, &'static str, &str)]) -> Self {
        Self {
            brands: brands
                .iter()
                .map(|&(name, alts)| BrandEntry {
                    name,
                    pattern: word_regex(alts),
                })
                .collect(),
            lines: lines
                .iter()
                .map(|&(brand, line, alts)| LineEntry {
                    brand,
                    line,
                    pattern: word_regex(alts),
                })
                .collect(),
        }
    }

    pub fn watches() -> &'static BrandVocabulary {
        static WATCHES: LazyLock<BrandVocabulary> = LazyLock::new(|| {
            BrandVocabulary::build(
                &[
                    ("Grand Seiko", r"grand\s+seiko"),
                    ("Rolex", "rolex"),
                    ("Tudor", "tudor"),
                    ("Omega", "omega"),
                    ("Cartier", "cartier"),
                    ("Audemars Piguet", r"audemars(?:\s+piguet)?"),
                    ("Patek Philippe", r"patek(?:\s+philippe)?"),
                    ("Seiko", "seiko"),
                    ("IWC", "iwc"),
                    ("Breitling", "breitling"),
                    ("TAG Heuer", r"tag[\s-]heuer"),
                    ("Longines", "longines"),
                    ("Panerai", "panerai"),
                    ("Zenith", "zenith"),
                    ("Jaeger-LeCoultre", r"jaeger[\s-]?lecoultre|jlc"),
                    ("Vacheron Constantin", r"vacheron(?:\s+constantin)?"),
                    ("Hublot", "hublot"),
                    ("Hamilton", "hamilton"),
                    ("Oris", "oris"),
                    ("Sinn", "sinn"),
                    ("Nomos", "nomos"),
                    ("Tissot", "tissot"),
                    ("Citizen", "citizen"),
                    ("Casio", r"casio|g-shock"),
                    ("Doxa", "doxa"),
                    ("Christopher Ward", r"christopher\s+ward"),
                ],
                &[
                    ("Omega", "Speedmaster", "speedmaster|speedy"),
                    ("Omega", "Seamaster", "seamaster"),
                    ("Rolex", "Submariner", "submariner"),
                    ("Rolex", "Daytona", "daytona"),
                    ("Rolex", "GMT-Master", r"gmt[\s-]?master"),
                    ("Tudor", "Black Bay", r"black\s+bay"),
                    ("Tudor", "Pelagos", "pelagos"),
                    ("Cartier", "Santos", "santos"),
                    ("Cartier", "Tank", "tank"),
                    ("Audemars Piguet", "Royal Oak", r"royal\s+oak"),
                    ("Patek Philippe", "Nautilus", "nautilus"),
                    ("Patek Philippe", "Aquanaut", "aquanaut"),
                ],
            )
        });
        &WATCHES
    }

    pub fn sneakers() -> &'static BrandVocabulary {
        static SNEAKERS: LazyLock<BrandVocabulary> = LazyLock::new(|| {
            BrandVocabulary::build(
                &[
                    ("New Balance", r"new\s+balance"),
                    ("Nike", "nike"),
                    ("Adidas", "adidas"),
                    ("Asics", "asics"),
                    ("Puma", "puma"),
                    ("Reebok", "reebok"),
                    ("Converse", "converse"),
                    ("Vans", "vans"),
                    ("Salomon", "salomon"),
                    ("Saucony", "saucony"),
                    ("Balenciaga", "balenciaga"),
                    ("Off-White", r"off[\s-]?white"),
                    ("Common Projects", r"common\s+projects"),
                ],
                &[
                    ("Nike", "Jordan", r"(?:air\s+)?jordan|aj\s?\d{1,2}"),
                    ("Adidas", "Yeezy", "yeezy"),
                    ("Nike", "Dunk", "dunk"),
                    ("Nike", "Air Max", r"air\s+max"),
                    ("Adidas", "Ultraboost", r"ultra\s?boost"),
                    ("Adidas", "NMD", "nmd"),
                ],
            )
        });
        &SNEAKERS
    }

    /// An explicit brand name wins; a product line fills in the brand when none is named.
    pub fn detect(&self, text: &str) -> Option<BrandMatch> {
        let explicit = self.brands.iter().find(|b| b.pattern.is_match(text)).map(|b| b.name);
        let line = self.lines.iter().find(|l| l.pattern.is_match(text));
        match (explicit, line) {
            (Some(brand), line) => Some(BrandMatch {
                brand: brand.to_string(),
                line: line.filter(|l| l.brand == brand).map(|l| l.line.to_string()),
            }),
            (None, Some(line)) => Some(BrandMatch {
                brand: line.brand.to_string(),
                line: Some(line.line.to_string()),
            }),
            (None, None) => None,
        }
    }

    /// Regex alternatives for a canonical brand name, used to strip it out of titles.
    fn brand_pattern(&self, brand: &str) -> Option<&Regex> {
        self.brands.iter().find(|b| b.name == brand).map(|b| &b.pattern)
    }
}

static SNEAKER_SIZE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\bsize\s*[:\-]?\s*(\d+(?:\.\d)?)",
        r"(?i)\bus\s*(\d+(?:\.\d)?)\b",
        r"(?i)\bsz\s*[:\-]?\s*(\d+(?:\.\d)?)",
        r"\[(\d+(?:\.\d)?)\]",
        r"\((\d+(?:\.\d)?)\)",
        r"(?i)\bm\s?(\d+(?:\.\d)?)\b",
        r"(?i)\bw\s?(\d+(?:\.\d)?)\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid size regex"))
    .collect()
});

static CASE_SIZE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(\d{2}(?:\.\d)?)\s?mm\b").expect("valid case size regex"));

fn first_size_in_range(patterns: &[Regex], text: &str, min: f64, max: f64) -> Option<f64> {
    patterns.iter().find_map(|pattern| {
        pattern
            .captures_iter(text)
            .filter_map(|caps| caps.get(1).and_then(|m| m.as_str().parse::<f64>().ok()))
            .find(|size| *size >= min && *size <= max)
    })
}

/// US sneaker size between 3 and 18, half sizes kept ("10.5").
pub fn extract_sneaker_size(text: &str) -> Option<String> {
    first_size_in_range(&SNEAKER_SIZE_PATTERNS, text, 3.0, 18.0).map(|size| size.to_string())
}

/// Watch case diameter between 20 and 55 mm ("39mm").
pub fn extract_case_size(text: &str) -> Option<String> {
    first_size_in_range(std::slice::from_ref(&*CASE_SIZE_RE), text, 20.0, 55.0).map(|size| format!("{size}mm"))
}

const COLORWAYS: &[&str] = &[
    "Bred",
    "Chicago",
    "Royal",
    "Shadow",
    "Pine Green",
    "Mocha",
    "Travis Scott",
    "Panda",
    "Georgetown",
    "Syracuse",
    "Kentucky",
    "UNC",
    "Black Cat",
    "Triple White",
    "Triple Black",
    "Zebra",
    "Beluga",
    "Wave Runner",
    "Cream",
    "Sesame",
    "Static",
    "Onyx",
    "Bone",
    "University Blue",
    "Fire Red",
    "Cement",
    "Military Blue",
    "Cool Grey",
];

static COLORWAY_PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    COLORWAYS
        .iter()
        .map(|name| (*name, word_regex(&regex::escape(name).replace(' ', r"\s+"))))
        .collect()
});

pub fn extract_colorway(text: &str) -> Option<String> {
    COLORWAY_PATTERNS
        .iter()
        .find(|(_, pattern)| pattern.is_match(text))
        .map(|(name, _)| name.to_string())
}

static CONDITION_RULES: LazyLock<Vec<(Condition, Regex)>> = LazyLock::new(|| {
    vec![
        (Condition::NearDeadstock, word_regex(r"vnds|(?:very\s+)?near\s+deadstock")),
        (
            Condition::Deadstock,
            word_regex(r"ds|deadstock|brand\s+new|bnib|bnwt|new\s+in\s+box|unworn"),
        ),
        (Condition::Excellent, word_regex(r"mint|lnib|like\s+new|excellent|9(?:\.5)?/10")),
        (Condition::Good, word_regex(r"good|[78](?:\.5)?/10")),
        (Condition::Used, word_regex(r"worn|used|fair|pre-?owned|beater")),
    ]
});

/// Keyword heuristics, checked from the most specific bucket down.
pub fn extract_condition(text: &str) -> Condition {
    CONDITION_RULES
        .iter()
        .find(|(_, pattern)| pattern.is_match(text))
        .map(|(condition, _)| *condition)
        .unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaleMarker {
    ForSale,
    Sold,
    Absent,
}

static SOLD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)[\[(]\s*sold\s*[\])]|^\s*sold\b").expect("valid sold regex"));
static FOR_SALE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\[\s*(?:wts|fs)\s*\]|^\s*(?:fs|wts)\s*[:\-]|\bwts\b|\bfor\s+sale\b")
        .expect("valid for-sale regex")
});

pub fn sale_marker(title: &str) -> SaleMarker {
    if SOLD_RE.is_match(title) {
        SaleMarker::Sold
    } else if FOR_SALE_RE.is_match(title) {
        SaleMarker::ForSale
    } else {
        SaleMarker::Absent
    }
}

static MARKER_STRIP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\[\s*(?:wts|fs|wtt|sold)\s*\]|^\s*(?:fs|wts)\s*[:\-]|\bwts\b|\bfor\s+sale\b")
        .expect("valid marker regex")
});
static MODEL_TAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\s[-|/]\s|\$|\d[\d,]*\s?usd\b|\bprice\b|\b(?:bnib|lnib|vnds|ds|deadstock|full\s+set|b&p|size|sz|us\s?\d{1,2}(?:\.5)?)\b|[(\[,]",
    )
    .expect("valid model tail regex")
});

/// Title with sale markers removed, cut before the price/condition tail, brand name dropped.
pub fn derive_model(title: &str, brand: Option<&BrandMatch>, vocabulary: &BrandVocabulary) -> Option<String> {
    let stripped = MARKER_STRIP_RE.replace_all(title, " ");
    let head = match MODEL_TAIL_RE.find(&stripped) {
        Some(m) => &stripped[..m.start()],
        None => &stripped[..],
    };
    let without_brand = match brand.and_then(|b| vocabulary.brand_pattern(&b.brand)) {
        Some(pattern) => pattern.replace_all(head, " ").into_owned(),
        None => head.to_string(),
    };
    let model = without_brand
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_matches(|c: char| c == '-' || c == ':' || c == '|')
        .trim()
        .to_string();
    (!model.is_empty()).then_some(model)
}

/// Unescapes `&amp;` and drops duplicates while keeping first-seen order.
pub fn dedup_images<I>(urls: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut out: Vec<String> = Vec::new();
    for url in urls {
        let url = url.replace("&amp;", "&").trim().to_string();
        if url.is_empty() || out.contains(&url) {
            continue;
        }
        out.push(url);
    }
    out
}

pub fn looks_like_image_url(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    let path = lower.split('?').next().unwrap_or_default();
    [".jpg", ".jpeg", ".png", ".gif", ".webp"]
        .iter()
        .any(|ext| path.ends_with(ext))
        || lower.contains("://i.redd.it/")
}

//! Core domain model and identity derivation for MLI.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const CRATE_NAME: &str = "mli-core";

/// Source tag attached to every uploaded listing payload.
pub const LISTING_SOURCE: &str = "facebook_marketplace";

/// Category assigned when no classification rule matches a title.
pub const UNCATEGORIZED: &str = "uncategorized";

/// One normalized marketplace listing, ready for duplicate filtering and upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub title: String,
    pub price: f64,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub link: String,
    pub search_context: String,
    pub category: String,
    pub identity_key: String,
    pub source: String,
    pub discovered_at: DateTime<Utc>,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Digits following the `/item/` path segment of a marketplace URL.
///
/// Tolerant of host differences, query strings, and trailing path segments;
/// only the path convention itself is fixed.
pub fn extract_item_id(link: &str) -> Option<&str> {
    let start = link.find("/item/")? + "/item/".len();
    let rest = &link[start..];
    let end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    if end == 0 {
        None
    } else {
        Some(&rest[..end])
    }
}

/// Stable fingerprint deciding "same real-world item".
///
/// When the link carries an item id, the key depends on that id alone, so
/// tracking parameters or host casing never split one listing into two.
/// Linkless records fall back to a title/price/location digest, which is
/// weaker: two distinct listings with identical fields collide.
pub fn identity_key(link: &str, title: &str, price: f64, location: &str) -> String {
    if let Some(id) = extract_item_id(link) {
        return sha256_hex(format!("item:{id}").as_bytes());
    }
    let fragment = format!(
        "fallback:{}|{price:.2}|{}",
        normalize_fragment(title),
        normalize_fragment(location)
    );
    sha256_hex(fragment.as_bytes())
}

/// Lowercase, alphanumeric-only, single-spaced form used in fallback keys.
pub fn normalize_fragment(input: &str) -> String {
    input
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Free-form price string to a positive amount.
///
/// Strips currency symbols and thousands separators, keeping digits, the
/// decimal point, and a sign so that negative amounts still reject.
pub fn parse_price(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    let price = cleaned.parse::<f64>().ok()?;
    if price > 0.0 {
        Some(price)
    } else {
        None
    }
}

//! Core listing model and content-based identity for adwatch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const CRATE_NAME: &str = "adwatch-core";

pub const PRICE_UNAVAILABLE: &str = "Price not available";
pub const LOCATION_UNAVAILABLE: &str = "Location not available";
pub const DATE_UNKNOWN: &str = "Unknown";

/// Domain tag mixed into every listing id. Bump the version suffix only
/// together with a corpus migration: old ids would stop matching.
pub const ID_ENCODING_TAG: &[u8] = b"adwatch/listing-id/v1";

/// Derive the stable identifier of a listing from its title and price.
///
/// SHA-256 over the encoding tag, a zero byte, then each field as an
/// 8-byte little-endian length followed by its UTF-8 bytes. Length prefixes
/// keep `("ab", "c")` and `("a", "bc")` apart.
pub fn assign_id(title: &str, price: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(ID_ENCODING_TAG);
    hasher.update([0u8]);
    for field in [title, price] {
        hasher.update((field.len() as u64).to_le_bytes());
        hasher.update(field.as_bytes());
    }
    hex::encode(hasher.finalize())
}

fn default_price() -> String {
    PRICE_UNAVAILABLE.to_string()
}

fn default_location() -> String {
    LOCATION_UNAVAILABLE.to_string()
}

fn default_date() -> String {
    DATE_UNKNOWN.to_string()
}

/// Handoff contract from page fetchers into reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawListing {
    #[serde(default)]
    pub title: String,
    #[serde(default = "default_price")]
    pub price: String,
    #[serde(default = "default_location")]
    pub location: String,
    #[serde(default = "default_date")]
    pub date: String,
    #[serde(default)]
    pub link: String,
    #[serde(default)]
    pub image_url: Option<String>,
}

impl RawListing {
    pub fn new(title: impl Into<String>, price: impl Into<String>, link: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            price: price.into(),
            location: default_location(),
            date: default_date(),
            link: link.into(),
            image_url: None,
        }
    }

    /// Name of the first required field that is blank, if any.
    pub fn missing_required_field(&self) -> Option<&'static str> {
        if self.title.trim().is_empty() {
            Some("title")
        } else if self.link.trim().is_empty() {
            Some("link")
        } else {
            None
        }
    }

    pub fn id(&self) -> String {
        assign_id(&self.title, &self.price)
    }
}

/// One observed ad as persisted in the corpus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub id: String,
    pub title: String,
    pub price: String,
    pub location: String,
    pub date: String,
    pub link: String,
    #[serde(default)]
    pub image_url: Option<String>,
    pub scraped_at: DateTime<Utc>,
    /// True only for the listings introduced by the latest merge that added anything.
    #[serde(default)]
    pub is_new: bool,
    #[serde(default)]
    pub seen: bool,
}

impl Listing {
    pub fn from_raw(raw: RawListing, scraped_at: DateTime<Utc>) -> Self {
        Self {
            id: raw.id(),
            title: raw.title,
            price: raw.price,
            location: raw.location,
            date: raw.date,
            link: raw.link,
            image_url: raw.image_url,
            scraped_at,
            is_new: true,
            seen: false,
        }
    }

    pub fn is_admissible(&self) -> bool {
        !self.title.trim().is_empty() && !self.link.trim().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn listing_id_is_pinned_for_known_input() {
        let first = assign_id("Sofa", "50€");
        assert_eq!(first, assign_id("Sofa", "50€"));
        assert_eq!(
            first,
            "dfd66f47f33e31ccae0b25844aa027debef4769af24c832efa703659a876f9ff"
        );
    }

    #[test]
    fn empty_fields_still_produce_an_id() {
        assert_eq!(
            assign_id("", ""),
            "02c71a9512db47b5baab294847aaf05b5fa16b807d1bd86bc60e9c4c3f219a07"
        );
    }

    #[test]
    fn field_boundaries_are_part_of_the_identity() {
        assert_ne!(assign_id("ab", "c"), assign_id("a", "bc"));
        assert_ne!(assign_id("Sofa", "50€"), assign_id("Sofa", "51€"));
    }

    #[test]
    fn id_ignores_fields_outside_title_and_price() {
        let mut a = RawListing::new("Bike", "100€", "https://x/1");
        let mut b = a.clone();
        a.date = "Hoje às 10:00".into();
        b.image_url = Some("https://img/2.jpg".into());
        b.link = "https://x/other".into();
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn raw_listing_defaults_fill_source_placeholders() {
        let raw: RawListing =
            serde_json::from_str(r#"{"title":"Lamp","link":"https://x/9"}"#).unwrap();
        assert_eq!(raw.price, PRICE_UNAVAILABLE);
        assert_eq!(raw.location, LOCATION_UNAVAILABLE);
        assert_eq!(raw.date, DATE_UNKNOWN);
        assert!(raw.image_url.is_none());
    }

    #[test]
    fn blank_title_or_link_is_reported() {
        assert_eq!(
            RawListing::new("  ", "1€", "https://x").missing_required_field(),
            Some("title")
        );
        assert_eq!(
            RawListing::new("Desk", "1€", "").missing_required_field(),
            Some("link")
        );
        assert_eq!(RawListing::new("Desk", "1€", "https://x").missing_required_field(), None);
    }

    #[test]
    fn from_raw_starts_unseen_and_new() {
        let at = Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().unwrap();
        let listing = Listing::from_raw(RawListing::new("Chair", "20€", "https://x/2"), at);
        assert_eq!(listing.id, assign_id("Chair", "20€"));
        assert!(listing.is_new);
        assert!(!listing.seen);
        assert_eq!(listing.scraped_at, at);
        assert!(listing.is_admissible());
    }

    #[test]
    fn persisted_listing_without_flags_loads_as_unseen() {
        let json = r#"{
            "id": "abc",
            "title": "Table",
            "price": "35€",
            "location": "Porto",
            "date": "Unknown",
            "link": "https://x/3",
            "scraped_at": "2026-02-24T12:00:00Z"
        }"#;
        let listing: Listing = serde_json::from_str(json).unwrap();
        assert!(!listing.seen);
        assert!(!listing.is_new);
        assert!(listing.image_url.is_none());
    }
}

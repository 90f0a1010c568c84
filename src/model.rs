use serde::{Deserialize, Serialize};
use tracing::warn;

/// A sale post accepted for processing. This is the queue payload; the field
/// names are the wire contract between the backfill and the worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkItem {
    pub post_id: String,
    pub url: String,
    pub title: String,
    pub body: String,
    pub seller_username: String,
}

impl WorkItem {
    /// Text handed to the extractor: title and body separated by a newline.
    pub fn extraction_input(&self) -> String {
        format!("{}\n{}", self.title, self.body)
    }
}

/// One perfume exactly as the extraction service returns it, with sizes and
/// prices as parallel arrays.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ExtractedPerfume {
    pub name: String,
    pub sizes: Vec<String>,
    pub prices: Vec<String>,
}

/// Raw extraction result: `{ "perfumes": [ { name, sizes, prices } ] }`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ExtractedListing {
    pub perfumes: Vec<ExtractedPerfume>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Offer {
    pub size: String,
    pub price: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineEntry {
    pub name: String,
    pub offers: Vec<Offer>,
}

/// Structured listing for one post. Every size is already paired with its
/// price; unmatched trailing sizes or prices were dropped during conversion.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Listing {
    pub entries: Vec<LineEntry>,
    /// Number of sizes or prices discarded because the arrays disagreed.
    pub dropped: usize,
}

impl Listing {
    pub fn new(entries: Vec<LineEntry>) -> Self {
        Self {
            entries,
            dropped: 0,
        }
    }

    pub fn offer_count(&self) -> usize {
        self.entries.iter().map(|e| e.offers.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.offer_count() == 0
    }
}

impl ExtractedPerfume {
    /// Pair sizes with prices by index, stopping at the shorter array.
    /// Returns the entry and how many values were left unpaired.
    pub fn pair_offers(self) -> (LineEntry, usize) {
        let sizes = self.sizes.len();
        let prices = self.prices.len();
        let dropped = sizes.abs_diff(prices);
        if dropped > 0 {
            warn!(
                perfume = %self.name,
                sizes,
                prices,
                "mismatched sizes and prices; dropping unmatched trailing values"
            );
        }
        let offers = self
            .sizes
            .into_iter()
            .zip(self.prices)
            .map(|(size, price)| Offer { size, price })
            .collect();
        (
            LineEntry {
                name: self.name,
                offers,
            },
            dropped,
        )
    }
}

impl From<ExtractedListing> for Listing {
    fn from(raw: ExtractedListing) -> Self {
        let mut dropped = 0;
        let entries = raw
            .perfumes
            .into_iter()
            .map(|p| {
                let (entry, lost) = p.pair_offers();
                dropped += lost;
                entry
            })
            .collect();
        Listing { entries, dropped }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn perfume(name: &str, sizes: &[&str], prices: &[&str]) -> ExtractedPerfume {
        ExtractedPerfume {
            name: name.into(),
            sizes: sizes.iter().map(|s| s.to_string()).collect(),
            prices: prices.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn work_item_wire_round_trip() {
        let item = WorkItem {
            post_id: "abc123".into(),
            url: "https://www.reddit.com/r/fragranceswap/comments/abc123/wts/".into(),
            title: "[WTS] Tom Ford".into(),
            body: "TF Tobacco Vanille 100ml $150".into(),
            seller_username: "scentseller".into(),
        };
        let json = serde_json::to_value(&item).unwrap();
        for field in ["post_id", "url", "title", "body", "seller_username"] {
            assert!(json.get(field).is_some(), "missing {field}");
        }
        let back: WorkItem = serde_json::from_value(json).unwrap();
        assert_eq!(back, item);
    }

    #[test]
    fn extraction_input_joins_title_and_body() {
        let item = WorkItem {
            post_id: "x".into(),
            url: String::new(),
            title: "[WTS] title".into(),
            body: "body".into(),
            seller_username: String::new(),
        };
        assert_eq!(item.extraction_input(), "[WTS] title\nbody");
    }

    #[test]
    fn extra_sizes_are_dropped() {
        let raw = ExtractedListing {
            perfumes: vec![perfume(
                "Creed Aventus",
                &["50ml", "100ml", "150ml"],
                &["$80", "$120"],
            )],
        };
        let listing = Listing::from(raw);
        assert_eq!(listing.offer_count(), 2);
        assert_eq!(listing.dropped, 1);
        assert_eq!(
            listing.entries[0].offers[1],
            Offer {
                size: "100ml".into(),
                price: "$120".into()
            }
        );
    }

    #[test]
    fn extra_prices_are_dropped() {
        let (entry, dropped) =
            perfume("Baccarat Rouge 540", &["70ml"], &["$250", "$260"]).pair_offers();
        assert_eq!(entry.offers.len(), 1);
        assert_eq!(dropped, 1);
    }

    #[test]
    fn empty_listing_has_no_offers() {
        let listing = Listing::from(ExtractedListing::default());
        assert!(listing.is_empty());
        assert_eq!(listing.dropped, 0);

        let listing = Listing::from(ExtractedListing {
            perfumes: vec![perfume("Sold Out", &[], &[])],
        });
        assert_eq!(listing.entries.len(), 1);
        assert!(listing.is_empty());
    }
}

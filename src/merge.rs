use std::collections::{BTreeSet, HashMap};

use crate::listing::RawListing;

/// A listing after cross-task merging: the latest scraped data plus the
/// union of every keyword whose search surfaced it.
#[derive(Debug, Clone)]
pub struct MergedListing {
    pub data: RawListing,
    pub keywords: BTreeSet<String>,
}

/// Merges task result batches by external id.
///
/// Listing data is latest-wins (a later batch overwrites the scraped
/// fields), while the keyword set only ever grows. Merging the same batch
/// twice is a no-op.
#[derive(Debug, Default)]
pub struct ResultMerger {
    listings: HashMap<String, MergedListing>,
}

impl ResultMerger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one task's listings in under the keyword that found them.
    /// Empty keywords (browse-all tasks) contribute data but no keyword
    /// entry.
    pub fn merge_batch(&mut self, keyword: &str, batch: Vec<RawListing>) {
        for listing in batch {
            let entry = self
                .listings
                .entry(listing.external_id.clone())
                .or_insert_with(|| MergedListing {
                    data: listing.clone(),
                    keywords: BTreeSet::new(),
                });
            entry.data = listing;
            if !keyword.is_empty() {
                entry.keywords.insert(keyword.to_string());
            }
        }
    }

    pub fn len(&self) -> usize {
        self.listings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listings.is_empty()
    }

    /// Drain the merged set, sorted by external id for stable output.
    pub fn into_listings(self) -> Vec<MergedListing> {
        let mut merged: Vec<MergedListing> = self.listings.into_values().collect();
        merged.sort_by(|a, b| a.data.external_id.cmp(&b.data.external_id));
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(id: &str, title: &str) -> RawListing {
        RawListing {
            external_id: id.to_string(),
            url: format!("https://example.com/{}", id),
            title: title.to_string(),
            price: None,
            price_negotiable: false,
            city: None,
            state: None,
            description: None,
            condition: None,
            posted_at: None,
            image_url: None,
            seller_type: None,
        }
    }

    #[test]
    fn same_id_across_keywords_unions_keyword_sets() {
        let mut merger = ResultMerger::new();
        merger.merge_batch("thinkpad", vec![listing("100", "ThinkPad T480")]);
        merger.merge_batch("laptop", vec![listing("100", "ThinkPad T480")]);

        let merged = merger.into_listings();
        assert_eq!(merged.len(), 1);
        let keywords: Vec<&str> = merged[0].keywords.iter().map(String::as_str).collect();
        assert_eq!(keywords, vec!["laptop", "thinkpad"]);
    }

    #[test]
    fn later_batch_wins_on_listing_data() {
        let mut merger = ResultMerger::new();
        merger.merge_batch("thinkpad", vec![listing("100", "old title")]);
        merger.merge_batch("laptop", vec![listing("100", "new title")]);

        let merged = merger.into_listings();
        assert_eq!(merged[0].data.title, "new title");
        assert_eq!(merged[0].keywords.len(), 2);
    }

    #[test]
    fn merging_the_same_batch_twice_is_idempotent() {
        let mut merger = ResultMerger::new();
        let batch = vec![listing("100", "a"), listing("200", "b")];
        merger.merge_batch("thinkpad", batch.clone());
        merger.merge_batch("thinkpad", batch);

        assert_eq!(merger.len(), 2);
        let merged = merger.into_listings();
        assert!(merged.iter().all(|m| m.keywords.len() == 1));
    }

    #[test]
    fn empty_keyword_contributes_data_but_no_keyword() {
        let mut merger = ResultMerger::new();
        merger.merge_batch("", vec![listing("100", "a")]);

        let merged = merger.into_listings();
        assert_eq!(merged.len(), 1);
        assert!(merged[0].keywords.is_empty());
    }

    #[test]
    fn output_is_sorted_by_external_id() {
        let mut merger = ResultMerger::new();
        merger.merge_batch("k", vec![listing("300", "c"), listing("100", "a"), listing("200", "b")]);
        let ids: Vec<String> = merger
            .into_listings()
            .into_iter()
            .map(|m| m.data.external_id)
            .collect();
        assert_eq!(ids, vec!["100", "200", "300"]);
    }
}

//! Listing rank computation over paginated search pages.
//!
//! Organic and sponsored placements are counted independently in page
//! order, so a product gets two positions: where it sits among organic
//! results and where its ad sits, if any. Page loads go through a
//! single-flight cache so concurrent tasks asking about the same page
//! agree on one snapshot.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::page_cache::KeyedSingleFlightCache;

/// Position a product could not be found at within the scanned pages.
/// A rank of this value means "beyond scope", not an error.
pub const UNRANKED_SENTINEL: u32 = 200;

/// One item as it appears in a listing page, in page order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingItem {
    pub product_id: String,
    pub sponsored: bool,
}

/// Positions of a product within a listing, counted separately per
/// placement type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionInfo {
    /// Best (lowest) organic position across the scanned pages.
    pub organic: Option<u32>,
    /// First sponsored occurrence.
    pub sponsored: Option<u32>,
}

pub type PositionMap = HashMap<String, PositionInfo>;

#[derive(Debug, Clone)]
pub struct RankConfig {
    /// Items per listing page; offsets positions on later pages.
    pub page_size: u32,
    /// Pages scanned before a product is declared unranked.
    pub max_pages: u32,
    pub cache_ttl: Duration,
}

impl Default for RankConfig {
    fn default() -> Self {
        Self {
            page_size: 60,
            max_pages: 2,
            cache_ttl: Duration::from_secs(300),
        }
    }
}

impl RankConfig {
    pub fn with_max_pages(mut self, n: u32) -> Self {
        self.max_pages = n;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }
}

/// Fetches one page of a paginated listing. Page numbers start at 1.
pub trait ListingFetcher: Send + Sync {
    fn fetch_page(
        &self,
        page_url: &str,
        page_number: u32,
    ) -> impl Future<Output = Result<Vec<ListingItem>, AppError>> + Send;
}

/// Fold one page of items into the accumulated position map.
///
/// Sponsored and organic items advance independent counters; the
/// position is offset by `(page_number - 1) * page_size` so positions
/// are absolute across pages. Organic keeps the minimum seen, sponsored
/// keeps the first occurrence.
pub fn assign_positions(
    positions: &mut PositionMap,
    items: &[ListingItem],
    page_number: u32,
    page_size: u32,
) {
    let offset = (page_number.saturating_sub(1)) * page_size;
    let mut organic_counter = 0u32;
    let mut sponsored_counter = 0u32;

    for item in items {
        let entry = positions.entry(item.product_id.clone()).or_default();
        if item.sponsored {
            sponsored_counter += 1;
            let position = offset + sponsored_counter;
            if entry.sponsored.is_none() {
                entry.sponsored = Some(position);
            }
        } else {
            organic_counter += 1;
            let position = offset + organic_counter;
            entry.organic = Some(match entry.organic {
                Some(existing) => existing.min(position),
                None => position,
            });
        }
    }
}

/// Computes and caches product positions for listing pages.
pub struct RankingService<F: ListingFetcher> {
    fetcher: F,
    config: RankConfig,
    cache: KeyedSingleFlightCache<Arc<PositionMap>>,
}

impl<F: ListingFetcher> RankingService<F> {
    pub fn new(fetcher: F, config: RankConfig) -> Self {
        let cache = KeyedSingleFlightCache::new(config.cache_ttl);
        Self {
            fetcher,
            config,
            cache,
        }
    }

    /// Position map for a listing, scanning up to `max_pages` pages.
    ///
    /// Single-flighted per `page_url`: concurrent callers share one scan
    /// and observe identical positions for the TTL window.
    pub async fn positions(&self, page_url: &str) -> Result<Arc<PositionMap>, AppError> {
        self.cache
            .get_or_load(page_url, || async {
                let mut positions = PositionMap::new();
                for page_number in 1..=self.config.max_pages {
                    let items = self.fetcher.fetch_page(page_url, page_number).await?;
                    tracing::debug!(
                        page_url,
                        page_number,
                        item_count = items.len(),
                        "Scanned listing page"
                    );
                    assign_positions(
                        &mut positions,
                        &items,
                        page_number,
                        self.config.page_size,
                    );
                    // A short page is the last one.
                    if (items.len() as u32) < self.config.page_size {
                        break;
                    }
                }
                Ok(Arc::new(positions))
            })
            .await
    }

    /// Organic rank of a product, or the unranked sentinel when it does
    /// not appear within the scanned pages.
    pub async fn rank_of(&self, page_url: &str, product_id: &str) -> Result<u32, AppError> {
        let positions = self.positions(page_url).await?;
        Ok(positions
            .get(product_id)
            .and_then(|p| p.organic)
            .unwrap_or(UNRANKED_SENTINEL))
    }

    pub fn invalidate(&self, page_url: &str) {
        self.cache.invalidate(page_url);
    }
}

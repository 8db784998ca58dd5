use std::collections::BTreeMap;

use serde::Serialize;
use shelf_core::RawListing;

use crate::catalog::CatalogStore;
use crate::StoreError;

const MISSING_SAMPLES: usize = 3;

/// Listings recorded by one source's acquisition run.
#[derive(Debug, Clone)]
pub struct AcquiredSet {
    pub source_id: String,
    pub display_name: String,
    pub listings: Vec<RawListing>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceVerification {
    pub source_id: String,
    pub display_name: String,
    pub listings: usize,
    pub found: usize,
    pub missing: usize,
    pub missing_samples: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub sources: Vec<SourceVerification>,
    pub acquired_total: usize,
    pub catalog_total: usize,
    /// Missing slugs with a catalog smaller than the acquired total; expected
    /// after true-duplicate skipping.
    pub missing_explained_by_duplicates: bool,
    pub source_distribution: BTreeMap<String, u64>,
}

impl VerifyReport {
    pub fn missing_total(&self) -> usize {
        self.sources.iter().map(|s| s.missing).sum()
    }
}

/// Read-only audit of acquired listings against the catalog.
pub async fn verify(
    store: &dyn CatalogStore,
    acquired: &[AcquiredSet],
) -> Result<VerifyReport, StoreError> {
    let slugs = store.product_slugs().await?;
    let source_distribution = store.source_distribution().await?;

    let sources: Vec<SourceVerification> = acquired
        .iter()
        .map(|set| {
            let (found, missing): (Vec<&RawListing>, Vec<&RawListing>) = set
                .listings
                .iter()
                .partition(|l| slugs.contains(&l.slug));
            SourceVerification {
                source_id: set.source_id.clone(),
                display_name: set.display_name.clone(),
                listings: set.listings.len(),
                found: found.len(),
                missing: missing.len(),
                missing_samples: missing
                    .iter()
                    .take(MISSING_SAMPLES)
                    .map(|l| l.slug.clone())
                    .collect(),
            }
        })
        .collect();

    let acquired_total = sources.iter().map(|s| s.listings).sum();
    let missing_total: usize = sources.iter().map(|s| s.missing).sum();
    let catalog_total = slugs.len();
    tracing::info!(acquired_total, catalog_total, missing_total, "verification complete");

    Ok(VerifyReport {
        missing_explained_by_duplicates: missing_total > 0 && catalog_total < acquired_total,
        sources,
        acquired_total,
        catalog_total,
        source_distribution,
    })
}

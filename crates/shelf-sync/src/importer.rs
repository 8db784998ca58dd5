use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use shelf_core::{new_record_id, truncate_chars, CatalogProduct, Category, Product, RawListing};
use strsim::jaro_winkler;
use tracing::{debug, info};

use crate::catalog::{CatalogSnapshot, CatalogStore};
use crate::taxonomy::CategoryTaxonomy;
use crate::StoreError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportPolicy {
    /// Reconcile against the live catalog.
    #[default]
    Append,
    /// Clear products and categories in the same transaction, then insert.
    ReplaceAll,
}

/// When an incoming listing counts as the product already stored under its slug.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DuplicateRule {
    /// Inclusive absolute price difference.
    pub price_tolerance: f64,
    /// Leading characters compared case-insensitively.
    pub title_prefix_chars: usize,
}

impl Default for DuplicateRule {
    fn default() -> Self {
        Self {
            price_tolerance: 10.0,
            title_prefix_chars: 50,
        }
    }
}

impl DuplicateRule {
    pub fn matches(&self, title: &str, price: f64, existing: &CatalogProduct) -> bool {
        let prefix = |t: &str| truncate_chars(&t.trim().to_lowercase(), self.title_prefix_chars);
        prefix(title) == prefix(&existing.title)
            && (price - existing.price).abs() <= self.price_tolerance
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ImportConfig {
    pub policy: ImportPolicy,
    pub duplicates: DuplicateRule,
    /// Title similarity at or above which a price-mismatched collision is
    /// flagged for review.
    pub review_threshold: f64,
    /// Length of the slug base that numeric suffixes are appended to.
    pub suffix_base_chars: usize,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            policy: ImportPolicy::Append,
            duplicates: DuplicateRule::default(),
            review_threshold: 0.92,
            suffix_base_chars: 50,
        }
    }
}

/// Catalog-facing outcome for one listing's slug.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SlugResolution {
    Fresh { slug: String },
    Renamed { original: String, resolved: String },
    TrueDuplicate { slug: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlugRename {
    pub original: String,
    pub resolved: String,
}

/// A collision whose titles are nearly identical but whose prices are not.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NearDuplicate {
    pub existing_slug: String,
    pub resolved_slug: String,
    pub existing_title: String,
    pub incoming_title: String,
    pub existing_price: f64,
    pub incoming_price: f64,
    pub title_similarity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedListing {
    pub slug: String,
    pub title: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImportReport {
    pub inserted: usize,
    pub collided_and_renamed: usize,
    pub true_duplicates_skipped: usize,
    pub failed: usize,
    pub write_conflicts: usize,
    pub categories_created: usize,
    pub dry_run: bool,
    pub renames: Vec<SlugRename>,
    pub review: Vec<NearDuplicate>,
    pub failures: Vec<FailedListing>,
}

#[derive(Debug, Clone)]
pub struct PlannedProduct {
    pub category_slug: String,
    pub product: Product,
}

/// Rows to write, computed without touching the store.
#[derive(Debug, Clone)]
pub struct ImportPlan {
    pub policy: ImportPolicy,
    pub new_categories: Vec<Category>,
    pub products: Vec<PlannedProduct>,
    pub report: ImportReport,
}

impl ImportPlan {
    /// Apply the plan to an in-memory snapshot as the store would.
    pub fn fold_into(&self, snapshot: &mut CatalogSnapshot) {
        if self.policy == ImportPolicy::ReplaceAll {
            snapshot.products.clear();
            snapshot.categories.clear();
        }
        for category in &self.new_categories {
            snapshot
                .categories
                .entry(category.slug.clone())
                .or_insert_with(|| category.id.clone());
        }
        for planned in &self.products {
            let product = &planned.product;
            snapshot
                .products
                .entry(product.slug.clone())
                .or_insert_with(|| CatalogProduct {
                    slug: product.slug.clone(),
                    title: product.title.clone(),
                    price: product.price,
                });
        }
    }
}

pub struct ReconcilingImporter<'a> {
    taxonomy: &'a CategoryTaxonomy,
    config: ImportConfig,
}

impl<'a> ReconcilingImporter<'a> {
    pub fn new(taxonomy: &'a CategoryTaxonomy, config: ImportConfig) -> Self {
        Self { taxonomy, config }
    }

    /// Resolve a candidate slug against the catalog and the slugs already
    /// assigned earlier in the same batch.
    ///
    /// Candidates are tried in order `slug`, `base-1`, `base-2`, ...; the first
    /// free one is used, and a taken one holding a matching product makes the
    /// listing a true duplicate.
    pub fn resolve_slug(
        &self,
        listing: &RawListing,
        snapshot: &CatalogSnapshot,
        assigned: &HashMap<String, CatalogProduct>,
    ) -> SlugResolution {
        let lookup = |slug: &str| snapshot.products.get(slug).or_else(|| assigned.get(slug));
        let rule = &self.config.duplicates;

        match lookup(&listing.slug) {
            None => {
                return SlugResolution::Fresh {
                    slug: listing.slug.clone(),
                }
            }
            Some(existing) if rule.matches(&listing.title, listing.price, existing) => {
                return SlugResolution::TrueDuplicate {
                    slug: listing.slug.clone(),
                }
            }
            Some(_) => {}
        }

        let base = truncate_chars(&listing.slug, self.config.suffix_base_chars);
        let base = base.trim_end_matches('-');
        let mut n = 1u32;
        loop {
            let candidate = format!("{base}-{n}");
            match lookup(&candidate) {
                None => {
                    return SlugResolution::Renamed {
                        original: listing.slug.clone(),
                        resolved: candidate,
                    }
                }
                Some(existing) if rule.matches(&listing.title, listing.price, existing) => {
                    return SlugResolution::TrueDuplicate { slug: candidate }
                }
                Some(_) => n += 1,
            }
        }
    }

    pub fn plan(&self, batch: &[RawListing], snapshot: &CatalogSnapshot) -> ImportPlan {
        let empty = CatalogSnapshot::default();
        let snapshot = match self.config.policy {
            ImportPolicy::Append => snapshot,
            ImportPolicy::ReplaceAll => &empty,
        };

        let now = Utc::now();
        let mut report = ImportReport::default();
        let mut assigned: HashMap<String, CatalogProduct> = HashMap::new();
        let mut category_ids: HashMap<String, String> = snapshot.categories.clone();
        let mut new_categories = Vec::new();
        let mut products = Vec::new();

        for listing in batch {
            let listing = listing.clone().normalized();
            if let Err(defect) = listing.validate() {
                report.failed += 1;
                report.failures.push(FailedListing {
                    slug: listing.slug.clone(),
                    title: listing.title.clone(),
                    reason: defect.to_string(),
                });
                continue;
            }

            let slug = match self.resolve_slug(&listing, snapshot, &assigned) {
                SlugResolution::TrueDuplicate { slug } => {
                    debug!(%slug, "skipping true duplicate");
                    report.true_duplicates_skipped += 1;
                    continue;
                }
                SlugResolution::Fresh { slug } => slug,
                SlugResolution::Renamed { original, resolved } => {
                    debug!(%original, %resolved, "slug collision renamed");
                    if let Some(item) = self.near_duplicate(&listing, &resolved, snapshot, &assigned) {
                        report.review.push(item);
                    }
                    report.collided_and_renamed += 1;
                    report.renames.push(SlugRename {
                        original,
                        resolved: resolved.clone(),
                    });
                    resolved
                }
            };

            let category = self.taxonomy.resolve(&listing.category_hint, &listing.title);
            let category_id = match category_ids.get(&category.slug) {
                Some(id) => id.clone(),
                None => {
                    let id = new_record_id();
                    new_categories.push(Category {
                        id: id.clone(),
                        name: category.name.clone(),
                        slug: category.slug.clone(),
                        description: category.description.clone(),
                        image: None,
                        created_at: now,
                        updated_at: now,
                    });
                    category_ids.insert(category.slug.clone(), id.clone());
                    id
                }
            };

            assigned.insert(
                slug.clone(),
                CatalogProduct {
                    slug: slug.clone(),
                    title: listing.title.clone(),
                    price: listing.price,
                },
            );
            products.push(PlannedProduct {
                category_slug: category.slug.clone(),
                product: product_row(listing, slug, category_id, now),
            });
        }

        report.categories_created = new_categories.len();
        report.inserted = products.len();
        ImportPlan {
            policy: self.config.policy,
            new_categories,
            products,
            report,
        }
    }

    /// Plan against the current catalog and write the plan in one transaction.
    pub async fn import(
        &self,
        batch: &[RawListing],
        store: &dyn CatalogStore,
    ) -> Result<ImportReport, StoreError> {
        let snapshot = store.snapshot().await?;
        let plan = self.plan(batch, &snapshot);
        let outcome = store.apply(&plan).await?;

        let mut report = plan.report;
        report.inserted = outcome.products_inserted;
        report.write_conflicts = outcome.products_skipped;
        report.categories_created = outcome.categories_inserted;
        info!(
            inserted = report.inserted,
            renamed = report.collided_and_renamed,
            duplicates = report.true_duplicates_skipped,
            failed = report.failed,
            conflicts = report.write_conflicts,
            "import committed"
        );
        Ok(report)
    }

    /// Same classification as `import`, without writing.
    ///
    /// `projected` stands in for the catalog: the planned rows are folded into
    /// it so the next batch of a multi-source run sees them.
    pub fn dry_run(&self, batch: &[RawListing], projected: &mut CatalogSnapshot) -> ImportReport {
        let plan = self.plan(batch, projected);
        plan.fold_into(projected);
        let mut report = plan.report;
        report.dry_run = true;
        report
    }

    fn near_duplicate(
        &self,
        listing: &RawListing,
        resolved: &str,
        snapshot: &CatalogSnapshot,
        assigned: &HashMap<String, CatalogProduct>,
    ) -> Option<NearDuplicate> {
        let existing = snapshot
            .products
            .get(&listing.slug)
            .or_else(|| assigned.get(&listing.slug))?;
        let score = jaro_winkler(&listing.title.to_lowercase(), &existing.title.to_lowercase());
        (score >= self.config.review_threshold).then(|| NearDuplicate {
            existing_slug: existing.slug.clone(),
            resolved_slug: resolved.to_string(),
            existing_title: existing.title.clone(),
            incoming_title: listing.title.clone(),
            existing_price: existing.price,
            incoming_price: listing.price,
            title_similarity: score,
        })
    }
}

fn product_row(
    listing: RawListing,
    slug: String,
    category_id: String,
    now: chrono::DateTime<Utc>,
) -> Product {
    let non_empty = |s: String| if s.trim().is_empty() { None } else { Some(s) };
    Product {
        id: new_record_id(),
        title: listing.title,
        slug,
        description: listing.description,
        price: listing.price,
        original_price: listing.original_price,
        discount_percentage: listing.discount_percentage,
        rating: listing.rating,
        reviews_count: i32::try_from(listing.reviews_count).unwrap_or(i32::MAX),
        items_left: i32::try_from(listing.items_left).unwrap_or(i32::MAX),
        image: listing.image,
        images: listing.images,
        tags: listing.tags,
        is_featured: listing.is_featured,
        is_new: listing.is_new,
        category_id,
        source: non_empty(listing.source),
        source_url: non_empty(listing.source_url),
        created_at: now,
        updated_at: now,
    }
}

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use shelf_core::{CatalogProduct, Category, Product};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use thiserror::Error;
use tracing::{info, warn};

use crate::importer::{ImportPlan, ImportPolicy};

/// Rows per bulk INSERT statement.
pub const INSERT_CHUNK_ROWS: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The store could not be reached; the open transaction is rolled back.
    #[error("catalog store unreachable: {0}")]
    ConnectionFailure(String),
    #[error("catalog query failed: {0}")]
    Query(String),
}

impl StoreError {
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, Self::ConnectionFailure(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Self::ConnectionFailure(err.to_string()),
            other => Self::Query(other.to_string()),
        }
    }
}

/// Existing catalog state relevant to reconciliation.
#[derive(Debug, Clone, Default)]
pub struct CatalogSnapshot {
    pub products: HashMap<String, CatalogProduct>,
    /// Category slug to id.
    pub categories: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub categories_inserted: usize,
    pub products_inserted: usize,
    /// Rows dropped by insert-or-skip on a slug already taken by another writer.
    pub products_skipped: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcelessProduct {
    pub id: String,
    pub image: String,
    pub images: Vec<String>,
}

#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn snapshot(&self) -> Result<CatalogSnapshot, StoreError>;

    /// Write a plan in a single transaction: optional clear, categories, then
    /// products, each with insert-or-skip on slug.
    async fn apply(&self, plan: &ImportPlan) -> Result<ApplyOutcome, StoreError>;

    async fn product_slugs(&self) -> Result<HashSet<String>, StoreError>;

    /// Product count per source; null or empty sources are grouped as `unknown`.
    async fn source_distribution(&self) -> Result<BTreeMap<String, u64>, StoreError>;

    async fn products_missing_source(&self) -> Result<Vec<SourcelessProduct>, StoreError>;

    /// Returns the number of rows updated.
    async fn set_product_sources(&self, updates: &[(String, String)]) -> Result<u64, StoreError>;
}

pub struct PgCatalogStore {
    pool: PgPool,
}

impl PgCatalogStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| match e {
                sqlx::migrate::MigrateError::Execute(inner) => StoreError::from(inner),
                other => StoreError::Query(other.to_string()),
            })
    }
}

fn category_insert(rows: &[Category]) -> QueryBuilder<'_, Postgres> {
    let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
        r#"INSERT INTO "Category" (id, name, slug, description, image, "createdAt", "updatedAt") "#,
    );
    qb.push_values(rows, |mut b, c| {
        b.push_bind(&c.id)
            .push_bind(&c.name)
            .push_bind(&c.slug)
            .push_bind(&c.description)
            .push_bind(&c.image)
            .push_bind(c.created_at)
            .push_bind(c.updated_at);
    });
    qb.push(" ON CONFLICT (slug) DO NOTHING");
    qb
}

fn product_insert<'a>(
    rows: &'a [(&'a Product, &'a str)],
) -> QueryBuilder<'a, Postgres> {
    let mut qb: QueryBuilder<'a, Postgres> = QueryBuilder::new(
        r#"INSERT INTO "Product" (id, title, slug, description, price, "originalPrice", "discountPercentage", rating, "reviewsCount", "itemsLeft", image, images, tags, "isFeatured", "isNew", "categoryId", source, "sourceUrl", "createdAt", "updatedAt") "#,
    );
    qb.push_values(rows, |mut b, (p, category_id)| {
        b.push_bind(&p.id)
            .push_bind(&p.title)
            .push_bind(&p.slug)
            .push_bind(&p.description)
            .push_bind(p.price)
            .push_bind(p.original_price)
            .push_bind(p.discount_percentage)
            .push_bind(p.rating)
            .push_bind(p.reviews_count)
            .push_bind(p.items_left)
            .push_bind(&p.image)
            .push_bind(&p.images)
            .push_bind(&p.tags)
            .push_bind(p.is_featured)
            .push_bind(p.is_new)
            .push_bind(*category_id)
            .push_bind(&p.source)
            .push_bind(&p.source_url)
            .push_bind(p.created_at)
            .push_bind(p.updated_at);
    });
    qb.push(" ON CONFLICT (slug) DO NOTHING");
    qb
}

#[async_trait]
impl CatalogStore for PgCatalogStore {
    async fn snapshot(&self) -> Result<CatalogSnapshot, StoreError> {
        let product_rows = sqlx::query(r#"SELECT slug, title, price FROM "Product""#)
            .persistent(false)
            .fetch_all(&self.pool)
            .await?;
        let mut products = HashMap::with_capacity(product_rows.len());
        for row in product_rows {
            let slug: String = row.try_get("slug")?;
            products.insert(
                slug.clone(),
                CatalogProduct {
                    slug,
                    title: row.try_get("title")?,
                    price: row.try_get("price")?,
                },
            );
        }

        let category_rows = sqlx::query(r#"SELECT id, slug FROM "Category""#)
            .persistent(false)
            .fetch_all(&self.pool)
            .await?;
        let mut categories: HashMap<String, String> = HashMap::with_capacity(category_rows.len());
        for row in category_rows {
            categories.insert(row.try_get("slug")?, row.try_get("id")?);
        }
        Ok(CatalogSnapshot {
            products,
            categories,
        })
    }

    async fn apply(&self, plan: &ImportPlan) -> Result<ApplyOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut outcome = ApplyOutcome::default();

        if plan.policy == ImportPolicy::ReplaceAll {
            let products = sqlx::query(r#"DELETE FROM "Product""#)
                .persistent(false)
                .execute(&mut *tx)
                .await?;
            let categories = sqlx::query(r#"DELETE FROM "Category""#)
                .persistent(false)
                .execute(&mut *tx)
                .await?;
            info!(
                products = products.rows_affected(),
                categories = categories.rows_affected(),
                "cleared catalog before import"
            );
        }

        for chunk in plan.new_categories.chunks(INSERT_CHUNK_ROWS) {
            let res = category_insert(chunk)
                .build()
                .persistent(false)
                .execute(&mut *tx)
                .await?;
            outcome.categories_inserted += res.rows_affected() as usize;
        }

        // Another writer may have created a category first; use whatever id won.
        let wanted: Vec<String> = plan
            .products
            .iter()
            .map(|p| p.category_slug.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let mut category_ids: HashMap<String, String> = HashMap::new();
        if !wanted.is_empty() {
            let rows = sqlx::query(r#"SELECT id, slug FROM "Category" WHERE slug = ANY($1)"#)
                .bind(&wanted)
                .persistent(false)
                .fetch_all(&mut *tx)
                .await?;
            for row in rows {
                category_ids.insert(row.try_get("slug")?, row.try_get("id")?);
            }
        }

        let mut rows = Vec::with_capacity(plan.products.len());
        for planned in &plan.products {
            let Some(category_id) = category_ids.get(&planned.category_slug) else {
                return Err(StoreError::Query(format!(
                    "category {} missing after insert",
                    planned.category_slug
                )));
            };
            rows.push((&planned.product, category_id.as_str()));
        }

        for chunk in rows.chunks(INSERT_CHUNK_ROWS) {
            let res = product_insert(chunk)
                .build()
                .persistent(false)
                .execute(&mut *tx)
                .await?;
            let inserted = res.rows_affected() as usize;
            outcome.products_inserted += inserted;
            outcome.products_skipped += chunk.len() - inserted;
        }

        tx.commit().await?;
        if outcome.products_skipped > 0 {
            warn!(skipped = outcome.products_skipped, "slug conflicts skipped at write time");
        }
        Ok(outcome)
    }

    async fn product_slugs(&self) -> Result<HashSet<String>, StoreError> {
        let slugs: Vec<String> = sqlx::query_scalar(r#"SELECT slug FROM "Product""#)
            .persistent(false)
            .fetch_all(&self.pool)
            .await?;
        Ok(slugs.into_iter().collect())
    }

    async fn source_distribution(&self) -> Result<BTreeMap<String, u64>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT COALESCE(NULLIF(source, ''), 'unknown') AS source, COUNT(*) AS n
              FROM "Product"
             GROUP BY 1
            "#,
        )
        .persistent(false)
        .fetch_all(&self.pool)
        .await?;
        let mut out: BTreeMap<String, u64> = BTreeMap::new();
        for row in rows {
            let n: i64 = row.try_get("n")?;
            *out.entry(row.try_get("source")?).or_insert(0) += n.max(0) as u64;
        }
        Ok(out)
    }

    async fn products_missing_source(&self) -> Result<Vec<SourcelessProduct>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, image, images
              FROM "Product"
             WHERE source IS NULL OR source = ''
             ORDER BY id
            "#,
        )
        .persistent(false)
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(SourcelessProduct {
                id: row.try_get("id")?,
                image: row.try_get("image")?,
                images: row.try_get("images")?,
            });
        }
        Ok(out)
    }

    async fn set_product_sources(&self, updates: &[(String, String)]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut updated = 0;
        for (id, source) in updates {
            let res = sqlx::query(r#"UPDATE "Product" SET source = $1, "updatedAt" = NOW() WHERE id = $2"#)
                .bind(source)
                .bind(id)
                .persistent(false)
                .execute(&mut *tx)
                .await?;
            updated += res.rows_affected();
        }
        tx.commit().await?;
        Ok(updated)
    }
}

/// Catalog held in memory. Used for offline runs and tests; applies plans
/// with the same insert-or-skip semantics as the Postgres store.
#[derive(Default)]
pub struct MemoryCatalogStore {
    state: Mutex<MemoryCatalog>,
    /// Slugs that a concurrent writer claims between snapshot and apply.
    racing_slugs: Mutex<Vec<String>>,
    offline: Mutex<bool>,
}

#[derive(Default, Clone)]
struct MemoryCatalog {
    categories: Vec<Category>,
    products: Vec<Product>,
}

impl MemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn products(&self) -> Vec<Product> {
        self.lock_state().products.clone()
    }

    pub fn categories(&self) -> Vec<Category> {
        self.lock_state().categories.clone()
    }

    /// Insert a product directly, as an earlier import or another writer would.
    pub fn seed_product(&self, product: Product) {
        self.lock_state().products.push(product);
    }

    pub fn seed_category(&self, category: Category) {
        self.lock_state().categories.push(category);
    }

    /// Make the next `apply` find these slugs already taken.
    pub fn race_on(&self, slugs: &[&str]) {
        if let Ok(mut racing) = self.racing_slugs.lock() {
            racing.extend(slugs.iter().map(|s| s.to_string()));
        }
    }

    /// Every later call fails with a connection failure.
    pub fn go_offline(&self) {
        if let Ok(mut offline) = self.offline.lock() {
            *offline = true;
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, MemoryCatalog> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_online(&self) -> Result<(), StoreError> {
        match self.offline.lock() {
            Ok(offline) if *offline => Err(StoreError::ConnectionFailure(
                "connection refused".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalogStore {
    async fn snapshot(&self) -> Result<CatalogSnapshot, StoreError> {
        self.check_online()?;
        let state = self.lock_state();
        Ok(CatalogSnapshot {
            products: state
                .products
                .iter()
                .map(|p| {
                    (
                        p.slug.clone(),
                        CatalogProduct {
                            slug: p.slug.clone(),
                            title: p.title.clone(),
                            price: p.price,
                        },
                    )
                })
                .collect(),
            categories: state
                .categories
                .iter()
                .map(|c| (c.slug.clone(), c.id.clone()))
                .collect(),
        })
    }

    async fn apply(&self, plan: &ImportPlan) -> Result<ApplyOutcome, StoreError> {
        self.check_online()?;
        let racing: Vec<String> = match self.racing_slugs.lock() {
            Ok(mut racing) => racing.drain(..).collect(),
            Err(_) => Vec::new(),
        };

        let mut guard = self.lock_state();
        // Work on a copy so a failure leaves the catalog untouched.
        let mut next = guard.clone();
        if plan.policy == ImportPolicy::ReplaceAll {
            next.products.clear();
            next.categories.clear();
        }
        let mut taken: HashSet<String> = next.products.iter().map(|p| p.slug.clone()).collect();
        taken.extend(racing);

        let mut outcome = ApplyOutcome::default();
        for category in &plan.new_categories {
            if next.categories.iter().all(|c| c.slug != category.slug) {
                next.categories.push(category.clone());
                outcome.categories_inserted += 1;
            }
        }
        for planned in &plan.products {
            let Some(category) = next.categories.iter().find(|c| c.slug == planned.category_slug) else {
                return Err(StoreError::Query(format!(
                    "category {} missing after insert",
                    planned.category_slug
                )));
            };
            if !taken.insert(planned.product.slug.clone()) {
                outcome.products_skipped += 1;
                continue;
            }
            let mut product = planned.product.clone();
            product.category_id = category.id.clone();
            next.products.push(product);
            outcome.products_inserted += 1;
        }
        *guard = next;
        Ok(outcome)
    }

    async fn product_slugs(&self) -> Result<HashSet<String>, StoreError> {
        self.check_online()?;
        Ok(self.lock_state().products.iter().map(|p| p.slug.clone()).collect())
    }

    async fn source_distribution(&self) -> Result<BTreeMap<String, u64>, StoreError> {
        self.check_online()?;
        let mut out = BTreeMap::new();
        for p in &self.lock_state().products {
            let key = match p.source.as_deref() {
                Some(s) if !s.is_empty() => s.to_string(),
                _ => "unknown".to_string(),
            };
            *out.entry(key).or_insert(0) += 1;
        }
        Ok(out)
    }

    async fn products_missing_source(&self) -> Result<Vec<SourcelessProduct>, StoreError> {
        self.check_online()?;
        Ok(self
            .lock_state()
            .products
            .iter()
            .filter(|p| p.source.as_deref().map_or(true, str::is_empty))
            .map(|p| SourcelessProduct {
                id: p.id.clone(),
                image: p.image.clone(),
                images: p.images.clone(),
            })
            .collect())
    }

    async fn set_product_sources(&self, updates: &[(String, String)]) -> Result<u64, StoreError> {
        self.check_online()?;
        let mut state = self.lock_state();
        let mut updated = 0;
        for (id, source) in updates {
            if let Some(p) = state.products.iter_mut().find(|p| &p.id == id) {
                p.source = Some(source.clone());
                updated += 1;
            }
        }
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_classify_as_connection_failures() {
        assert!(StoreError::from(sqlx::Error::PoolTimedOut).is_connection_failure());
        assert!(StoreError::from(sqlx::Error::PoolClosed).is_connection_failure());
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(StoreError::from(sqlx::Error::Io(io)).is_connection_failure());
        assert!(!StoreError::from(sqlx::Error::RowNotFound).is_connection_failure());
    }

    #[test]
    fn bulk_product_insert_skips_on_slug_conflict() {
        let now = chrono::Utc::now();
        let product = Product {
            id: "p1".into(),
            title: "Gold Ring".into(),
            slug: "gold-ring".into(),
            description: String::new(),
            price: 999.0,
            original_price: None,
            discount_percentage: None,
            rating: 4.5,
            reviews_count: 0,
            items_left: 30,
            image: "a.jpg".into(),
            images: vec!["a.jpg".into()],
            tags: vec!["rings".into()],
            is_featured: false,
            is_new: false,
            category_id: String::new(),
            source: Some("Peora".into()),
            source_url: None,
            created_at: now,
            updated_at: now,
        };
        let rows = vec![(&product, "cat-1"), (&product, "cat-1")];
        let sql = product_insert(&rows).into_sql();
        assert!(sql.starts_with(r#"INSERT INTO "Product" (id, title, slug"#));
        assert!(sql.ends_with("ON CONFLICT (slug) DO NOTHING"));
        assert!(sql.contains("$40"));
        assert!(!sql.contains("$41"));
    }

    #[test]
    fn category_insert_is_insert_or_skip() {
        let now = chrono::Utc::now();
        let rows = vec![Category {
            id: "c1".into(),
            name: "Rings".into(),
            slug: "rings".into(),
            description: None,
            image: None,
            created_at: now,
            updated_at: now,
        }];
        let sql = category_insert(&rows).into_sql();
        assert!(sql.contains(r#""createdAt", "updatedAt") VALUES ($1, $2, $3, $4, $5, $6, $7)"#));
        assert!(sql.ends_with("ON CONFLICT (slug) DO NOTHING"));
    }
}

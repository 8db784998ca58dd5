//! Source adapter contract + storefront adapter implementations.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scraper::{ElementRef, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use shelf_core::RawListing;
use shelf_storage::{FetchError, HttpFetcher};
use thiserror::Error;

mod search_browse;
mod shopify_json;

pub use search_browse::SearchBrowseAdapter;
pub use shopify_json::ShopifyJsonAdapter;

pub const CRATE_NAME: &str = "shelf-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    /// Ranked search results rendered as HTML, one fixed-size window per page.
    SearchBrowse,
    /// Shopify storefront `products.json` API.
    ShopifyJson,
}

/// One category of one source, as configured in `sources.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryTarget {
    pub name: String,
    pub slug: String,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterSettings {
    pub source_id: String,
    pub display_name: String,
    pub base_url: String,
    pub default_stock: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedPage {
    pub url: String,
    pub content_type: String,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

impl LoadedPage {
    pub fn extension(&self) -> &'static str {
        if self.content_type.contains("json") {
            "json"
        } else if self.content_type.contains("html") {
            "html"
        } else {
            "bin"
        }
    }
}

/// Produces the body of a page URL. The HTTP fetcher is the default; a
/// browser-driven loader can stand in for storefronts that need rendering.
#[async_trait]
pub trait PageLoader: Send + Sync {
    async fn load(&self, source_id: &str, url: &str) -> Result<LoadedPage, FetchError>;
}

#[async_trait]
impl PageLoader for HttpFetcher {
    async fn load(&self, source_id: &str, url: &str) -> Result<LoadedPage, FetchError> {
        let fetched_at = Utc::now();
        let page = self.get(source_id, url).await?;
        let content_type = page.content_type.unwrap_or_else(|| {
            if url.contains(".json") {
                "application/json".to_string()
            } else {
                "text/html".to_string()
            }
        });
        Ok(LoadedPage {
            url: page.url,
            content_type,
            body: page.body,
            fetched_at,
        })
    }
}

/// A single listing that could not be extracted. Non-fatal on its own.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("listing #{index}: missing {field}")]
    MissingField { index: usize, field: &'static str },
    #[error("listing #{index}: invalid {field} {value:?}")]
    InvalidField {
        index: usize,
        field: &'static str,
        value: String,
    },
    #[error("listing #{index}: {reason}")]
    Rejected { index: usize, reason: String },
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("page {page}: result container not found")]
    MissingContainer { page: u32 },
    #[error("page {page}: none of {} listings could be parsed", failures.len())]
    NoParseableListings { page: u32, failures: Vec<ParseError> },
    #[error("page {page}: undecodable body: {message}")]
    Decode { page: u32, message: String },
    #[error("invalid selector {0}")]
    Selector(String),
}

/// Result of one successful page fetch.
#[derive(Debug, Clone)]
pub struct PageFetch {
    pub url: String,
    pub listings: Vec<RawListing>,
    pub parse_failures: Vec<ParseError>,
    /// `false` once the source reports no further results.
    pub has_more: bool,
    pub raw: Option<LoadedPage>,
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;

    /// Fetch and normalize one page. Never touches checkpoint or dedup state.
    async fn fetch_page(&self, target: &CategoryTarget, page: u32) -> Result<PageFetch, AdapterError>;
}

pub fn build_adapter(
    kind: AdapterKind,
    settings: AdapterSettings,
    loader: Arc<dyn PageLoader>,
) -> Box<dyn SourceAdapter> {
    match kind {
        AdapterKind::SearchBrowse => Box::new(SearchBrowseAdapter::new(settings, loader)),
        AdapterKind::ShopifyJson => Box::new(ShopifyJsonAdapter::new(settings, loader)),
    }
}

/// Split per-listing results into kept listings and failures, escalating a
/// page where every listing failed.
pub(crate) fn partition_listings(
    page: u32,
    results: Vec<Result<RawListing, ParseError>>,
) -> Result<(Vec<RawListing>, Vec<ParseError>), AdapterError> {
    let total = results.len();
    let mut listings = Vec::with_capacity(total);
    let mut failures = Vec::new();
    for result in results {
        match result {
            Ok(listing) => listings.push(listing),
            Err(err) => {
                tracing::debug!(page, error = %err, "dropping unparseable listing");
                failures.push(err);
            }
        }
    }
    if total > 0 && listings.is_empty() {
        return Err(AdapterError::NoParseableListings { page, failures });
    }
    Ok((listings, failures))
}

/// Normalize and validate a freshly extracted listing.
pub(crate) fn finish_listing(index: usize, listing: RawListing) -> Result<RawListing, ParseError> {
    let listing = listing.normalized();
    listing.validate().map_err(|defect| ParseError::Rejected {
        index,
        reason: defect.to_string(),
    })?;
    Ok(listing)
}

pub(crate) fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Selector(format!("{css}: {e}")))
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

pub(crate) fn select_first_text(el: ElementRef<'_>, sel: &Selector) -> Option<String> {
    el.select(sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

pub(crate) fn select_first_attr(el: ElementRef<'_>, sel: &Selector, attr: &str) -> Option<String> {
    el.select(sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string()))
}

pub(crate) fn extract_numbers(text: &str) -> Vec<f64> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut seen_dot = false;
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            current.push(ch);
            continue;
        }
        if ch == '.' && !seen_dot && !current.is_empty() {
            current.push(ch);
            seen_dot = true;
            continue;
        }
        if !current.is_empty() {
            if let Ok(v) = current.trim_end_matches('.').parse::<f64>() {
                out.push(v);
            }
            current.clear();
            seen_dot = false;
        }
    }
    if !current.is_empty() {
        if let Ok(v) = current.trim_end_matches('.').parse::<f64>() {
            out.push(v);
        }
    }
    out
}

/// Keep only ASCII digits, e.g. `"1,299."` -> `1299`.
pub(crate) fn digits_only(text: &str) -> Option<f64> {
    let digits: String = text.chars().filter(|c| c.is_ascii_digit()).collect();
    digits.parse::<f64>().ok()
}

pub(crate) fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str()
}

/// Numbers arrive either as JSON numbers or as decimal strings.
pub(crate) fn json_number(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;
    use std::path::{Path, PathBuf};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct GoldenListing {
        title: String,
        slug: String,
        price: f64,
        original_price: Option<f64>,
        discount_percentage: Option<f64>,
        rating: f64,
        reviews_count: u32,
        category_hint: String,
        images: Vec<String>,
        tags: Vec<String>,
        is_new: bool,
    }

    struct FixtureLoader {
        pages: HashMap<String, PathBuf>,
    }

    #[async_trait]
    impl PageLoader for FixtureLoader {
        async fn load(&self, _source_id: &str, url: &str) -> Result<LoadedPage, FetchError> {
            let path = self
                .pages
                .get(url)
                .ok_or_else(|| FetchError::Unavailable(format!("no fixture for {url}")))?;
            let body = fs::read(path).map_err(|e| FetchError::Unavailable(e.to_string()))?;
            Ok(LoadedPage {
                url: url.to_string(),
                content_type: "text/html".to_string(),
                body,
                fetched_at: Utc::now(),
            })
        }
    }

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn fixture(source: &str, name: &str) -> PathBuf {
        workspace_root().join("fixtures").join(source).join(name)
    }

    fn to_golden(listings: &[RawListing]) -> Vec<GoldenListing> {
        listings
            .iter()
            .map(|l| GoldenListing {
                title: l.title.clone(),
                slug: l.slug.clone(),
                price: l.price,
                original_price: l.original_price,
                discount_percentage: l.discount_percentage,
                rating: l.rating,
                reviews_count: l.reviews_count,
                category_hint: l.category_hint.clone(),
                images: l.images.clone(),
                tags: l.tags.clone(),
                is_new: l.is_new,
            })
            .collect()
    }

    fn read_snapshot(path: &Path) -> Vec<GoldenListing> {
        let text = fs::read_to_string(path).expect("read snapshot");
        serde_json::from_str(&text).expect("parse snapshot")
    }

    fn amazon_settings() -> AdapterSettings {
        AdapterSettings {
            source_id: "amazon".into(),
            display_name: "Amazon.in".into(),
            base_url: "https://www.amazon.in".into(),
            default_stock: 30,
        }
    }

    fn peora_settings() -> AdapterSettings {
        AdapterSettings {
            source_id: "peora".into(),
            display_name: "Peora".into(),
            base_url: "https://www.peorajewellery.com".into(),
            default_stock: 30,
        }
    }

    fn rings_target() -> CategoryTarget {
        CategoryTarget {
            name: "Rings".into(),
            slug: "rings".into(),
            url: "https://www.amazon.in/s?k=rings+for+women&i=jewelry".into(),
        }
    }

    fn all_products_target() -> CategoryTarget {
        CategoryTarget {
            name: "All Products".into(),
            slug: "all".into(),
            url: String::new(),
        }
    }

    #[tokio::test]
    async fn golden_json_snapshot_test_search_browse_page() {
        let target = rings_target();
        let url = format!("{}&page=1", target.url);
        let loader = FixtureLoader {
            pages: HashMap::from([(url.clone(), fixture("amazon", "search_page_1.html"))]),
        };
        let adapter = SearchBrowseAdapter::new(amazon_settings(), Arc::new(loader));

        let page = adapter.fetch_page(&target, 1).await.expect("page 1");
        assert!(page.has_more);
        assert_eq!(page.url, url);
        assert_eq!(page.parse_failures.len(), 1);
        assert_eq!(
            to_golden(&page.listings),
            read_snapshot(&fixture("amazon", "snapshot.json"))
        );
        let first = &page.listings[0];
        assert_eq!(first.source, "Amazon.in");
        assert!(first.source_url.starts_with("https://www.amazon.in/"));
        assert_eq!(first.items_left, 30);
    }

    #[tokio::test]
    async fn golden_json_snapshot_test_shopify_products_page() {
        let target = all_products_target();
        let url = "https://www.peorajewellery.com/products.json?limit=250&page=1".to_string();
        let loader = FixtureLoader {
            pages: HashMap::from([(url.clone(), fixture("peora", "products_page_1.json"))]),
        };
        let adapter = ShopifyJsonAdapter::new(peora_settings(), Arc::new(loader));

        let page = adapter.fetch_page(&target, 1).await.expect("page 1");
        assert!(page.has_more);
        assert_eq!(page.parse_failures.len(), 1);
        assert_eq!(
            to_golden(&page.listings),
            read_snapshot(&fixture("peora", "snapshot.json"))
        );
    }

    #[tokio::test]
    async fn unreachable_page_surfaces_fetch_error() {
        let loader = FixtureLoader {
            pages: HashMap::new(),
        };
        let adapter = SearchBrowseAdapter::new(amazon_settings(), Arc::new(loader));
        let err = adapter.fetch_page(&rings_target(), 7).await.unwrap_err();
        assert!(matches!(err, AdapterError::Fetch(_)));
    }

    #[test]
    fn page_without_result_container_is_heuristic_exhaustion() {
        let adapter = SearchBrowseAdapter::new(
            amazon_settings(),
            Arc::new(FixtureLoader {
                pages: HashMap::new(),
            }),
        );
        let err = adapter
            .parse_page(&rings_target(), 3, b"<html><body><p>No results</p></body></html>")
            .unwrap_err();
        assert!(matches!(err, AdapterError::MissingContainer { page: 3 }));
    }

    #[test]
    fn page_where_every_listing_fails_escalates() {
        let adapter = SearchBrowseAdapter::new(
            amazon_settings(),
            Arc::new(FixtureLoader {
                pages: HashMap::new(),
            }),
        );
        let html = r#"<div data-component-type="s-search-result"><h2><a href="/x"><span>No price</span></a></h2></div>"#;
        let err = adapter.parse_page(&rings_target(), 2, html.as_bytes()).unwrap_err();
        match err {
            AdapterError::NoParseableListings { page, failures } => {
                assert_eq!(page, 2);
                assert_eq!(failures, vec![ParseError::MissingField { index: 0, field: "price" }]);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn empty_products_array_ends_pagination_authoritatively() {
        let adapter = ShopifyJsonAdapter::new(
            peora_settings(),
            Arc::new(FixtureLoader {
                pages: HashMap::new(),
            }),
        );
        let (listings, failures, has_more) = adapter
            .parse_page(&all_products_target(), 4, br#"{"products": []}"#)
            .expect("empty page");
        assert!(listings.is_empty());
        assert!(failures.is_empty());
        assert!(!has_more);
    }

    #[test]
    fn shopify_body_without_products_key_is_a_decode_error() {
        let adapter = ShopifyJsonAdapter::new(
            peora_settings(),
            Arc::new(FixtureLoader {
                pages: HashMap::new(),
            }),
        );
        let err = adapter
            .parse_page(&all_products_target(), 1, b"<html>rate limited</html>")
            .unwrap_err();
        assert!(matches!(err, AdapterError::Decode { page: 1, .. }));
    }

    #[test]
    fn number_extraction_handles_ratings_and_separators() {
        assert_eq!(extract_numbers("4.3 out of 5 stars"), vec![4.3, 5.0]);
        assert_eq!(digits_only("1,299."), Some(1299.0));
        assert_eq!(digits_only("(2,041)"), Some(2041.0));
        assert_eq!(digits_only("n/a"), None);
    }
}

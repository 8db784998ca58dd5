use std::sync::Arc;

use async_trait::async_trait;
use scraper::Html;
use serde_json::Value as JsonValue;
use shelf_core::{slugify, truncate_chars, RawListing, MAX_TAGS, MAX_TITLE_CHARS};

use crate::{
    finish_listing, json_number, json_str, partition_listings, AdapterError, AdapterSettings,
    CategoryTarget, PageFetch, PageLoader, ParseError, SourceAdapter,
};

const PAGE_LIMIT: u32 = 250;
const DESCRIPTION_CHARS: usize = 300;
const DEFAULT_PRODUCT_TYPE: &str = "jewelry";
const DEFAULT_RATING: f64 = 4.5;

/// Shopify storefront using the public `products.json` endpoint.
pub struct ShopifyJsonAdapter {
    settings: AdapterSettings,
    loader: Arc<dyn PageLoader>,
}

impl ShopifyJsonAdapter {
    pub fn new(settings: AdapterSettings, loader: Arc<dyn PageLoader>) -> Self {
        Self { settings, loader }
    }

    pub fn page_url(&self, page: u32) -> String {
        format!(
            "{}/products.json?limit={PAGE_LIMIT}&page={page}",
            self.settings.base_url.trim_end_matches('/')
        )
    }

    /// Returns the kept listings, per-listing failures and whether more pages
    /// may follow. An empty `products` array is the end of the catalog.
    pub fn parse_page(
        &self,
        _target: &CategoryTarget,
        page: u32,
        body: &[u8],
    ) -> Result<(Vec<RawListing>, Vec<ParseError>, bool), AdapterError> {
        let doc: JsonValue = serde_json::from_slice(body).map_err(|e| AdapterError::Decode {
            page,
            message: e.to_string(),
        })?;
        let products = doc
            .get("products")
            .and_then(JsonValue::as_array)
            .ok_or_else(|| AdapterError::Decode {
                page,
                message: "response has no products array".to_string(),
            })?;
        if products.is_empty() {
            return Ok((Vec::new(), Vec::new(), false));
        }
        let results = products
            .iter()
            .enumerate()
            .map(|(index, product)| self.parse_product(index, product))
            .collect();
        let (listings, failures) = partition_listings(page, results)?;
        Ok((listings, failures, true))
    }

    fn parse_product(&self, index: usize, product: &JsonValue) -> Result<RawListing, ParseError> {
        let title = json_str(product, &["title"])
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(ParseError::MissingField { index, field: "title" })?;
        let slug = json_str(product, &["handle"])
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| slugify(title));

        let product_type = json_str(product, &["product_type"])
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(DEFAULT_PRODUCT_TYPE);
        let category_hint = slugify(product_type);

        let variant = product
            .get("variants")
            .and_then(JsonValue::as_array)
            .and_then(|v| v.first())
            .ok_or(ParseError::MissingField { index, field: "variants" })?;
        let price_value = variant
            .get("price")
            .ok_or(ParseError::MissingField { index, field: "price" })?;
        let price = json_number(price_value).ok_or_else(|| ParseError::InvalidField {
            index,
            field: "price",
            value: price_value.to_string(),
        })?;
        let original_price = variant.get("compare_at_price").and_then(json_number);
        let items_left = variant
            .get("inventory_quantity")
            .and_then(JsonValue::as_i64)
            .filter(|q| *q > 0)
            .and_then(|q| u32::try_from(q).ok())
            .unwrap_or(self.settings.default_stock);

        let images: Vec<String> = product
            .get("images")
            .and_then(JsonValue::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(|img| json_str(img, &["src"]))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let description = json_str(product, &["body_html"])
            .map(strip_html)
            .filter(|d| !d.is_empty())
            .map(|d| truncate_chars(&d, DESCRIPTION_CHARS))
            .unwrap_or_else(|| {
                format!(
                    "Beautiful {} from {}.",
                    product_type.to_lowercase(),
                    self.settings.display_name
                )
            });

        let tags = parse_tags(product.get("tags"));
        let is_featured = tags.iter().any(|t| {
            let t = t.to_lowercase();
            t.contains("featured") || t.contains("bestseller")
        });
        let is_new = tags.iter().any(|t| {
            let t = t.to_lowercase();
            t == "new" || t == "new arrival"
        });

        let listing = RawListing {
            title: truncate_chars(title, MAX_TITLE_CHARS),
            source_url: format!(
                "{}/products/{slug}",
                self.settings.base_url.trim_end_matches('/')
            ),
            slug,
            description,
            price,
            original_price,
            discount_percentage: None,
            rating: DEFAULT_RATING,
            reviews_count: 0,
            items_left,
            image: images.first().cloned().unwrap_or_default(),
            images,
            tags,
            category_hint,
            is_featured,
            is_new,
            source: self.settings.display_name.clone(),
        };
        finish_listing(index, listing)
    }
}

/// Shopify serves tags either as an array or as one comma-separated string.
fn parse_tags(value: Option<&JsonValue>) -> Vec<String> {
    let raw: Vec<String> = match value {
        Some(JsonValue::Array(items)) => items
            .iter()
            .filter_map(JsonValue::as_str)
            .map(str::to_string)
            .collect(),
        Some(JsonValue::String(s)) => s.split(',').map(str::to_string).collect(),
        _ => Vec::new(),
    };
    raw.into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .take(MAX_TAGS)
        .collect()
}

/// Text content of a `body_html` fragment with entities decoded.
fn strip_html(html: &str) -> String {
    let fragment = Html::parse_fragment(html);
    let mut out = String::with_capacity(html.len());
    for node in fragment.root_element().descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node.ancestors().any(|a| {
            a.value()
                .as_element()
                .is_some_and(|e| matches!(e.name(), "script" | "style"))
        });
        if !hidden {
            out.push_str(text);
            out.push(' ');
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[async_trait]
impl SourceAdapter for ShopifyJsonAdapter {
    fn source_id(&self) -> &str {
        &self.settings.source_id
    }

    async fn fetch_page(&self, target: &CategoryTarget, page: u32) -> Result<PageFetch, AdapterError> {
        let url = self.page_url(page);
        let loaded = self.loader.load(&self.settings.source_id, &url).await?;
        let (listings, parse_failures, has_more) = self.parse_page(target, page, &loaded.body)?;
        tracing::info!(
            source = %self.settings.source_id,
            page,
            listings = listings.len(),
            dropped = parse_failures.len(),
            has_more,
            "parsed products.json page"
        );
        Ok(PageFetch {
            url,
            listings,
            parse_failures,
            has_more,
            raw: Some(loaded),
        })
    }
}

use std::sync::Arc;

use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};
use shelf_core::{slugify, RawListing};

use crate::{
    digits_only, extract_numbers, finish_listing, partition_listings, select_first_attr,
    select_first_text, selector, AdapterError, AdapterSettings, CategoryTarget,
    PageFetch, PageLoader, ParseError, SourceAdapter,
};

const DEFAULT_RATING: f64 = 4.0;

struct ResultSelectors {
    container: Selector,
    title: Selector,
    title_fallback: Selector,
    link: Selector,
    price: Selector,
    mrp: Selector,
    image: Selector,
    rating: Selector,
    reviews: Selector,
}

impl ResultSelectors {
    fn compile() -> Result<Self, AdapterError> {
        Ok(Self {
            container: selector("div[data-component-type='s-search-result']")?,
            title: selector("h2 a span")?,
            title_fallback: selector("h2 span")?,
            link: selector("h2 a")?,
            price: selector(".a-price-whole")?,
            mrp: selector(".a-text-price .a-offscreen")?,
            image: selector("img.s-image")?,
            rating: selector("span.a-icon-alt")?,
            reviews: selector("span.a-size-base.s-underline-text")?,
        })
    }
}

/// Search-results storefront: HTML pages, a fixed window of ranked results per
/// page, no reliable end-of-results marker.
pub struct SearchBrowseAdapter {
    settings: AdapterSettings,
    loader: Arc<dyn PageLoader>,
}

impl SearchBrowseAdapter {
    pub fn new(settings: AdapterSettings, loader: Arc<dyn PageLoader>) -> Self {
        Self { settings, loader }
    }

    pub fn page_url(&self, target: &CategoryTarget, page: u32) -> String {
        let sep = if target.url.contains('?') { '&' } else { '?' };
        format!("{}{sep}page={page}", target.url)
    }

    /// Extract every result on the page. A page without the result container is
    /// reported as `MissingContainer`; the caller decides whether that means the
    /// category is exhausted.
    pub fn parse_page(
        &self,
        target: &CategoryTarget,
        page: u32,
        body: &[u8],
    ) -> Result<(Vec<RawListing>, Vec<ParseError>), AdapterError> {
        let html = String::from_utf8_lossy(body);
        let doc = Html::parse_document(&html);
        let sel = ResultSelectors::compile()?;
        let results: Vec<_> = doc
            .select(&sel.container)
            .enumerate()
            .map(|(index, item)| self.parse_item(&sel, target, page, index, item))
            .collect();
        if results.is_empty() {
            return Err(AdapterError::MissingContainer { page });
        }
        partition_listings(page, results)
    }

    fn parse_item(
        &self,
        sel: &ResultSelectors,
        target: &CategoryTarget,
        page: u32,
        index: usize,
        item: ElementRef<'_>,
    ) -> Result<RawListing, ParseError> {
        let title = select_first_text(item, &sel.title)
            .or_else(|| select_first_text(item, &sel.title_fallback))
            .ok_or(ParseError::MissingField { index, field: "title" })?;

        let price_text = select_first_text(item, &sel.price)
            .ok_or(ParseError::MissingField { index, field: "price" })?;
        let price = digits_only(&price_text).ok_or_else(|| ParseError::InvalidField {
            index,
            field: "price",
            value: price_text.clone(),
        })?;

        let original_price = select_first_text(item, &sel.mrp)
            .and_then(|text| {
                let cleaned: String = text.chars().filter(|c| *c != ',').collect();
                extract_numbers(&cleaned).into_iter().next()
            });

        let rating = select_first_text(item, &sel.rating)
            .and_then(|text| extract_numbers(&text).into_iter().next())
            .unwrap_or(DEFAULT_RATING);
        let reviews_count = select_first_text(item, &sel.reviews)
            .and_then(|text| digits_only(&text))
            .map(|n| n as u32)
            .unwrap_or(0);

        let source_url = select_first_attr(item, &sel.link, "href")
            .map(|href| self.absolute_url(&href))
            .unwrap_or_default();
        let image = select_first_attr(item, &sel.image, "src").unwrap_or_default();

        let listing = RawListing {
            slug: slugify(&title),
            title,
            description: format!(
                "Elegant {} from {} collection.",
                target.name, self.settings.display_name
            ),
            price,
            original_price,
            discount_percentage: None,
            rating,
            reviews_count,
            items_left: self.settings.default_stock,
            images: if image.is_empty() { Vec::new() } else { vec![image.clone()] },
            image,
            tags: vec![target.slug.clone(), self.settings.source_id.clone(), "jewelry".to_string()],
            category_hint: target.slug.clone(),
            is_featured: false,
            is_new: page == 1,
            source: self.settings.display_name.clone(),
            source_url,
        };
        finish_listing(index, listing)
    }

    fn absolute_url(&self, href: &str) -> String {
        if href.starts_with('/') {
            format!("{}{href}", self.settings.base_url.trim_end_matches('/'))
        } else {
            href.to_string()
        }
    }
}

#[async_trait]
impl SourceAdapter for SearchBrowseAdapter {
    fn source_id(&self) -> &str {
        &self.settings.source_id
    }

    async fn fetch_page(&self, target: &CategoryTarget, page: u32) -> Result<PageFetch, AdapterError> {
        let url = self.page_url(target, page);
        let loaded = self.loader.load(&self.settings.source_id, &url).await?;
        let (listings, parse_failures) = self.parse_page(target, page, &loaded.body)?;
        tracing::info!(
            source = %self.settings.source_id,
            category = %target.slug,
            page,
            listings = listings.len(),
            dropped = parse_failures.len(),
            "parsed search results page"
        );
        Ok(PageFetch {
            url,
            listings,
            parse_failures,
            has_more: true,
            raw: Some(loaded),
        })
    }
}

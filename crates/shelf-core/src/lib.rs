//! Core domain model for storefront listings and the merged catalog.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "shelf-core";

pub const MAX_SLUG_CHARS: usize = 60;
pub const MAX_TITLE_CHARS: usize = 100;
pub const MAX_DESCRIPTION_CHARS: usize = 500;
pub const MAX_IMAGES: usize = 4;
pub const MAX_TAGS: usize = 5;

/// Normalized listing handed from source adapters to the acquisition loop.
///
/// The serialized form (camelCase JSON) is the intermediate dataset format, so
/// field names double as the on-disk contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawListing {
    pub title: String,
    pub slug: String,
    #[serde(default)]
    pub description: String,
    pub price: f64,
    #[serde(default)]
    pub original_price: Option<f64>,
    #[serde(default)]
    pub discount_percentage: Option<f64>,
    #[serde(default = "default_rating")]
    pub rating: f64,
    #[serde(default)]
    pub reviews_count: u32,
    #[serde(default)]
    pub items_left: u32,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(rename = "categorySlug", default)]
    pub category_hint: String,
    #[serde(default)]
    pub is_featured: bool,
    #[serde(default)]
    pub is_new: bool,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub source_url: String,
}

fn default_rating() -> f64 {
    4.5
}

/// Reason a listing cannot enter the pipeline.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ListingDefect {
    #[error("listing has no title")]
    MissingTitle,
    #[error("listing has no slug")]
    MissingSlug,
    #[error("listing price {0} is not a non-negative number")]
    InvalidPrice(f64),
}

impl RawListing {
    /// Apply the field limits and fallbacks every listing must satisfy before it
    /// is accumulated or imported.
    pub fn normalized(mut self) -> Self {
        self.title = truncate_chars(self.title.trim(), MAX_TITLE_CHARS);
        self.slug = truncate_chars(self.slug.trim(), MAX_SLUG_CHARS);
        self.description = truncate_chars(self.description.trim(), MAX_DESCRIPTION_CHARS);

        self.images.retain(|url| !url.trim().is_empty());
        if self.image.trim().is_empty() {
            if let Some(first) = self.images.first() {
                self.image = first.clone();
            } else if !self.slug.is_empty() {
                self.image = placeholder_image(&self.slug);
            }
        }
        self.images.truncate(MAX_IMAGES);
        if self.images.is_empty() && !self.image.is_empty() {
            self.images.push(self.image.clone());
        }

        self.tags.retain(|t| !t.trim().is_empty());
        self.tags.truncate(MAX_TAGS);
        if self.tags.is_empty() {
            let hint = slugify(&self.category_hint);
            if !hint.is_empty() && hint != "jewelry" {
                self.tags.push(hint);
            }
            self.tags.push("jewelry".to_string());
        }

        if self.discount_percentage.is_none() {
            self.discount_percentage = self
                .original_price
                .and_then(|original| discount_percentage(self.price, original));
        }
        self
    }

    pub fn validate(&self) -> Result<(), ListingDefect> {
        if self.title.trim().is_empty() {
            return Err(ListingDefect::MissingTitle);
        }
        if self.slug.trim().is_empty() {
            return Err(ListingDefect::MissingSlug);
        }
        if !self.price.is_finite() || self.price < 0.0 {
            return Err(ListingDefect::InvalidPrice(self.price));
        }
        Ok(())
    }
}

/// Catalog category row. Ids are opaque text keys; new rows get a v4 UUID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub id: String,
    pub name: String,
    pub slug: String,
    pub description: Option<String>,
    pub image: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Catalog product row. `category_id` always references an existing `Category`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub title: String,
    pub slug: String,
    pub description: String,
    pub price: f64,
    pub original_price: Option<f64>,
    pub discount_percentage: Option<f64>,
    pub rating: f64,
    pub reviews_count: i32,
    pub items_left: i32,
    pub image: String,
    pub images: Vec<String>,
    pub tags: Vec<String>,
    pub is_featured: bool,
    pub is_new: bool,
    pub category_id: String,
    pub source: Option<String>,
    pub source_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The slice of an existing catalog product needed for duplicate detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogProduct {
    pub slug: String,
    pub title: String,
    pub price: f64,
}

pub fn truncate_chars(input: &str, max: usize) -> String {
    input.chars().take(max).collect()
}

/// URL-safe slug: lowercase words joined by single hyphens, at most 60 chars.
pub fn slugify(text: &str) -> String {
    let mut out = String::new();
    let mut pending_sep = false;
    for ch in text.trim().to_lowercase().chars() {
        if ch.is_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('-');
            }
            pending_sep = false;
            out.push(ch);
        } else if ch.is_whitespace() || ch == '-' || ch == '_' {
            pending_sep = true;
        }
    }
    truncate_chars(&out, MAX_SLUG_CHARS)
        .trim_end_matches('-')
        .to_string()
}

/// Whole-percent discount of `price` against `original`, when there is one.
pub fn discount_percentage(price: f64, original: f64) -> Option<f64> {
    if original > 0.0 && original > price {
        Some(((1.0 - price / original) * 100.0).round())
    } else {
        None
    }
}

pub fn new_record_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn placeholder_image(slug: &str) -> String {
    format!("https://picsum.photos/seed/{slug}/400/400")
}

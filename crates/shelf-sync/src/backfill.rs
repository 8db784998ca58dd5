use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::catalog::{CatalogStore, SourcelessProduct};
use crate::StoreError;

#[derive(Debug, Clone, Deserialize)]
pub struct ImageSourceRule {
    /// Case-insensitive substring of the image URL.
    pub contains: String,
    pub source: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ImageSourceRulesFile {
    rules: Vec<ImageSourceRule>,
}

/// Ordered image-URL rules; the first matching rule names the source.
#[derive(Debug, Clone)]
pub struct SourceInference {
    rules: Vec<ImageSourceRule>,
}

impl SourceInference {
    pub fn new(rules: Vec<ImageSourceRule>) -> Self {
        let rules = rules
            .into_iter()
            .map(|r| ImageSourceRule {
                contains: r.contains.to_lowercase(),
                source: r.source,
            })
            .collect();
        Self { rules }
    }

    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        let path = root.join("rules").join("image_sources.yaml");
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let file: ImageSourceRulesFile =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self::new(file.rules))
    }

    pub fn infer(&self, image_url: &str) -> Option<&str> {
        let url = image_url.to_lowercase();
        self.rules
            .iter()
            .find(|r| url.contains(&r.contains))
            .map(|r| r.source.as_str())
    }

    fn infer_product(&self, product: &SourcelessProduct) -> Option<&str> {
        let image = if product.image.trim().is_empty() {
            product.images.first().map(String::as_str).unwrap_or_default()
        } else {
            product.image.as_str()
        };
        self.infer(image)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackfillReport {
    pub scanned: usize,
    pub inferred: BTreeMap<String, usize>,
    pub unknown: usize,
    pub updated: u64,
    pub executed: bool,
}

/// Fill in `source` on products that lack one. Without `execute` only the
/// tally is computed.
pub async fn backfill_sources(
    store: &dyn CatalogStore,
    inference: &SourceInference,
    execute: bool,
) -> Result<BackfillReport, StoreError> {
    let products = store.products_missing_source().await?;
    let mut report = BackfillReport {
        scanned: products.len(),
        executed: execute,
        ..BackfillReport::default()
    };

    let mut updates = Vec::new();
    for product in &products {
        match inference.infer_product(product) {
            Some(source) => {
                *report.inferred.entry(source.to_string()).or_default() += 1;
                updates.push((product.id.clone(), source.to_string()));
            }
            None => {
                warn!(id = %product.id, image = %product.image, "no source rule matches image");
                report.unknown += 1;
            }
        }
    }

    if execute && !updates.is_empty() {
        report.updated = store.set_product_sources(&updates).await?;
    }
    info!(
        scanned = report.scanned,
        unknown = report.unknown,
        updated = report.updated,
        "source backfill finished"
    );
    Ok(report)
}

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use shelf_core::slugify;

#[derive(Debug, Clone, Deserialize)]
pub struct TaxonomyCategory {
    pub name: String,
    pub slug: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct TaxonomyFile {
    default_category: String,
    categories: Vec<TaxonomyCategory>,
    #[serde(default)]
    aliases: BTreeMap<String, String>,
}

/// Fixed category taxonomy plus the rules mapping source hints onto it.
#[derive(Debug, Clone)]
pub struct CategoryTaxonomy {
    categories: Vec<TaxonomyCategory>,
    aliases: BTreeMap<String, String>,
    default_index: usize,
}

impl CategoryTaxonomy {
    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        let path = root.join("rules").join("categories.yaml");
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let file: TaxonomyFile = serde_yaml::from_str(text)?;
        let position = |slug: &str| file.categories.iter().position(|c| c.slug == slug);

        let Some(default_index) = position(&file.default_category) else {
            bail!("default category {:?} is not in the taxonomy", file.default_category);
        };
        for (alias, target) in &file.aliases {
            if position(target).is_none() {
                bail!("alias {alias:?} points at unknown category {target:?}");
            }
        }

        let categories = file
            .categories
            .into_iter()
            .map(|mut c| {
                c.keywords = c.keywords.iter().map(|k| k.to_lowercase()).collect();
                c
            })
            .collect();
        Ok(Self {
            categories,
            aliases: file.aliases,
            default_index,
        })
    }

    pub fn categories(&self) -> &[TaxonomyCategory] {
        &self.categories
    }

    pub fn default_category(&self) -> &TaxonomyCategory {
        &self.categories[self.default_index]
    }

    /// Map a source hint (type string or category slug) and title onto the
    /// taxonomy: exact slug, then alias, then the longest keyword found in the
    /// hint, then in the title, then the default category.
    pub fn resolve(&self, hint: &str, title: &str) -> &TaxonomyCategory {
        let hint_slug = slugify(hint);
        if let Some(category) = self.by_slug(&hint_slug) {
            return category;
        }
        if let Some(category) = self.aliases.get(&hint_slug).and_then(|slug| self.by_slug(slug)) {
            return category;
        }
        self.longest_keyword_match(&hint_slug.replace('-', " "))
            .or_else(|| self.longest_keyword_match(&title.to_lowercase()))
            .unwrap_or_else(|| self.default_category())
    }

    fn by_slug(&self, slug: &str) -> Option<&TaxonomyCategory> {
        self.categories.iter().find(|c| c.slug == slug)
    }

    fn longest_keyword_match(&self, text: &str) -> Option<&TaxonomyCategory> {
        if text.is_empty() {
            return None;
        }
        let mut best: Option<(usize, &TaxonomyCategory)> = None;
        for category in &self.categories {
            let longest = category
                .keywords
                .iter()
                .filter(|k| text.contains(k.as_str()))
                .map(|k| k.chars().count())
                .max();
            match (longest, best) {
                // Earlier categories win ties.
                (Some(len), Some((best_len, _))) if len <= best_len => {}
                (Some(len), _) => best = Some((len, category)),
                (None, _) => {}
            }
        }
        best.map(|(_, category)| category)
    }
}

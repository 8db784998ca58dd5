//! Acquisition, reconciliation and audit pipeline for the storefront catalog.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shelf_adapters::{build_adapter, AdapterKind, AdapterSettings, CategoryTarget, PageLoader};
use shelf_storage::{
    write_atomic, write_json_atomic, AcquisitionStore, FetcherConfig, HttpFetcher, PageArchive,
};
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

pub mod acquisition;
pub mod backfill;
pub mod catalog;
pub mod config;
pub mod dedup;
pub mod importer;
pub mod taxonomy;
pub mod verify;

pub use acquisition::{AcquisitionLoop, AcquisitionReport, AcquisitionSettings, CategoryOutcome};
pub use backfill::{backfill_sources, BackfillReport, SourceInference};
pub use catalog::{CatalogSnapshot, CatalogStore, MemoryCatalogStore, PgCatalogStore, StoreError};
pub use config::{resolve_connection_string, ConnectionTarget, ResolvedConnection, SyncConfig};
pub use dedup::SlugIndex;
pub use importer::{
    DuplicateRule, ImportConfig, ImportPolicy, ImportReport, ReconcilingImporter, SlugResolution,
};
pub use taxonomy::CategoryTaxonomy;
pub use verify::{verify, AcquiredSet, VerifyReport};

pub const CRATE_NAME: &str = "shelf-sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no catalog connection string configured; set DIRECT_URL or DATABASE_URL")]
    MissingConnectionString,
    #[error("unknown or disabled source {0:?}")]
    UnknownSource(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub kind: AdapterKind,
    pub base_url: String,
    pub dataset_file: String,
    #[serde(default)]
    pub categories: Vec<CategoryTarget>,
}

impl SourceConfig {
    /// Category targets to walk; API sources without explicit categories get a
    /// single catalog-wide target.
    pub fn targets(&self) -> Vec<CategoryTarget> {
        if !self.categories.is_empty() {
            return self.categories.clone();
        }
        vec![CategoryTarget {
            name: "All Products".to_string(),
            slug: "all".to_string(),
            url: self.base_url.clone(),
        }]
    }
}

impl SourceRegistry {
    pub fn from_workspace_root(root: &Path) -> anyhow::Result<Self> {
        let path = root.join("sources.yaml");
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Enabled sources, or just `only` when given.
    pub fn select(&self, only: Option<&str>) -> Result<Vec<&SourceConfig>, SyncError> {
        match only {
            Some(id) => self
                .sources
                .iter()
                .find(|s| s.source_id == id && s.enabled)
                .map(|s| vec![s])
                .ok_or_else(|| SyncError::UnknownSource(id.to_string())),
            None => Ok(self.sources.iter().filter(|s| s.enabled).collect()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScrapeSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: Vec<AcquisitionReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceImport {
    pub source_id: String,
    pub listings: usize,
    pub report: ImportReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportRunSummary {
    pub run_id: Uuid,
    pub policy: ImportPolicy,
    pub dry_run: bool,
    pub sources: Vec<SourceImport>,
    pub reports_dir: PathBuf,
}

impl ImportRunSummary {
    pub fn inserted(&self) -> usize {
        self.sources.iter().map(|s| s.report.inserted).sum()
    }

    pub fn renamed(&self) -> usize {
        self.sources.iter().map(|s| s.report.collided_and_renamed).sum()
    }

    pub fn duplicates(&self) -> usize {
        self.sources.iter().map(|s| s.report.true_duplicates_skipped).sum()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyRunSummary {
    pub run_id: Uuid,
    pub report: VerifyReport,
    pub reports_dir: PathBuf,
}

/// Sequences the scrape, import, verify and backfill runs over the configured
/// sources.
pub struct ShelfPipeline {
    config: SyncConfig,
    registry: SourceRegistry,
}

impl ShelfPipeline {
    pub fn new(config: SyncConfig) -> Result<Self, SyncError> {
        let registry = SourceRegistry::from_workspace_root(&config.workspace_root)?;
        Ok(Self::with_registry(config, registry))
    }

    pub fn with_registry(config: SyncConfig, registry: SourceRegistry) -> Self {
        Self { config, registry }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn acquisition_store(&self, source: &SourceConfig) -> AcquisitionStore {
        AcquisitionStore::in_dir(&self.config.dump_dir, &source.source_id, &source.dataset_file)
    }

    /// Scrape over HTTP.
    pub async fn scrape(&self, only: Option<&str>) -> Result<ScrapeSummary, SyncError> {
        let fetcher = HttpFetcher::new(FetcherConfig {
            timeout: Duration::from_secs(self.config.http_timeout_secs),
            user_agent: self.config.user_agent.clone(),
            ..FetcherConfig::default()
        })?;
        self.scrape_with_loader(only, Arc::new(fetcher)).await
    }

    /// Run the acquisition loop for each selected source, sources in
    /// registry order, one page at a time.
    pub async fn scrape_with_loader(
        &self,
        only: Option<&str>,
        loader: Arc<dyn PageLoader>,
    ) -> Result<ScrapeSummary, SyncError> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let archive = self.config.artifacts_dir.as_ref().map(PageArchive::new);

        let mut sources = Vec::new();
        for source in self.registry.select(only)? {
            let adapter = build_adapter(
                source.kind,
                AdapterSettings {
                    source_id: source.source_id.clone(),
                    display_name: source.display_name.clone(),
                    base_url: source.base_url.clone(),
                    default_stock: self.config.default_stock,
                },
                Arc::clone(&loader),
            );
            let store = self.acquisition_store(source);
            let mut acquisition =
                AcquisitionLoop::new(adapter.as_ref(), &store, self.config.acquisition);
            if let Some(archive) = archive.as_ref() {
                acquisition = acquisition.with_archive(archive);
            }
            let report = acquisition.run(&source.targets()).await?;
            info!(
                source = %source.source_id,
                accepted = report.accepted,
                dataset = report.dataset_size,
                "source scraped"
            );
            sources.push(report);
        }

        Ok(ScrapeSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            sources,
        })
    }

    pub async fn load_acquired(&self, only: Option<&str>) -> Result<Vec<AcquiredSet>, SyncError> {
        let mut out = Vec::new();
        for source in self.registry.select(only)? {
            let store = self.acquisition_store(source);
            let listings = store.load_dataset().await?;
            if listings.is_empty() {
                warn!(
                    source = %source.source_id,
                    path = %store.dataset_path().display(),
                    "no acquired listings"
                );
            }
            out.push(AcquiredSet {
                source_id: source.source_id.clone(),
                display_name: source.display_name.clone(),
                listings,
            });
        }
        Ok(out)
    }

    /// Import each selected source's dataset as its own transactional batch.
    ///
    /// A connection failure stops the run; batches committed before it stay.
    pub async fn import(
        &self,
        store: &dyn CatalogStore,
        only: Option<&str>,
        policy: ImportPolicy,
        dry_run: bool,
    ) -> Result<ImportRunSummary, SyncError> {
        let run_id = Uuid::new_v4();
        let taxonomy = CategoryTaxonomy::from_workspace_root(&self.config.workspace_root)?;
        let acquired = self.load_acquired(only).await?;

        // Dry runs plan each batch against the catalog as the earlier batches
        // would have left it.
        let mut projected = if dry_run {
            Some(store.snapshot().await?)
        } else {
            None
        };

        let mut sources = Vec::with_capacity(acquired.len());
        for (i, set) in acquired.iter().enumerate() {
            // Replace-all clears the catalog once, before the first batch.
            let batch_policy = if i == 0 { policy } else { ImportPolicy::Append };
            let importer = ReconcilingImporter::new(
                &taxonomy,
                ImportConfig {
                    policy: batch_policy,
                    duplicates: self.config.duplicates,
                    ..ImportConfig::default()
                },
            );
            let report = match projected.as_mut() {
                Some(snapshot) => importer.dry_run(&set.listings, snapshot),
                None => importer.import(&set.listings, store).await?,
            };
            info!(
                source = %set.source_id,
                inserted = report.inserted,
                renamed = report.collided_and_renamed,
                duplicates = report.true_duplicates_skipped,
                failed = report.failed,
                dry_run,
                "source imported"
            );
            sources.push(SourceImport {
                source_id: set.source_id.clone(),
                listings: set.listings.len(),
                report,
            });
        }

        let reports_dir = self.reports_dir(run_id);
        let brief = import_brief(run_id, policy, dry_run, &sources);
        let summary = ImportRunSummary {
            run_id,
            policy,
            dry_run,
            sources,
            reports_dir: reports_dir.clone(),
        };
        write_report(&reports_dir, "import", &summary, &brief).await?;
        Ok(summary)
    }

    pub async fn verify(
        &self,
        store: &dyn CatalogStore,
        only: Option<&str>,
    ) -> Result<VerifyRunSummary, SyncError> {
        let run_id = Uuid::new_v4();
        let acquired = self.load_acquired(only).await?;
        let report = verify(store, &acquired).await?;

        let reports_dir = self.reports_dir(run_id);
        write_report(&reports_dir, "verify", &report, &verify_brief(run_id, &report)).await?;
        Ok(VerifyRunSummary {
            run_id,
            report,
            reports_dir,
        })
    }

    pub async fn backfill(
        &self,
        store: &dyn CatalogStore,
        execute: bool,
    ) -> Result<BackfillReport, SyncError> {
        let inference = SourceInference::from_workspace_root(&self.config.workspace_root)?;
        Ok(backfill_sources(store, &inference, execute).await?)
    }

    fn reports_dir(&self, run_id: Uuid) -> PathBuf {
        self.config
            .workspace_root
            .join("reports")
            .join(run_id.to_string())
    }
}

async fn write_report<T: Serialize>(
    reports_dir: &Path,
    kind: &str,
    value: &T,
    brief: &str,
) -> anyhow::Result<()> {
    fs::create_dir_all(reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;
    write_json_atomic(&reports_dir.join(format!("{kind}.json")), value).await?;
    write_atomic(&reports_dir.join(format!("{kind}_brief.md")), brief.as_bytes()).await?;
    Ok(())
}

fn import_brief(run_id: Uuid, policy: ImportPolicy, dry_run: bool, sources: &[SourceImport]) -> String {
    let mut lines = vec![
        "# Catalog Import".to_string(),
        String::new(),
        format!("- Run ID: `{run_id}`"),
        format!("- Policy: {policy:?}{}", if dry_run { " (dry run)" } else { "" }),
        String::new(),
        "| source | listings | inserted | renamed | duplicates | failed | conflicts | review |".to_string(),
        "|---|---|---|---|---|---|---|---|".to_string(),
    ];
    for s in sources {
        let r = &s.report;
        lines.push(format!(
            "| {} | {} | {} | {} | {} | {} | {} | {} |",
            s.source_id,
            s.listings,
            r.inserted,
            r.collided_and_renamed,
            r.true_duplicates_skipped,
            r.failed,
            r.write_conflicts,
            r.review.len()
        ));
    }
    lines.push(String::new());
    lines.join("\n")
}

fn verify_brief(run_id: Uuid, report: &VerifyReport) -> String {
    let mut lines = vec![
        "# Catalog Verification".to_string(),
        String::new(),
        format!("- Run ID: `{run_id}`"),
        format!("- Acquired listings: {}", report.acquired_total),
        format!("- Catalog products: {}", report.catalog_total),
        String::new(),
        "## Sources".to_string(),
    ];
    for s in &report.sources {
        lines.push(format!(
            "- {}: {} found, {} missing of {}",
            s.display_name, s.found, s.missing, s.listings
        ));
        for slug in &s.missing_samples {
            lines.push(format!("  - missing `{slug}`"));
        }
    }
    if report.missing_explained_by_duplicates {
        lines.push(String::new());
        lines.push(
            "Missing listings with a smaller catalog are expected: true duplicates are skipped on import."
                .to_string(),
        );
    }
    lines.push(String::new());
    lines.push("## Catalog by source".to_string());
    let distribution: &BTreeMap<String, u64> = &report.source_distribution;
    for (source, count) in distribution {
        lines.push(format!("- {source}: {count}"));
    }
    lines.push(String::new());
    lines.join("\n")
}

use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use shelf_adapters::{AdapterError, CategoryTarget, PageFetch, SourceAdapter};
use shelf_core::RawListing;
use shelf_storage::{AcquisitionStore, Checkpoint, PageArchive};
use tracing::{debug, info, warn};

use crate::dedup::SlugIndex;

#[derive(Debug, Clone, Copy)]
pub struct AcquisitionSettings {
    /// Highest page number fetched for any category.
    pub page_ceiling: u32,
    /// Pause between consecutive page fetches.
    pub page_delay: Duration,
    /// Pause before the single retry of a failed page.
    pub retry_delay: Duration,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            page_ceiling: 20,
            page_delay: Duration::from_millis(2500),
            retry_delay: Duration::from_millis(5000),
        }
    }
}

/// Per-category loop state. Parsing, accumulating and checkpointing happen
/// inside one `FetchingPage` step and are committed together.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LoopState {
    Idle,
    FetchingPage(u32),
    RetryPage(u32),
    CategoryDone(CategoryOutcome),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CategoryOutcome {
    /// Checkpoint already at or beyond the page ceiling.
    AlreadyComplete { last_page: u32 },
    /// Source reported no further results.
    Exhausted { last_page: u32 },
    CeilingReached { last_page: u32 },
    /// A page failed twice; later categories still run.
    Aborted { page: u32, reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct CategoryReport {
    pub category: String,
    pub start_page: u32,
    pub pages_committed: u32,
    pub accepted: usize,
    pub duplicates_dropped: usize,
    pub parse_failures: usize,
    pub retries: u32,
    pub outcome: CategoryOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct AcquisitionReport {
    pub source_id: String,
    pub categories: Vec<CategoryReport>,
    pub accepted: usize,
    pub dataset_size: usize,
}

/// Drives one source adapter page by page over its category targets.
pub struct AcquisitionLoop<'a> {
    adapter: &'a dyn SourceAdapter,
    store: &'a AcquisitionStore,
    archive: Option<&'a PageArchive>,
    settings: AcquisitionSettings,
}

impl<'a> AcquisitionLoop<'a> {
    pub fn new(
        adapter: &'a dyn SourceAdapter,
        store: &'a AcquisitionStore,
        settings: AcquisitionSettings,
    ) -> Self {
        Self {
            adapter,
            store,
            archive: None,
            settings,
        }
    }

    pub fn with_archive(mut self, archive: &'a PageArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    /// Run every target in order, resuming each from its checkpoint.
    ///
    /// Only storage failures are returned as errors; fetch and parse problems
    /// end up in the per-category outcome.
    pub async fn run(&self, targets: &[CategoryTarget]) -> Result<AcquisitionReport> {
        let mut dataset = self.store.load_dataset().await?;
        let mut checkpoint = self.store.load_checkpoint().await?;
        let mut index: SlugIndex = dataset.iter().map(|l| l.slug.clone()).collect();
        info!(
            source = self.adapter.source_id(),
            existing = dataset.len(),
            categories = targets.len(),
            "starting acquisition"
        );

        let mut categories = Vec::with_capacity(targets.len());
        for target in targets {
            let report = self
                .run_category(target, &mut dataset, &mut checkpoint, &mut index)
                .await?;
            categories.push(report);
        }

        Ok(AcquisitionReport {
            source_id: self.adapter.source_id().to_string(),
            accepted: categories.iter().map(|c| c.accepted).sum(),
            dataset_size: dataset.len(),
            categories,
        })
    }

    async fn run_category(
        &self,
        target: &CategoryTarget,
        dataset: &mut Vec<RawListing>,
        checkpoint: &mut Checkpoint,
        index: &mut SlugIndex,
    ) -> Result<CategoryReport> {
        let start_page = checkpoint.resume_page(&target.name);
        let mut report = CategoryReport {
            category: target.name.clone(),
            start_page,
            pages_committed: 0,
            accepted: 0,
            duplicates_dropped: 0,
            parse_failures: 0,
            retries: 0,
            outcome: CategoryOutcome::AlreadyComplete {
                last_page: start_page.saturating_sub(1),
            },
        };

        let mut state = LoopState::Idle;
        loop {
            state = match state {
                LoopState::Idle if start_page > self.settings.page_ceiling => {
                    LoopState::CategoryDone(CategoryOutcome::AlreadyComplete {
                        last_page: start_page - 1,
                    })
                }
                LoopState::Idle => LoopState::FetchingPage(start_page),
                LoopState::FetchingPage(page) => match self.adapter.fetch_page(target, page).await {
                    Ok(fetch) => {
                        self.accept_page(target, page, fetch, dataset, checkpoint, index, &mut report)
                            .await?
                    }
                    Err(err) => {
                        warn!(
                            source = self.adapter.source_id(),
                            category = %target.name,
                            page,
                            error = %err,
                            "page failed; retrying once"
                        );
                        report.retries += 1;
                        LoopState::RetryPage(page)
                    }
                },
                LoopState::RetryPage(page) => {
                    tokio::time::sleep(self.settings.retry_delay).await;
                    match self.adapter.fetch_page(target, page).await {
                        Ok(fetch) => {
                            self.accept_page(target, page, fetch, dataset, checkpoint, index, &mut report)
                                .await?
                        }
                        Err(err) => {
                            warn!(
                                source = self.adapter.source_id(),
                                category = %target.name,
                                page,
                                error = %err,
                                "page failed after retry; abandoning category"
                            );
                            LoopState::CategoryDone(CategoryOutcome::Aborted {
                                page,
                                reason: abort_reason(&err),
                            })
                        }
                    }
                }
                LoopState::CategoryDone(outcome) => {
                    report.outcome = outcome;
                    break;
                }
            };
            debug!(category = %target.name, ?state, "acquisition state");
        }

        info!(
            source = self.adapter.source_id(),
            category = %target.name,
            accepted = report.accepted,
            duplicates = report.duplicates_dropped,
            outcome = ?report.outcome,
            "category finished"
        );
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    async fn accept_page(
        &self,
        target: &CategoryTarget,
        page: u32,
        fetch: PageFetch,
        dataset: &mut Vec<RawListing>,
        checkpoint: &mut Checkpoint,
        index: &mut SlugIndex,
        report: &mut CategoryReport,
    ) -> Result<LoopState> {
        self.archive_page(&fetch).await;
        report.parse_failures += fetch.parse_failures.len();

        if !fetch.has_more && fetch.listings.is_empty() {
            return Ok(LoopState::CategoryDone(CategoryOutcome::Exhausted {
                last_page: page - 1,
            }));
        }

        for listing in fetch.listings {
            if index.insert_if_new(&listing.slug) {
                dataset.push(listing);
                report.accepted += 1;
            } else {
                debug!(slug = %listing.slug, "dropping already seen listing");
                report.duplicates_dropped += 1;
            }
        }

        checkpoint.mark_completed(&target.name, page);
        self.store.commit(dataset, checkpoint).await?;
        report.pages_committed += 1;

        if !fetch.has_more {
            return Ok(LoopState::CategoryDone(CategoryOutcome::Exhausted { last_page: page }));
        }
        if page >= self.settings.page_ceiling {
            return Ok(LoopState::CategoryDone(CategoryOutcome::CeilingReached { last_page: page }));
        }
        tokio::time::sleep(self.settings.page_delay).await;
        Ok(LoopState::FetchingPage(page + 1))
    }

    async fn archive_page(&self, fetch: &PageFetch) {
        let (Some(archive), Some(raw)) = (self.archive, fetch.raw.as_ref()) else {
            return;
        };
        if let Err(err) = archive
            .archive(raw.fetched_at, self.adapter.source_id(), raw.extension(), &raw.body)
            .await
        {
            warn!(url = %fetch.url, error = %err, "failed to archive raw page");
        }
    }
}

fn abort_reason(err: &AdapterError) -> String {
    match err {
        AdapterError::MissingContainer { .. } => "result container missing after retry".to_string(),
        other => other.to_string(),
    }
}

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use shelf_adapters::{LoadedPage, PageLoader};
use shelf_core::{Category, Product, RawListing};
use shelf_storage::FetchError;
use shelf_sync::{
    AcquiredSet, AcquisitionSettings, CatalogStore, CategoryOutcome, CategoryTaxonomy,
    DuplicateRule, ImportConfig, ImportPolicy, MemoryCatalogStore, ReconcilingImporter,
    ShelfPipeline, SourceInference, StoreError, SyncConfig,
};

const RULES: &str = r#"
default_category: necklaces
categories:
  - {name: Necklaces, slug: necklaces, keywords: [necklace, chain]}
  - {name: Earrings, slug: earrings, keywords: [earring, jhumka]}
  - {name: Rings, slug: rings, keywords: [ring]}
aliases:
  jewellery-sets: necklaces
"#;

fn taxonomy() -> CategoryTaxonomy {
    CategoryTaxonomy::from_yaml(RULES).unwrap()
}

fn listing(slug: &str, title: &str, price: f64) -> RawListing {
    RawListing {
        title: title.into(),
        slug: slug.into(),
        description: format!("{title} description"),
        price,
        original_price: None,
        discount_percentage: None,
        rating: 4.5,
        reviews_count: 3,
        items_left: 30,
        image: format!("https://cdn.test/{slug}.jpg"),
        images: Vec::new(),
        tags: Vec::new(),
        category_hint: String::new(),
        is_featured: false,
        is_new: false,
        source: "Peora".into(),
        source_url: String::new(),
    }
}

fn seeded_product(id: &str, slug: &str, title: &str, price: f64, category_id: &str) -> Product {
    let now = Utc::now();
    Product {
        id: id.into(),
        title: title.into(),
        slug: slug.into(),
        description: String::new(),
        price,
        original_price: None,
        discount_percentage: None,
        rating: 4.5,
        reviews_count: 0,
        items_left: 10,
        image: String::new(),
        images: Vec::new(),
        tags: Vec::new(),
        is_featured: false,
        is_new: false,
        category_id: category_id.into(),
        source: None,
        source_url: None,
        created_at: now,
        updated_at: now,
    }
}

fn rings_category() -> Category {
    let now = Utc::now();
    Category {
        id: "cat-rings".into(),
        name: "Rings".into(),
        slug: "rings".into(),
        description: None,
        image: None,
        created_at: now,
        updated_at: now,
    }
}

#[tokio::test]
async fn second_import_of_same_batch_inserts_nothing() {
    let taxonomy = taxonomy();
    let importer = ReconcilingImporter::new(&taxonomy, ImportConfig::default());
    let store = MemoryCatalogStore::new();
    let batch = vec![
        listing("gold-ring", "Gold Ring", 999.0),
        listing("pearl-chain", "Pearl Chain", 1200.0),
        listing("gold-ring", "Kundan Jhumka", 450.0),
    ];

    let first = importer.import(&batch, &store).await.unwrap();
    assert_eq!(first.inserted, 3);
    assert_eq!(first.collided_and_renamed, 1);
    assert_eq!(first.categories_created, 3);

    let second = importer.import(&batch, &store).await.unwrap();
    assert_eq!(second.inserted, 0);
    assert_eq!(second.true_duplicates_skipped, batch.len());
    assert_eq!(store.products().len(), 3);
    assert_eq!(store.categories().len(), 3);
}

#[tokio::test]
async fn gold_ring_duplicate_and_collision() {
    let taxonomy = taxonomy();
    let importer = ReconcilingImporter::new(&taxonomy, ImportConfig::default());
    let store = MemoryCatalogStore::new();
    store.seed_category(rings_category());
    store.seed_product(seeded_product("p0", "gold-ring", "Gold Ring", 999.0, "cat-rings"));

    let report = importer
        .import(
            &[
                listing("gold-ring", "Gold Ring", 1005.0),
                listing("gold-ring", "Silver Bangle", 499.0),
            ],
            &store,
        )
        .await
        .unwrap();

    assert_eq!(report.true_duplicates_skipped, 1);
    assert_eq!(report.collided_and_renamed, 1);
    assert_eq!(report.inserted, 1);
    let slugs: Vec<String> = store.products().into_iter().map(|p| p.slug).collect();
    assert_eq!(slugs, vec!["gold-ring".to_string(), "gold-ring-1".to_string()]);
}

#[tokio::test]
async fn every_inserted_product_references_an_existing_category() {
    let taxonomy = taxonomy();
    let importer = ReconcilingImporter::new(&taxonomy, ImportConfig::default());
    let store = MemoryCatalogStore::new();
    store.seed_category(rings_category());
    let mut hinted = listing("set-1", "Bridal Set", 5000.0);
    hinted.category_hint = "Jewellery Sets".into();

    importer
        .import(&[listing("r", "Toe Ring", 90.0), hinted], &store)
        .await
        .unwrap();

    let categories = store.categories();
    for product in store.products() {
        assert!(categories.iter().any(|c| c.id == product.category_id));
    }
    let bridal = store.products().into_iter().find(|p| p.slug == "set-1").unwrap();
    let necklaces = categories.iter().find(|c| c.slug == "necklaces").unwrap();
    assert_eq!(bridal.category_id, necklaces.id);
}

#[tokio::test]
async fn concurrent_writer_conflict_is_skipped_not_fatal() {
    let taxonomy = taxonomy();
    let importer = ReconcilingImporter::new(&taxonomy, ImportConfig::default());
    let store = MemoryCatalogStore::new();
    store.race_on(&["pearl-chain"]);

    let report = importer
        .import(
            &[
                listing("gold-ring", "Gold Ring", 999.0),
                listing("pearl-chain", "Pearl Chain", 1200.0),
            ],
            &store,
        )
        .await
        .unwrap();
    assert_eq!(report.inserted, 1);
    assert_eq!(report.write_conflicts, 1);
}

#[tokio::test]
async fn connection_failure_aborts_and_leaves_catalog_unchanged() {
    let taxonomy = taxonomy();
    let importer = ReconcilingImporter::new(&taxonomy, ImportConfig::default());
    let store = MemoryCatalogStore::new();
    store.seed_product(seeded_product("p0", "kept", "Kept", 10.0, "cat"));
    store.go_offline();

    let err = importer
        .import(&[listing("gold-ring", "Gold Ring", 999.0)], &store)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::ConnectionFailure(_)));
    assert_eq!(store.products().len(), 1);
}

#[tokio::test]
async fn wider_tolerance_is_configurable() {
    let taxonomy = taxonomy();
    let config = ImportConfig {
        duplicates: DuplicateRule {
            price_tolerance: 100.0,
            title_prefix_chars: 4,
        },
        ..ImportConfig::default()
    };
    let importer = ReconcilingImporter::new(&taxonomy, config);
    let store = MemoryCatalogStore::new();
    store.seed_product(seeded_product("p0", "gold-ring", "Gold Ring", 999.0, "cat"));

    let report = importer
        .import(&[listing("gold-ring", "Gold Ring Deluxe", 1080.0)], &store)
        .await
        .unwrap();
    assert_eq!(report.true_duplicates_skipped, 1);
}

#[tokio::test]
async fn verifier_partitions_found_and_missing_without_writing() {
    let store = MemoryCatalogStore::new();
    let mut sourced = seeded_product("p0", "gold-ring", "Gold Ring", 999.0, "cat");
    sourced.source = Some("Peora".into());
    store.seed_product(sourced);

    let acquired = vec![AcquiredSet {
        source_id: "peora".into(),
        display_name: "Peora".into(),
        listings: vec![
            listing("gold-ring", "Gold Ring", 999.0),
            listing("gold-ring", "Gold Ring", 999.0),
            listing("lost-1", "Lost", 1.0),
        ],
    }];
    let report = shelf_sync::verify(&store, &acquired).await.unwrap();
    let source = &report.sources[0];
    assert_eq!((source.found, source.missing), (2, 1));
    assert_eq!(source.missing_samples, vec!["lost-1".to_string()]);
    assert_eq!(report.catalog_total, 1);
    assert!(report.missing_explained_by_duplicates);
    assert_eq!(report.source_distribution.get("Peora"), Some(&1));
    assert_eq!(store.products().len(), 1);
}

#[tokio::test]
async fn backfill_reports_without_execute_and_updates_with_it() {
    let store = MemoryCatalogStore::new();
    let mut amazon = seeded_product("a", "a", "A", 1.0, "cat");
    amazon.image = "https://m.media-amazon.com/images/I/a.jpg".into();
    let mut unknown = seeded_product("b", "b", "B", 1.0, "cat");
    unknown.image = "https://elsewhere.test/b.jpg".into();
    store.seed_product(amazon);
    store.seed_product(unknown);

    let inference = SourceInference::new(vec![shelf_sync::backfill::ImageSourceRule {
        contains: "m.media-amazon".into(),
        source: "Amazon".into(),
    }]);

    let dry = shelf_sync::backfill_sources(&store, &inference, false).await.unwrap();
    assert_eq!(dry.scanned, 2);
    assert_eq!(dry.unknown, 1);
    assert_eq!(dry.updated, 0);
    assert!(store.products().iter().all(|p| p.source.is_none()));

    let done = shelf_sync::backfill_sources(&store, &inference, true).await.unwrap();
    assert_eq!(done.updated, 1);
    let distribution = store.source_distribution().await.unwrap();
    assert_eq!(distribution.get("Amazon"), Some(&1));
    assert_eq!(distribution.get("unknown"), Some(&1));
}

struct MapLoader {
    pages: HashMap<String, String>,
}

#[async_trait]
impl PageLoader for MapLoader {
    async fn load(&self, _source_id: &str, url: &str) -> Result<LoadedPage, FetchError> {
        let body = self
            .pages
            .get(url)
            .ok_or_else(|| FetchError::Unavailable(format!("404 {url}")))?;
        Ok(LoadedPage {
            url: url.to_string(),
            content_type: "application/json".to_string(),
            body: body.clone().into_bytes(),
            fetched_at: Utc::now(),
        })
    }
}

fn write_workspace(root: &Path) {
    std::fs::create_dir_all(root.join("rules")).unwrap();
    std::fs::write(root.join("rules").join("categories.yaml"), RULES).unwrap();
    std::fs::write(
        root.join("sources.yaml"),
        r#"
sources:
  - source_id: teststore
    display_name: Test Store
    enabled: true
    kind: shopify_json
    base_url: https://store.test
    dataset_file: teststore_products.json
  - source_id: dormant
    display_name: Dormant
    enabled: false
    kind: shopify_json
    base_url: https://dormant.test
    dataset_file: dormant_products.json
"#,
    )
    .unwrap();
}

fn config_for(root: &Path) -> SyncConfig {
    SyncConfig {
        workspace_root: root.to_path_buf(),
        dump_dir: root.join("dump"),
        artifacts_dir: Some(root.join("artifacts")),
        direct_url: None,
        database_url: None,
        acquisition: AcquisitionSettings {
            page_ceiling: 10,
            page_delay: Duration::ZERO,
            retry_delay: Duration::ZERO,
        },
        http_timeout_secs: 5,
        user_agent: "test".into(),
        default_stock: 30,
        duplicates: DuplicateRule::default(),
    }
}

fn product_json(handle: &str, title: &str, price: &str) -> String {
    format!(
        r#"{{"title": "{title}", "handle": "{handle}", "product_type": "Rings", "tags": [], "variants": [{{"price": "{price}"}}], "images": [{{"src": "https://cdn.test/{handle}.jpg"}}]}}"#
    )
}

#[tokio::test]
async fn scrape_import_verify_round_trip_over_workspace() {
    let dir = tempfile::tempdir().unwrap();
    let root: PathBuf = dir.path().to_path_buf();
    write_workspace(&root);

    let page = |n: u32| format!("https://store.test/products.json?limit=250&page={n}");
    let loader = Arc::new(MapLoader {
        pages: HashMap::from([
            (
                page(1),
                format!(
                    r#"{{"products": [{}, {}]}}"#,
                    product_json("gold-ring", "Gold Ring", "999.00"),
                    product_json("toe-ring", "Toe Ring", "150.00")
                ),
            ),
            (
                page(2),
                format!(
                    r#"{{"products": [{}, {}]}}"#,
                    product_json("gold-ring", "Gold Ring", "999.00"),
                    product_json("band", "Plain Band Ring", "300.00")
                ),
            ),
            (page(3), r#"{"products": []}"#.to_string()),
        ]),
    });

    let pipeline = ShelfPipeline::new(config_for(&root)).unwrap();
    let scraped = pipeline.scrape_with_loader(None, loader.clone()).await.unwrap();
    assert_eq!(scraped.sources.len(), 1);
    let source = &scraped.sources[0];
    assert_eq!(source.dataset_size, 3);
    assert_eq!(source.categories[0].duplicates_dropped, 1);
    assert_eq!(
        source.categories[0].outcome,
        CategoryOutcome::Exhausted { last_page: 2 }
    );
    assert!(root.join("dump").join("teststore_progress.json").exists());
    assert!(root.join("artifacts").exists());

    // Re-running resumes after page 2 and adds nothing.
    let again = pipeline.scrape_with_loader(None, loader).await.unwrap();
    assert_eq!(again.sources[0].categories[0].start_page, 3);
    assert_eq!(again.sources[0].accepted, 0);

    let store = MemoryCatalogStore::new();
    let dry = pipeline
        .import(&store, None, ImportPolicy::Append, true)
        .await
        .unwrap();
    assert_eq!(dry.inserted(), 3);
    assert!(store.products().is_empty());

    let imported = pipeline
        .import(&store, None, ImportPolicy::Append, false)
        .await
        .unwrap();
    assert_eq!(imported.inserted(), 3);
    assert!(imported.reports_dir.join("import.json").exists());
    assert!(imported.reports_dir.join("import_brief.md").exists());

    let reimported = pipeline
        .import(&store, Some("teststore"), ImportPolicy::Append, false)
        .await
        .unwrap();
    assert_eq!(reimported.inserted(), 0);
    assert_eq!(reimported.duplicates(), 3);

    let verified = pipeline.verify(&store, None).await.unwrap();
    assert_eq!(verified.report.sources[0].found, 3);
    assert_eq!(verified.report.sources[0].missing, 0);
    assert!(verified.reports_dir.join("verify.json").exists());
}

fn write_two_source_workspace(root: &Path) {
    std::fs::create_dir_all(root.join("rules")).unwrap();
    std::fs::create_dir_all(root.join("dump")).unwrap();
    std::fs::write(root.join("rules").join("categories.yaml"), RULES).unwrap();
    std::fs::write(
        root.join("sources.yaml"),
        r#"
sources:
  - source_id: storea
    display_name: Store A
    enabled: true
    kind: shopify_json
    base_url: https://a.test
    dataset_file: storea_products.json
  - source_id: storeb
    display_name: Store B
    enabled: true
    kind: shopify_json
    base_url: https://b.test
    dataset_file: storeb_products.json
"#,
    )
    .unwrap();
    let dataset = |file: &str, listings: Vec<RawListing>| {
        std::fs::write(
            root.join("dump").join(file),
            serde_json::to_vec(&listings).unwrap(),
        )
        .unwrap();
    };
    dataset(
        "storea_products.json",
        vec![
            listing("gold-ring", "Gold Ring", 999.0),
            listing("pearl-chain", "Pearl Chain", 1200.0),
        ],
    );
    dataset(
        "storeb_products.json",
        vec![
            listing("gold-ring", "Silver Bangle", 499.0),
            listing("pearl-chain", "Pearl Chain", 1195.0),
        ],
    );
}

fn as_committed(summary: &shelf_sync::ImportRunSummary) -> Vec<shelf_sync::ImportReport> {
    summary
        .sources
        .iter()
        .map(|s| shelf_sync::ImportReport {
            dry_run: false,
            ..s.report.clone()
        })
        .collect()
}

#[tokio::test]
async fn dry_run_reports_cross_source_collisions_like_the_real_import() {
    let dir = tempfile::tempdir().unwrap();
    write_two_source_workspace(dir.path());
    let pipeline = ShelfPipeline::new(config_for(dir.path())).unwrap();

    for policy in [ImportPolicy::Append, ImportPolicy::ReplaceAll] {
        let store = MemoryCatalogStore::new();
        store.seed_category(rings_category());
        store.seed_product(seeded_product("p0", "pearl-chain", "Old Chain", 50.0, "cat-rings"));

        let dry = pipeline.import(&store, None, policy, true).await.unwrap();
        assert_eq!(store.products().len(), 1);
        let real = pipeline.import(&store, None, policy, false).await.unwrap();

        assert_eq!(as_committed(&dry), as_committed(&real), "{policy:?}");
        assert_eq!(dry.sources[1].report.renames[0].resolved, "gold-ring-1");
        assert_eq!(dry.sources[1].report.true_duplicates_skipped, 1);
    }
}

#[tokio::test]
async fn disabled_or_unknown_source_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    write_workspace(dir.path());
    let pipeline = ShelfPipeline::new(config_for(dir.path())).unwrap();
    assert!(matches!(
        pipeline.load_acquired(Some("dormant")).await,
        Err(shelf_sync::SyncError::UnknownSource(_))
    ));
}

#[test]
fn shipped_workspace_rules_load() {
    let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
    let registry = shelf_sync::SourceRegistry::from_workspace_root(&root).unwrap();
    let enabled = registry.select(None).unwrap();
    assert!(enabled.iter().any(|s| s.source_id == "amazon"));
    assert_eq!(registry.select(Some("peora")).unwrap()[0].targets()[0].slug, "all");

    let taxonomy = CategoryTaxonomy::from_workspace_root(&root).unwrap();
    assert_eq!(taxonomy.default_category().slug, "necklaces");
    assert_eq!(taxonomy.resolve("Bangles-Bracelets", "").slug, "bracelets");
    assert_eq!(taxonomy.resolve("jewelry", "Gold Jhumka Earrings").slug, "necklaces");
    assert_eq!(taxonomy.resolve("", "Silver Toe Ring Pair").slug, "rings");
    assert_eq!(taxonomy.resolve("", "Oxidised Earrings").slug, "earrings");

    let inference = SourceInference::from_workspace_root(&root).unwrap();
    assert_eq!(
        inference.infer("https://cdn.shopify.com/s/files/1/0560/7889/3117/files/a.jpg"),
        Some("Adore By Priyanka")
    );
}

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;
use shelf_storage::DEFAULT_USER_AGENT;
use tracing::{info, warn};

use crate::acquisition::AcquisitionSettings;
use crate::importer::DuplicateRule;
use crate::SyncError;

const POOLED_PORT: &str = ":6543";
const SESSION_PORT: &str = ":5432";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    pub dump_dir: PathBuf,
    pub artifacts_dir: Option<PathBuf>,
    pub direct_url: Option<String>,
    pub database_url: Option<String>,
    pub acquisition: AcquisitionSettings,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub default_stock: u32,
    pub duplicates: DuplicateRule,
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    parse_or_default(key, env_opt(key).as_deref(), default)
}

/// A value that fails to parse is reported and replaced by `default`.
fn parse_or_default<T: FromStr>(key: &str, raw: Option<&str>, default: T) -> T {
    let Some(raw) = raw else {
        return default;
    };
    match raw.trim().parse() {
        Ok(value) => value,
        Err(_) => {
            warn!(key, value = raw, "ignoring unparseable setting; using default");
            default
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let workspace_root = env_opt("SHELF_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let dump_dir = env_opt("SHELF_DUMP_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| workspace_root.join("dump"));
        let defaults = AcquisitionSettings::default();
        let rule = DuplicateRule::default();
        Self {
            dump_dir,
            artifacts_dir: env_opt("ARTIFACTS_DIR").map(PathBuf::from),
            direct_url: env_opt("DIRECT_URL"),
            database_url: env_opt("DATABASE_URL"),
            acquisition: AcquisitionSettings {
                page_ceiling: env_parse("SHELF_PAGE_CEILING", defaults.page_ceiling),
                page_delay: Duration::from_millis(env_parse(
                    "SHELF_PAGE_DELAY_MS",
                    defaults.page_delay.as_millis() as u64,
                )),
                retry_delay: Duration::from_millis(env_parse(
                    "SHELF_RETRY_DELAY_MS",
                    defaults.retry_delay.as_millis() as u64,
                )),
            },
            http_timeout_secs: env_parse("SHELF_HTTP_TIMEOUT_SECS", 30),
            user_agent: env_opt("SHELF_USER_AGENT")
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            default_stock: env_parse("SHELF_DEFAULT_STOCK", 30),
            duplicates: DuplicateRule {
                price_tolerance: env_parse("SHELF_PRICE_TOLERANCE", rule.price_tolerance),
                title_prefix_chars: env_parse("SHELF_TITLE_PREFIX_CHARS", rule.title_prefix_chars),
            },
            workspace_root,
        }
    }

    /// Catalog connection for bulk writes; see [`resolve_connection_string`].
    pub fn catalog_connection(&self) -> Result<ResolvedConnection, SyncError> {
        let resolved =
            resolve_connection_string(self.direct_url.as_deref(), self.database_url.as_deref())?;
        info!(
            target = ?resolved.target,
            rewritten = resolved.rewritten,
            "resolved catalog connection"
        );
        Ok(resolved)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionTarget {
    Direct,
    Pooled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConnection {
    pub url: String,
    /// What the configured string pointed at before any rewrite.
    pub target: ConnectionTarget,
    pub rewritten: bool,
}

pub fn is_pooled_endpoint(url: &str) -> bool {
    url.contains(POOLED_PORT) || url.contains("pgbouncer=true")
}

/// Pick the catalog connection string, preferring `direct` over `pooled`.
///
/// Pooled transaction endpoints fail under sustained bulk inserts, so a pooled
/// string is rewritten to the session port with its query parameters removed.
pub fn resolve_connection_string(
    direct: Option<&str>,
    database: Option<&str>,
) -> Result<ResolvedConnection, SyncError> {
    let url = direct
        .or(database)
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .ok_or(SyncError::MissingConnectionString)?;

    if !is_pooled_endpoint(url) {
        return Ok(ResolvedConnection {
            url: url.to_string(),
            target: ConnectionTarget::Direct,
            rewritten: false,
        });
    }

    let without_query = url.split('?').next().unwrap_or(url);
    Ok(ResolvedConnection {
        url: without_query.replace(POOLED_PORT, SESSION_PORT),
        target: ConnectionTarget::Pooled,
        rewritten: true,
    })
}

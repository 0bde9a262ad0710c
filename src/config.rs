use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

/// Engine tunables, injected into [`NavigationEngine`](crate::services::navigation::NavigationEngine).
#[derive(Debug, Clone)]
pub struct NavigatorConfig {
    /// Age after which the project-wide bucket cache is re-enumerated.
    pub bucket_cache_ttl: Duration,
    /// Age after which a bucket index subtree is re-listed.
    pub index_staleness: Duration,
    /// Requested page size for listing calls.
    pub page_size: usize,
    /// Upper bound on concurrent store calls during fan-out.
    pub max_concurrency: usize,
    /// Project new buckets are created in.
    pub default_project: String,
}

impl Default for NavigatorConfig {
    fn default() -> Self {
        Self {
            bucket_cache_ttl: Duration::from_secs(60),
            index_staleness: Duration::from_secs(30),
            page_size: 1000,
            max_concurrency: 16,
            default_project: "default".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Sqlite,
    Memory,
}

impl FromStr for Backend {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "sqlite" => Ok(Backend::Sqlite),
            "memory" => Ok(Backend::Memory),
            other => bail!("unknown backend `{other}` (expected `sqlite` or `memory`)"),
        }
    }
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub backend: Backend,
    pub storage_dir: String,
    pub database_url: String,
    pub navigator: NavigatorConfig,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Browse a bucket/object store as a drive")]
pub struct Args {
    /// Store backend: sqlite or memory (overrides BUCKET_DRIVE_BACKEND)
    #[arg(long)]
    pub backend: Option<String>,

    /// Directory where object payloads are stored (overrides BUCKET_DRIVE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides BUCKET_DRIVE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Project new buckets are created in (overrides BUCKET_DRIVE_PROJECT)
    #[arg(long)]
    pub project: Option<String>,

    /// Bucket cache time-to-live in seconds
    #[arg(long)]
    pub bucket_cache_ttl_secs: Option<u64>,

    /// Object index staleness bound in seconds
    #[arg(long)]
    pub index_staleness_secs: Option<u64>,

    /// Listing page size
    #[arg(long)]
    pub page_size: Option<usize>,

    /// Maximum concurrent store calls during recursive operations
    #[arg(long)]
    pub max_concurrency: Option<usize>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

/// Read and parse `BUCKET_DRIVE_{name}`, falling back to `default` when unset.
fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let key = format!("BUCKET_DRIVE_{name}");
    match env::var(&key) {
        Ok(value) => value
            .parse::<T>()
            .map_err(|err| anyhow::anyhow!("{err}"))
            .with_context(|| format!("parsing {key} value `{value}`")),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {key}")),
    }
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        Self::from_args(args)
    }

    pub fn from_args(args: Args) -> Result<(Self, bool)> {
        let defaults = NavigatorConfig::default();

        // --- Environment fallback ---
        let env_backend: String = env_or("BACKEND", "sqlite".to_string())?;
        let env_storage: String = env_or("STORAGE_DIR", "./data/objects".to_string())?;
        let env_db: String = env_or(
            "DATABASE_URL",
            "sqlite://./data/meta/bucket_drive.db".to_string(),
        )?;
        let env_project: String = env_or("PROJECT", defaults.default_project.clone())?;
        let env_ttl: u64 = env_or("BUCKET_CACHE_TTL_SECS", defaults.bucket_cache_ttl.as_secs())?;
        let env_staleness: u64 =
            env_or("INDEX_STALENESS_SECS", defaults.index_staleness.as_secs())?;
        let env_page_size: usize = env_or("PAGE_SIZE", defaults.page_size)?;
        let env_concurrency: usize = env_or("MAX_CONCURRENCY", defaults.max_concurrency)?;

        // --- Merge ---
        let backend = args.backend.unwrap_or(env_backend).parse::<Backend>()?;
        let navigator = NavigatorConfig {
            bucket_cache_ttl: Duration::from_secs(args.bucket_cache_ttl_secs.unwrap_or(env_ttl)),
            index_staleness: Duration::from_secs(
                args.index_staleness_secs.unwrap_or(env_staleness),
            ),
            page_size: args.page_size.unwrap_or(env_page_size).max(1),
            max_concurrency: args.max_concurrency.unwrap_or(env_concurrency).max(1),
            default_project: args.project.unwrap_or(env_project),
        };

        let cfg = Self {
            backend,
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            navigator,
        };

        Ok((cfg, args.migrate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_prefer_cli_over_defaults() {
        let args = Args::parse_from([
            "bucket-drive",
            "--backend",
            "memory",
            "--page-size",
            "50",
            "--project",
            "analytics",
        ]);
        let (cfg, migrate) = AppConfig::from_args(args).unwrap();
        assert_eq!(cfg.backend, Backend::Memory);
        assert_eq!(cfg.navigator.page_size, 50);
        assert_eq!(cfg.navigator.default_project, "analytics");
        assert!(!migrate);
    }

    #[test]
    fn test_should_reject_unknown_backend() {
        assert!("s3".parse::<Backend>().is_err());
        assert_eq!("SQLite".parse::<Backend>().unwrap(), Backend::Sqlite);
    }
}

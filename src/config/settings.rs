//! Configuration settings for DeltaCopy
//!
//! Defines the CLI arguments, the optional JSON config file and the
//! [`SyncConfig`] handed to the orchestrator at construction. Precedence is
//! CLI flag (or its environment variable), then config file, then default.

use crate::catalog::default_lease_owner;
use crate::error::{DeltaCopyError, Result};
use crate::storage::TargetNamespace;
use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default lease time-to-live
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(15 * 60);

/// DeltaCopy - incremental exporter for append-only objects
#[derive(Parser, Debug, Clone)]
#[command(name = "deltacopy")]
#[command(author = "DeltaCopy Team")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Export newly appended bytes of growing objects as delta objects")]
#[command(long_about = r#"
DeltaCopy watches append-only objects and exports only the bytes appended
since the last run, using server-side range copy. A catalog records the
exported offset of every tracked object.

Examples:
  deltacopy --catalog catalog.json --target local://deltas --local-root /data run
  deltacopy --storage s3 --target s3://exports/deltas watch --interval 5m
  deltacopy --catalog catalog.json track local://logs/app.log
  deltacopy --catalog catalog.json status
"#)]
pub struct CliArgs {
    /// JSON config file
    #[arg(long, value_name = "PATH", env = "DELTACOPY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Target namespace for delta objects (scheme://container[/prefix])
    #[arg(long, value_name = "URI", env = "DELTACOPY_TARGET")]
    pub target: Option<String>,

    /// Path of the JSON offset catalog
    #[arg(long, value_name = "PATH", env = "DELTACOPY_CATALOG")]
    pub catalog: Option<PathBuf>,

    /// Storage backend
    #[arg(long, value_enum, env = "DELTACOPY_STORAGE")]
    pub storage: Option<StorageKind>,

    /// Root directory of the local storage backend
    #[arg(long, value_name = "DIR", env = "DELTACOPY_LOCAL_ROOT")]
    pub local_root: Option<PathBuf>,

    /// S3 region
    #[arg(long, value_name = "REGION", env = "DELTACOPY_S3_REGION")]
    pub s3_region: Option<String>,

    /// Custom S3 endpoint (MinIO, Wasabi, ...)
    #[arg(long, value_name = "URL", env = "DELTACOPY_S3_ENDPOINT")]
    pub s3_endpoint: Option<String>,

    /// Use path-style S3 URLs
    #[arg(long)]
    pub s3_path_style: bool,

    /// Rows processed in parallel (0 = auto-detect)
    #[arg(short = 'j', long, value_name = "NUM", env = "DELTACOPY_CONCURRENCY")]
    pub concurrency: Option<usize>,

    /// Stop starting new rows after this long (e.g. 10m)
    #[arg(long, value_name = "DURATION")]
    pub pass_timeout: Option<String>,

    /// Pass lease time-to-live (e.g. 15m)
    #[arg(long, value_name = "DURATION")]
    pub lease_ttl: Option<String>,

    /// Lease owner name (default: hostname:pid)
    #[arg(long, value_name = "NAME")]
    pub lease_owner: Option<String>,

    /// Run without acquiring the pass lease
    #[arg(long)]
    pub no_lease: bool,

    /// Maximum storage requests per second
    #[arg(long, value_name = "NUM")]
    pub requests_per_second: Option<u32>,

    /// Show a progress spinner
    #[arg(short = 'p', long)]
    pub progress: bool,

    /// Verbose output (can be repeated: -v, -vv)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Quiet mode (only errors)
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Log line format
    #[arg(long, value_enum, default_value = "text")]
    pub log_format: LogFormat,

    /// Output format for pass reports
    #[arg(long, value_enum, default_value = "text")]
    pub output_format: OutputFormat,

    /// Subcommand
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run a single export pass
    #[command(name = "run")]
    Run,

    /// Run export passes on an interval until interrupted
    #[command(name = "watch")]
    Watch {
        /// Time between pass starts (e.g. 30s, 5m)
        #[arg(long, default_value = "5m", env = "DELTACOPY_INTERVAL")]
        interval: String,
    },

    /// Show the catalog contents
    #[command(name = "status")]
    Status,

    /// Add an object to the catalog
    #[command(name = "track")]
    Track {
        /// Source object identifier (scheme://container/key)
        source_id: String,
        /// Bytes to treat as already exported
        #[arg(long, default_value = "0")]
        offset: u64,
    },
}

/// Storage backend selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// Local filesystem
    Local,
    /// AWS S3 or compatible
    S3,
}

/// Log line format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable
    Text,
    /// One JSON object per line
    Json,
}

/// Report output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable summary
    Text,
    /// JSON report
    Json,
}

/// Where the offset catalog lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CatalogConnection {
    /// JSON document on disk
    JsonFile {
        /// Catalog file path
        path: PathBuf,
    },
    /// In-process catalog
    Memory,
}

/// Which storage backend serves source and target objects
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StorageConnection {
    /// Local filesystem rooted at a directory
    Local {
        /// Root directory
        root: PathBuf,
    },
    /// AWS S3 or compatible
    S3 {
        /// AWS region
        region: String,
        /// Custom endpoint
        #[serde(default)]
        endpoint_url: Option<String>,
        /// Force path-style URLs
        #[serde(default)]
        force_path_style: bool,
        /// Retries per part copy
        #[serde(default = "default_s3_retries")]
        max_retries: u32,
    },
    /// In-process store
    Memory,
}

fn default_s3_retries() -> u32 {
    5
}

impl StorageConnection {
    /// URI scheme served by this backend
    pub fn scheme(&self) -> &'static str {
        match self {
            Self::Local { .. } => "local",
            Self::S3 { .. } => "s3",
            Self::Memory => "mem",
        }
    }
}

/// Contents of the optional JSON config file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    /// Target namespace
    pub target: Option<TargetNamespace>,
    /// Catalog connection
    pub catalog: Option<CatalogConnection>,
    /// Storage connection
    pub storage: Option<StorageConnection>,
    /// Rows processed in parallel
    pub concurrency: Option<usize>,
    /// Pass timeout (humantime)
    pub pass_timeout: Option<String>,
    /// Lease TTL (humantime)
    pub lease_ttl: Option<String>,
    /// Lease owner
    pub lease_owner: Option<String>,
    /// Use the pass lease
    pub use_lease: Option<bool>,
    /// Storage request rate limit
    pub requests_per_second: Option<u32>,
}

impl ConfigFile {
    /// Load a config file
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path).map_err(|e| DeltaCopyError::io(path, e))?;
        serde_json::from_slice(&data)
            .map_err(|e| DeltaCopyError::config(format!("{}: {}", path.display(), e)))
    }
}

/// Configuration handed to the orchestrator
#[derive(Debug, Clone, Serialize)]
pub struct SyncConfig {
    /// Where deltas are written
    pub target_namespace: TargetNamespace,
    /// Offset catalog
    pub catalog: CatalogConnection,
    /// Storage backend
    pub storage: StorageConnection,
    /// Rows processed in parallel
    pub concurrency: usize,
    /// Rows not started within this time are deferred to the next pass
    pub pass_timeout: Option<Duration>,
    /// Pass lease time-to-live
    pub lease_ttl: Duration,
    /// Pass lease owner
    pub lease_owner: String,
    /// Acquire the pass lease before each pass
    pub use_lease: bool,
    /// Storage request rate limit
    pub requests_per_second: Option<u32>,
}

impl SyncConfig {
    /// Create a config with default operational settings
    pub fn new(
        target_namespace: TargetNamespace,
        catalog: CatalogConnection,
        storage: StorageConnection,
    ) -> Self {
        Self {
            target_namespace,
            catalog,
            storage,
            concurrency: num_cpus::get().max(1),
            pass_timeout: None,
            lease_ttl: DEFAULT_LEASE_TTL,
            lease_owner: default_lease_owner(),
            use_lease: true,
            requests_per_second: None,
        }
    }

    /// Build from CLI arguments, the config file and environment
    pub fn from_cli(args: &CliArgs) -> Result<Self> {
        let file = match &args.config {
            Some(path) => ConfigFile::load(path)?,
            None => ConfigFile::default(),
        };

        let target_namespace = match &args.target {
            Some(target) => TargetNamespace::parse(target)?,
            None => file
                .target
                .clone()
                .ok_or_else(|| DeltaCopyError::config("target namespace is required (--target)"))?,
        };

        let catalog = catalog_from_cli(args, &file)?;
        let storage = storage_from_cli(args, &file, &target_namespace)?;

        let mut config = Self::new(target_namespace, catalog, storage);

        if let Some(n) = args.concurrency.or(file.concurrency) {
            config.concurrency = if n == 0 { num_cpus::get().max(1) } else { n };
        }
        if let Some(timeout) = args.pass_timeout.as_deref().or(file.pass_timeout.as_deref()) {
            config.pass_timeout = Some(parse_duration(timeout)?);
        }
        if let Some(ttl) = args.lease_ttl.as_deref().or(file.lease_ttl.as_deref()) {
            config.lease_ttl = parse_duration(ttl)?;
        }
        if let Some(owner) = args.lease_owner.clone().or(file.lease_owner) {
            config.lease_owner = owner;
        }
        config.use_lease = !args.no_lease && file.use_lease.unwrap_or(true);
        config.requests_per_second = args.requests_per_second.or(file.requests_per_second);

        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for consistency
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(DeltaCopyError::config("concurrency must be at least 1"));
        }
        if self.use_lease && self.lease_ttl.is_zero() {
            return Err(DeltaCopyError::config("lease TTL must be positive"));
        }
        if self.requests_per_second == Some(0) {
            return Err(DeltaCopyError::config("requests per second must be positive"));
        }
        if self.target_namespace.scheme() != self.storage.scheme() {
            return Err(DeltaCopyError::config(format!(
                "target namespace {} is not served by the {} backend",
                self.target_namespace,
                self.storage.scheme()
            )));
        }
        Ok(())
    }
}

/// Resolve the catalog connection from CLI arguments and the config file
pub fn catalog_from_cli(args: &CliArgs, file: &ConfigFile) -> Result<CatalogConnection> {
    match (&args.catalog, &file.catalog) {
        (Some(path), _) => Ok(CatalogConnection::JsonFile { path: path.clone() }),
        (None, Some(catalog)) => Ok(catalog.clone()),
        (None, None) => Err(DeltaCopyError::config("catalog path is required (--catalog)")),
    }
}

fn storage_from_cli(
    args: &CliArgs,
    file: &ConfigFile,
    target: &TargetNamespace,
) -> Result<StorageConnection> {
    let kind = match (args.storage, &file.storage) {
        (Some(kind), _) => kind,
        (None, Some(storage)) if args.local_root.is_none() && args.s3_region.is_none() => {
            return Ok(storage.clone());
        }
        (None, _) if target.scheme() == "s3" => StorageKind::S3,
        (None, _) => StorageKind::Local,
    };

    match kind {
        StorageKind::Local => {
            let root = args
                .local_root
                .clone()
                .or_else(|| match &file.storage {
                    Some(StorageConnection::Local { root }) => Some(root.clone()),
                    _ => None,
                })
                .ok_or_else(|| DeltaCopyError::config("local storage requires --local-root"))?;
            Ok(StorageConnection::Local { root })
        }
        StorageKind::S3 => {
            let (region, endpoint_url, retries) = match &file.storage {
                Some(StorageConnection::S3 { region, endpoint_url, max_retries, .. }) => {
                    (Some(region.clone()), endpoint_url.clone(), *max_retries)
                }
                _ => (None, None, default_s3_retries()),
            };
            Ok(StorageConnection::S3 {
                region: args
                    .s3_region
                    .clone()
                    .or(region)
                    .unwrap_or_else(|| "us-east-1".to_string()),
                endpoint_url: args.s3_endpoint.clone().or(endpoint_url),
                force_path_style: args.s3_path_style
                    || matches!(
                        &file.storage,
                        Some(StorageConnection::S3 { force_path_style: true, .. })
                    ),
                max_retries: retries,
            })
        }
    }
}

/// Parse a human-readable duration (e.g. "30s", "5m", "1h 30m")
pub fn parse_duration(value: &str) -> Result<Duration> {
    humantime::parse_duration(value.trim())
        .map_err(|e| DeltaCopyError::config(format!("invalid duration '{}': {}", value, e)))
}

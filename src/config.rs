use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use std::{env, fmt, path::PathBuf, str::FromStr, time::Duration};
use uuid::Uuid;

const ENV_PREFIX: &str = "TENANT_VFS_";

/// Object store the gateway talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    /// Files on disk plus SQLite metadata; serves its own presigned URLs.
    Local,
    /// Process memory; contents vanish on exit.
    Memory,
    /// S3-compatible service (AWS S3, Cloudflare R2).
    S3,
}

/// Where instance records are read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TenantSource {
    Sqlite,
    Json,
}

/// What the process does after bootstrapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunMode {
    Serve,
    /// Apply migrations and exit.
    Migrate,
    /// Settle interrupted moves and exit.
    Reconcile,
    /// Copy instance records from a JSON file into SQLite and exit.
    ImportTenants(PathBuf),
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub backend: BackendKind,
    pub storage_dir: String,
    pub database_url: String,
    pub bucket: String,
    pub s3_endpoint: Option<String>,
    pub s3_region: String,
    pub presign_secret: String,
    pub public_base_url: String,
    pub root_domain: Option<String>,
    pub tenant_directory: TenantSource,
    pub tenants_file: String,
    pub max_presign_ttl: Duration,
    pub unzip_concurrency: usize,
    pub max_unzip_entry_bytes: u64,
    pub max_unzip_total_bytes: u64,
    pub backend_retries: usize,
    pub max_list_pages: usize,
}

// The signing secret stays out of logs.
impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("backend", &self.backend)
            .field("storage_dir", &self.storage_dir)
            .field("database_url", &self.database_url)
            .field("bucket", &self.bucket)
            .field("s3_endpoint", &self.s3_endpoint)
            .field("s3_region", &self.s3_region)
            .field("public_base_url", &self.public_base_url)
            .field("root_domain", &self.root_domain)
            .field("tenant_directory", &self.tenant_directory)
            .field("tenants_file", &self.tenants_file)
            .field("max_presign_ttl", &self.max_presign_ttl)
            .field("unzip_concurrency", &self.unzip_concurrency)
            .field("max_unzip_entry_bytes", &self.max_unzip_entry_bytes)
            .field("max_unzip_total_bytes", &self.max_unzip_total_bytes)
            .field("backend_retries", &self.backend_retries)
            .field("max_list_pages", &self.max_list_pages)
            .finish_non_exhaustive()
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Multi-tenant virtual filesystem over an object store")]
pub struct Args {
    /// Host to bind to (overrides TENANT_VFS_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides TENANT_VFS_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Storage backend (overrides TENANT_VFS_BACKEND)
    #[arg(long, value_enum)]
    pub backend: Option<BackendKind>,

    /// Directory for local object payloads (overrides TENANT_VFS_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides TENANT_VFS_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Bucket holding every tenant's files (overrides TENANT_VFS_BUCKET)
    #[arg(long)]
    pub bucket: Option<String>,

    /// Custom S3 endpoint, e.g. an R2 account URL (overrides TENANT_VFS_S3_ENDPOINT)
    #[arg(long)]
    pub s3_endpoint: Option<String>,

    /// S3 region, `auto` for R2 (overrides TENANT_VFS_S3_REGION)
    #[arg(long)]
    pub s3_region: Option<String>,

    /// Secret for locally signed transfer URLs (overrides TENANT_VFS_PRESIGN_SECRET)
    #[arg(long)]
    pub presign_secret: Option<String>,

    /// Public base URL of this service (overrides TENANT_VFS_PUBLIC_BASE_URL)
    #[arg(long)]
    pub public_base_url: Option<String>,

    /// Apex domain for `{site}.{domain}` routing (overrides TENANT_VFS_ROOT_DOMAIN)
    #[arg(long)]
    pub root_domain: Option<String>,

    /// Instance record source (overrides TENANT_VFS_TENANT_DIRECTORY)
    #[arg(long, value_enum)]
    pub tenant_directory: Option<TenantSource>,

    /// JSON file of instance records (overrides TENANT_VFS_TENANTS_FILE)
    #[arg(long)]
    pub tenants_file: Option<String>,

    /// Upper bound for presigned URL lifetimes (overrides TENANT_VFS_MAX_PRESIGN_TTL_SECS)
    #[arg(long)]
    pub max_presign_ttl_secs: Option<u64>,

    /// Concurrent writes while extracting an archive (overrides TENANT_VFS_UNZIP_CONCURRENCY)
    #[arg(long)]
    pub unzip_concurrency: Option<usize>,

    /// Largest decompressed archive entry (overrides TENANT_VFS_MAX_UNZIP_ENTRY_BYTES)
    #[arg(long)]
    pub max_unzip_entry_bytes: Option<u64>,

    /// Decompressed bytes allowed per archive (overrides TENANT_VFS_MAX_UNZIP_TOTAL_BYTES)
    #[arg(long)]
    pub max_unzip_total_bytes: Option<u64>,

    /// Retries for transient backend failures (overrides TENANT_VFS_BACKEND_RETRIES)
    #[arg(long)]
    pub backend_retries: Option<usize>,

    /// Listing page cap before a result is marked truncated (overrides TENANT_VFS_MAX_LIST_PAGES)
    #[arg(long)]
    pub max_list_pages: Option<usize>,

    /// Run migrations and exit
    #[arg(long, conflicts_with_all = ["reconcile", "import_tenants"])]
    pub migrate: bool,

    /// Settle interrupted moves and exit
    #[arg(long, conflicts_with = "import_tenants")]
    pub reconcile: bool,

    /// Import instance records from a JSON file into SQLite and exit
    #[arg(long, value_name = "FILE")]
    pub import_tenants: Option<PathBuf>,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and run mode.
    pub fn from_env_and_args() -> Result<(Self, RunMode)> {
        Self::resolve(Args::parse(), |name| env::var(name).ok())
    }

    /// Merge `args` over values produced by `lookup` (keyed by full variable
    /// name), then over built-in defaults.
    pub fn resolve(
        args: Args,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(Self, RunMode)> {
        let var = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}")).filter(|value| !value.trim().is_empty())
        };

        let port = pick(args.port, parsed(&var, "PORT")?, 3000);
        let presign_secret = match args.presign_secret.or_else(|| var("PRESIGN_SECRET")) {
            Some(secret) => secret,
            None => {
                tracing::warn!(
                    "no presign secret configured; signed URLs will not survive a restart"
                );
                format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
            }
        };

        let cfg = Self {
            host: args.host.or_else(|| var("HOST")).unwrap_or_else(|| "0.0.0.0".into()),
            port,
            backend: pick(args.backend, value_enum(&var, "BACKEND")?, BackendKind::Local),
            storage_dir: args
                .storage_dir
                .or_else(|| var("STORAGE_DIR"))
                .unwrap_or_else(|| "./data/objects".into()),
            database_url: args
                .database_url
                .or_else(|| var("DATABASE_URL"))
                .unwrap_or_else(|| "sqlite://./data/meta/tenant_vfs.db".into()),
            bucket: args.bucket.or_else(|| var("BUCKET")).unwrap_or_else(|| "sites".into()),
            s3_endpoint: args.s3_endpoint.or_else(|| var("S3_ENDPOINT")),
            s3_region: args
                .s3_region
                .or_else(|| var("S3_REGION"))
                .unwrap_or_else(|| "auto".into()),
            presign_secret,
            public_base_url: args
                .public_base_url
                .or_else(|| var("PUBLIC_BASE_URL"))
                .unwrap_or_else(|| format!("http://localhost:{port}")),
            root_domain: args.root_domain.or_else(|| var("ROOT_DOMAIN")),
            tenant_directory: pick(
                args.tenant_directory,
                value_enum(&var, "TENANT_DIRECTORY")?,
                TenantSource::Sqlite,
            ),
            tenants_file: args
                .tenants_file
                .or_else(|| var("TENANTS_FILE"))
                .unwrap_or_else(|| "./data/orders.json".into()),
            max_presign_ttl: Duration::from_secs(pick(
                args.max_presign_ttl_secs,
                parsed(&var, "MAX_PRESIGN_TTL_SECS")?,
                3600,
            )),
            unzip_concurrency: pick(args.unzip_concurrency, parsed(&var, "UNZIP_CONCURRENCY")?, 8),
            max_unzip_entry_bytes: pick(
                args.max_unzip_entry_bytes,
                parsed(&var, "MAX_UNZIP_ENTRY_BYTES")?,
                64 << 20,
            ),
            max_unzip_total_bytes: pick(
                args.max_unzip_total_bytes,
                parsed(&var, "MAX_UNZIP_TOTAL_BYTES")?,
                512 << 20,
            ),
            backend_retries: pick(args.backend_retries, parsed(&var, "BACKEND_RETRIES")?, 2),
            max_list_pages: pick(args.max_list_pages, parsed(&var, "MAX_LIST_PAGES")?, 100),
        };

        if cfg.max_presign_ttl.is_zero() {
            bail!("max presign ttl must be at least one second");
        }
        if cfg.unzip_concurrency == 0 {
            bail!("unzip concurrency must be at least 1");
        }
        if cfg.max_unzip_entry_bytes == 0 || cfg.max_unzip_total_bytes == 0 {
            bail!("unzip size limits must be at least one byte");
        }
        if cfg.max_list_pages == 0 {
            bail!("max list pages must be at least 1");
        }

        let mode = if args.migrate {
            RunMode::Migrate
        } else if args.reconcile {
            RunMode::Reconcile
        } else if let Some(file) = args.import_tenants {
            RunMode::ImportTenants(file)
        } else {
            RunMode::Serve
        };

        Ok((cfg, mode))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn pick<T>(arg: Option<T>, env: Option<T>, default: T) -> T {
    arg.or(env).unwrap_or(default)
}

fn parsed<T>(var: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    var(name)
        .map(|value| {
            value
                .trim()
                .parse::<T>()
                .with_context(|| format!("parsing {ENV_PREFIX}{name} value `{value}`"))
        })
        .transpose()
}

fn value_enum<T: ValueEnum>(
    var: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>> {
    var(name)
        .map(|value| {
            T::from_str(value.trim(), true).map_err(|err| {
                anyhow::anyhow!("parsing {ENV_PREFIX}{name} value `{value}`: {err}")
            })
        })
        .transpose()
}

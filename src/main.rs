use anyhow::{Context, Result};
use axum::{ServiceExt, extract::Request};
use sqlx::SqlitePool;
use std::{fs, io::ErrorKind, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use config::{AppConfig, BackendKind, RunMode, TenantSource};
use services::{
    archive::UnzipLimits,
    gateway::{ObjectGateway, StorageGateway},
    local_store::LocalObjectStore,
    memory_store::MemoryObjectStore,
    presign::UrlSigner,
    reconcile::Reconciler,
    tenants::{JsonFileTenantDirectory, SharedTenants, SqliteTenantDirectory},
};
use state::{AppState, ServiceLimits};

mod config;
mod db;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;
mod state;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + run mode ---
    let (cfg, mode) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting tenant-vfs with config: {:?}", cfg);

    // --- Initialize SQLite connection ---
    let db = Arc::new(
        db::connect(&cfg.database_url)
            .await
            .with_context(|| format!("opening database `{}`", cfg.database_url))?,
    );
    db::run_migrations(&db).await?;

    match &mode {
        RunMode::Migrate => {
            tracing::info!("Database migration complete.");
            return Ok(());
        }
        RunMode::ImportTenants(file) => return import_tenants(db, file).await,
        RunMode::Reconcile | RunMode::Serve => {}
    }

    // --- Initialize storage backend ---
    let (backend, local) = build_backend(&cfg, db.clone()).await?;
    let gateway = StorageGateway::new(backend, cfg.backend_retries, cfg.max_list_pages);

    if mode == RunMode::Reconcile {
        let report = Reconciler::new(gateway).run().await?;
        tracing::info!(
            completed = report.completed,
            replayed = report.replayed,
            conflicts = report.conflicts,
            failed = report.failed,
            "reconciliation finished"
        );
        return Ok(());
    }

    let tenants: SharedTenants = match cfg.tenant_directory {
        TenantSource::Sqlite => Arc::new(SqliteTenantDirectory::new(db.clone())),
        TenantSource::Json => Arc::new(JsonFileTenantDirectory::new(&cfg.tenants_file)),
    };

    let state = AppState::new(
        db,
        gateway,
        tenants,
        local,
        cfg.root_domain.clone(),
        ServiceLimits {
            max_presign_ttl: cfg.max_presign_ttl,
            unzip: UnzipLimits {
                concurrency: cfg.unzip_concurrency,
                max_entry_bytes: cfg.max_unzip_entry_bytes,
                max_total_bytes: cfg.max_unzip_total_bytes,
            },
        },
    );

    // --- Build router ---
    let app = routes::routes::app(state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, ServiceExt::<Request>::into_make_service(app)).await?;

    Ok(())
}

async fn build_backend(
    cfg: &AppConfig,
    db: Arc<SqlitePool>,
) -> Result<(Arc<dyn ObjectGateway>, Option<LocalObjectStore>)> {
    match cfg.backend {
        BackendKind::Local => {
            // --- Ensure storage directory exists ---
            if !Path::new(&cfg.storage_dir).exists() {
                fs::create_dir_all(&cfg.storage_dir)?;
                tracing::info!("Created storage directory at {}", cfg.storage_dir);
            }
            let signer = UrlSigner::new(&cfg.presign_secret, &cfg.bucket, &cfg.public_base_url);
            let local = LocalObjectStore::new(db, &cfg.storage_dir, &cfg.bucket, signer);
            let backend: Arc<dyn ObjectGateway> = Arc::new(local.clone());
            Ok((backend, Some(local)))
        }
        BackendKind::Memory => {
            tracing::warn!("memory backend selected; objects are lost on exit");
            let backend: Arc<dyn ObjectGateway> = Arc::new(MemoryObjectStore::new());
            Ok((backend, None))
        }
        #[cfg(feature = "backend-s3")]
        BackendKind::S3 => {
            let store = services::s3_store::S3ObjectStore::connect(
                &cfg.bucket,
                &cfg.s3_region,
                cfg.s3_endpoint.as_deref(),
            )
            .await;
            let backend: Arc<dyn ObjectGateway> = Arc::new(store);
            Ok((backend, None))
        }
        #[cfg(not(feature = "backend-s3"))]
        BackendKind::S3 => {
            anyhow::bail!("the s3 backend requires building with `--features backend-s3`")
        }
    }
}

/// Copy the records of a JSON tenant file into the `instances` table.
async fn import_tenants(db: Arc<SqlitePool>, file: &Path) -> Result<()> {
    let records = JsonFileTenantDirectory::new(file)
        .all()
        .await
        .with_context(|| format!("reading tenant file `{}`", file.display()))?;
    let directory = SqliteTenantDirectory::new(db);
    for instance in &records {
        directory.upsert(instance).await?;
    }
    tracing::info!(count = records.len(), file = %file.display(), "tenant records imported");
    Ok(())
}

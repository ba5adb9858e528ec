//! Tenant directory: maps instance ids and subdomains to instance records.
//!
//! The instance records themselves are owned by the ordering side of the
//! application; this module only reads them. Two repositories are provided
//! and one is chosen at startup: SQLite (`instances` table) and a JSON file
//! holding the order records.

use crate::models::instance::Instance;
use async_trait::async_trait;
use sqlx::SqlitePool;
use std::{io, path::PathBuf, sync::Arc};
use thiserror::Error;
use tokio::fs;

#[derive(Debug, Error)]
pub enum TenantError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("reading tenant file: {0}")]
    Io(#[from] io::Error),
    #[error("parsing tenant file: {0}")]
    Parse(#[from] serde_json::Error),
}

pub type TenantResult<T> = Result<T, TenantError>;

#[async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn lookup_by_id(&self, id: &str) -> TenantResult<Option<Instance>>;

    async fn lookup_by_subdomain(&self, subdomain: &str) -> TenantResult<Option<Instance>>;
}

pub type SharedTenants = Arc<dyn TenantDirectory>;

/// Instance records in the `instances` table.
#[derive(Clone)]
pub struct SqliteTenantDirectory {
    db: Arc<SqlitePool>,
}

impl SqliteTenantDirectory {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Insert or replace an instance record (admin tooling and tests).
    pub async fn upsert(&self, instance: &Instance) -> TenantResult<()> {
        sqlx::query(
            "INSERT INTO instances (id, kind, subdomain) VALUES (?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET kind = excluded.kind, subdomain = excluded.subdomain",
        )
        .bind(&instance.id)
        .bind(instance.kind)
        .bind(instance.subdomain.as_ref().map(|s| s.to_ascii_lowercase()))
        .execute(&*self.db)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl TenantDirectory for SqliteTenantDirectory {
    async fn lookup_by_id(&self, id: &str) -> TenantResult<Option<Instance>> {
        let instance = sqlx::query_as::<_, Instance>(
            "SELECT id, kind, subdomain FROM instances WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&*self.db)
        .await?;
        Ok(instance)
    }

    async fn lookup_by_subdomain(&self, subdomain: &str) -> TenantResult<Option<Instance>> {
        let instance = sqlx::query_as::<_, Instance>(
            "SELECT id, kind, subdomain FROM instances WHERE subdomain = ?",
        )
        .bind(subdomain.to_ascii_lowercase())
        .fetch_optional(&*self.db)
        .await?;
        Ok(instance)
    }
}

/// Order records in a JSON array on disk.
///
/// The file is re-read on every lookup so edits made by the ordering side are
/// visible immediately. A missing file means no tenants.
#[derive(Clone)]
pub struct JsonFileTenantDirectory {
    path: PathBuf,
}

impl JsonFileTenantDirectory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Every record in the file.
    pub async fn all(&self) -> TenantResult<Vec<Instance>> {
        let raw = match fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                tracing::warn!(path = %self.path.display(), "tenant file missing");
                return Ok(Vec::new());
            }
            Err(err) => return Err(err.into()),
        };
        Ok(serde_json::from_slice(&raw)?)
    }
}

#[async_trait]
impl TenantDirectory for JsonFileTenantDirectory {
    async fn lookup_by_id(&self, id: &str) -> TenantResult<Option<Instance>> {
        Ok(self.all().await?.into_iter().find(|i| i.id == id))
    }

    async fn lookup_by_subdomain(&self, subdomain: &str) -> TenantResult<Option<Instance>> {
        Ok(self.all().await?.into_iter().find(|i| {
            i.subdomain
                .as_deref()
                .is_some_and(|s| s.eq_ignore_ascii_case(subdomain))
        }))
    }
}

/// Fixed set of instances held in memory.
#[cfg(test)]
pub struct StaticTenantDirectory(pub Vec<Instance>);

#[cfg(test)]
#[async_trait]
impl TenantDirectory for StaticTenantDirectory {
    async fn lookup_by_id(&self, id: &str) -> TenantResult<Option<Instance>> {
        Ok(self.0.iter().find(|i| i.id == id).cloned())
    }

    async fn lookup_by_subdomain(&self, subdomain: &str) -> TenantResult<Option<Instance>> {
        Ok(self
            .0
            .iter()
            .find(|i| i.subdomain.as_deref() == Some(subdomain))
            .cloned())
    }
}

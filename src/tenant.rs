//! Tenant Context Guard
//!
//! Every turn runs under exactly one immutable [`TenantContext`]. Anything
//! that touches tenant data (cache keys, files, schema lookups, pending
//! clarifications) is namespaced by `tenant_id` and checked against it.

use crate::error::{ChatBiError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

/// Identity attached at the request boundary. Never mutated mid-turn.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantContext {
    tenant_id: String,
    user_id: String,
    session_id: String,
}

impl TenantContext {
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Reject an operation aimed at another tenant.
    pub fn ensure_owns(&self, tenant_id: &str) -> Result<()> {
        if self.tenant_id == tenant_id {
            Ok(())
        } else {
            warn!(
                expected = %self.tenant_id,
                actual = %tenant_id,
                "Cross-tenant access rejected"
            );
            Err(ChatBiError::TenantMismatch {
                expected: self.tenant_id.clone(),
                actual: tenant_id.to_string(),
            })
        }
    }

    /// Cache key namespaced by tenant.
    pub fn scoped_key(&self, key: &str) -> String {
        format!("tenant:{}:{}", self.tenant_id, key)
    }

    /// Resolve `relative` below `root/<tenant_id>`, refusing anything that
    /// could escape that directory.
    pub fn scoped_path(&self, root: &Path, relative: &str) -> Result<PathBuf> {
        let rel = Path::new(relative);
        for component in rel.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => {
                    return Err(ChatBiError::Tenant(format!(
                        "Path '{}' escapes the tenant directory",
                        relative
                    )))
                }
            }
        }
        Ok(root.join(&self.tenant_id).join(rel))
    }

    /// Wrap a value as owned by this tenant.
    pub fn own<T>(&self, value: T) -> Scoped<T> {
        Scoped {
            tenant_id: self.tenant_id.clone(),
            value,
        }
    }
}

/// A value tagged with its owning tenant. Reading it requires a matching
/// context.
#[derive(Debug, Clone)]
pub struct Scoped<T> {
    tenant_id: String,
    value: T,
}

impl<T> Scoped<T> {
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn get(&self, ctx: &TenantContext) -> Result<&T> {
        ctx.ensure_owns(&self.tenant_id)?;
        Ok(&self.value)
    }

    pub fn into_inner(self, ctx: &TenantContext) -> Result<T> {
        ctx.ensure_owns(&self.tenant_id)?;
        Ok(self.value)
    }
}

/// Unvalidated identity as it arrives from the transport.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawRequest {
    pub tenant_id: Option<String>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
}

/// Tenant status as recorded by the metadata store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    Active,
    Suspended,
}

/// Lookup into the external tenant metadata store.
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn status(&self, tenant_id: &str) -> Result<Option<TenantStatus>>;
}

/// Fixed tenant list, used by the CLI and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticTenantDirectory {
    tenants: HashMap<String, TenantStatus>,
}

impl StaticTenantDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>, status: TenantStatus) -> Self {
        self.tenants.insert(tenant_id.into(), status);
        self
    }
}

#[async_trait]
impl TenantDirectory for StaticTenantDirectory {
    async fn status(&self, tenant_id: &str) -> Result<Option<TenantStatus>> {
        Ok(self.tenants.get(tenant_id).copied())
    }
}

/// Tenants are the subdirectories of the metadata root. An optional
/// `tenant.yaml` with `status: suspended` disables one.
#[derive(Debug, Clone)]
pub struct MetadataTenantDirectory {
    root: PathBuf,
}

#[derive(Deserialize)]
struct TenantManifest {
    status: TenantStatus,
}

impl MetadataTenantDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl TenantDirectory for MetadataTenantDirectory {
    async fn status(&self, tenant_id: &str) -> Result<Option<TenantStatus>> {
        if !is_valid_identifier(tenant_id) {
            return Ok(None);
        }
        let dir = self.root.join(tenant_id);
        if !dir.is_dir() {
            return Ok(None);
        }
        let manifest = dir.join("tenant.yaml");
        if !manifest.exists() {
            return Ok(Some(TenantStatus::Active));
        }
        let content = std::fs::read_to_string(&manifest)?;
        let manifest: TenantManifest = serde_yaml::from_str(&content)?;
        Ok(Some(manifest.status))
    }
}

/// Validates raw identity and produces the turn's [`TenantContext`].
pub struct TenantGuard {
    directory: Arc<dyn TenantDirectory>,
}

impl TenantGuard {
    pub fn new(directory: Arc<dyn TenantDirectory>) -> Self {
        Self { directory }
    }

    /// Fail fast on a missing, unknown or inactive tenant.
    pub async fn attach(&self, raw: &RawRequest) -> Result<TenantContext> {
        let tenant_id = required(&raw.tenant_id, "tenant_id")?;
        let user_id = required(&raw.user_id, "user_id")?;
        let session_id = match raw.session_id.as_deref().map(str::trim) {
            Some(s) if !s.is_empty() => s.to_string(),
            _ => uuid::Uuid::new_v4().to_string(),
        };

        if !is_valid_identifier(&tenant_id) {
            return Err(ChatBiError::Tenant(format!(
                "Tenant id '{}' contains invalid characters",
                tenant_id
            )));
        }

        match self.directory.status(&tenant_id).await? {
            Some(TenantStatus::Active) => Ok(TenantContext {
                tenant_id,
                user_id,
                session_id,
            }),
            Some(TenantStatus::Suspended) => Err(ChatBiError::Tenant(format!(
                "Tenant '{}' is not active",
                tenant_id
            ))),
            None => Err(ChatBiError::Tenant(format!(
                "Tenant '{}' is not registered",
                tenant_id
            ))),
        }
    }
}

fn required(value: &Option<String>, field: &str) -> Result<String> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(ChatBiError::Tenant(format!("Missing {}", field))),
    }
}

fn is_valid_identifier(id: &str) -> bool {
    id.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> TenantGuard {
        let directory = StaticTenantDirectory::new()
            .with_tenant("acme", TenantStatus::Active)
            .with_tenant("dormant", TenantStatus::Suspended);
        TenantGuard::new(Arc::new(directory))
    }

    fn raw(tenant: &str) -> RawRequest {
        RawRequest {
            tenant_id: Some(tenant.to_string()),
            user_id: Some("u-1".to_string()),
            session_id: Some("s-1".to_string()),
        }
    }

    #[tokio::test]
    async fn test_attach_active_tenant() {
        let ctx = guard().attach(&raw("acme")).await.unwrap();
        assert_eq!(ctx.tenant_id(), "acme");
        assert_eq!(ctx.session_id(), "s-1");
        assert_eq!(ctx.scoped_key("glossary"), "tenant:acme:glossary");
    }

    #[tokio::test]
    async fn test_attach_rejects_inactive_and_missing() {
        let guard = guard();
        assert!(matches!(
            guard.attach(&raw("dormant")).await,
            Err(ChatBiError::Tenant(_))
        ));
        assert!(guard.attach(&raw("unknown")).await.is_err());
        assert!(guard.attach(&RawRequest::default()).await.is_err());
        assert!(guard.attach(&raw("../etc")).await.is_err());
    }

    #[tokio::test]
    async fn test_scoped_value_rejects_other_tenant() {
        let directory = StaticTenantDirectory::new()
            .with_tenant("acme", TenantStatus::Active)
            .with_tenant("globex", TenantStatus::Active);
        let guard = TenantGuard::new(Arc::new(directory));
        let acme = guard.attach(&raw("acme")).await.unwrap();
        let globex = guard.attach(&raw("globex")).await.unwrap();

        let secret = acme.own(42);
        assert_eq!(*secret.get(&acme).unwrap(), 42);
        assert!(matches!(
            secret.get(&globex),
            Err(ChatBiError::TenantMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_metadata_directory_status() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("acme")).unwrap();
        std::fs::create_dir_all(root.path().join("dormant")).unwrap();
        std::fs::write(root.path().join("dormant").join("tenant.yaml"), "status: suspended\n").unwrap();

        let directory = MetadataTenantDirectory::new(root.path());
        assert_eq!(directory.status("acme").await.unwrap(), Some(TenantStatus::Active));
        assert_eq!(directory.status("dormant").await.unwrap(), Some(TenantStatus::Suspended));
        assert_eq!(directory.status("globex").await.unwrap(), None);
        assert_eq!(directory.status("..").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_scoped_path_stays_inside_tenant_root() {
        let ctx = guard().attach(&raw("acme")).await.unwrap();
        let root = Path::new("/data/uploads");
        assert_eq!(
            ctx.scoped_path(root, "reports/q1.csv").unwrap(),
            PathBuf::from("/data/uploads/acme/reports/q1.csv")
        );
        assert!(ctx.scoped_path(root, "../globex/q1.csv").is_err());
        assert!(ctx.scoped_path(root, "/etc/passwd").is_err());
    }
}

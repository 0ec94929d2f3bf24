//! Tenant Semantic Catalog
//!
//! One resolver and one glossary store per tenant, keyed by the tenant's
//! scoped key. On disk a tenant's metadata lives under
//! `<metadata_root>/<tenant_id>/schema/` and
//! `<metadata_root>/<tenant_id>/glossary.json`.
//!
//! A turn takes a [`SemanticSnapshot`] at its start; glossary reloads that
//! happen later are seen by the next turn only.

use crate::config::PruningConfig;
use crate::error::{ChatBiError, Result};
use crate::semantic::glossary::{BusinessGlossary, GlossaryStore};
use crate::semantic::loader::load_schema_dir;
use crate::semantic::model::SemanticSchema;
use crate::semantic::resolver::SemanticResolver;
use crate::semantic::vector_store::Embedder;
use crate::tenant::{Scoped, TenantContext};
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

struct TenantSemantics {
    resolver: Arc<SemanticResolver>,
    glossary: Arc<GlossaryStore>,
}

/// Read-only view used for the whole of one turn.
#[derive(Clone)]
pub struct SemanticSnapshot {
    pub resolver: Arc<SemanticResolver>,
    pub glossary: Arc<BusinessGlossary>,
}

pub struct SemanticCatalog {
    metadata_root: Option<PathBuf>,
    embedder: Arc<dyn Embedder>,
    pruning: PruningConfig,
    watch: Option<(Duration, CancellationToken)>,
    tenants: DashMap<String, Arc<TenantSemantics>>,
}

impl SemanticCatalog {
    pub fn new(embedder: Arc<dyn Embedder>, pruning: PruningConfig) -> Self {
        Self {
            metadata_root: None,
            embedder,
            pruning,
            watch: None,
            tenants: DashMap::new(),
        }
    }

    /// Load unknown tenants lazily from `root`.
    pub fn with_metadata_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.metadata_root = Some(root.into());
        self
    }

    /// Poll each loaded tenant's glossary file until `cancel` fires.
    pub fn with_glossary_watch(mut self, interval: Duration, cancel: CancellationToken) -> Self {
        self.watch = Some((interval, cancel));
        self
    }

    /// Install a tenant's model directly, replacing any previous one.
    pub async fn register(
        &self,
        ctx: &TenantContext,
        schema: SemanticSchema,
        glossary: GlossaryStore,
    ) -> Result<()> {
        let resolver =
            SemanticResolver::build(Arc::new(schema), Arc::clone(&self.embedder), self.pruning.clone()).await?;
        self.tenants.insert(
            ctx.scoped_key("semantics"),
            Arc::new(TenantSemantics {
                resolver: Arc::new(resolver),
                glossary: Arc::new(glossary),
            }),
        );
        Ok(())
    }

    /// The tenant's current model, loading it on first use.
    pub async fn snapshot(&self, ctx: &TenantContext) -> Result<Scoped<SemanticSnapshot>> {
        let key = ctx.scoped_key("semantics");
        let existing = self.tenants.get(&key).map(|entry| Arc::clone(entry.value()));
        let semantics = match existing {
            Some(semantics) => semantics,
            None => self.load(ctx, key).await?,
        };
        Ok(ctx.own(SemanticSnapshot {
            resolver: Arc::clone(&semantics.resolver),
            glossary: semantics.glossary.snapshot(),
        }))
    }

    async fn load(&self, ctx: &TenantContext, key: String) -> Result<Arc<TenantSemantics>> {
        let root = self.metadata_root.as_ref().ok_or_else(|| {
            ChatBiError::Tenant(format!(
                "No semantic model registered for tenant '{}'",
                ctx.tenant_id()
            ))
        })?;
        let schema_dir = ctx.scoped_path(root, "schema")?;
        let glossary_path = ctx.scoped_path(root, "glossary.json")?;

        let (schema, glossary) = tokio::task::spawn_blocking(move || -> Result<_> {
            Ok((load_schema_dir(&schema_dir)?, GlossaryStore::open(glossary_path)?))
        })
        .await
        .map_err(|e| ChatBiError::Semantic(format!("Semantic model load task failed: {}", e)))??;
        let resolver =
            SemanticResolver::build(Arc::new(schema), Arc::clone(&self.embedder), self.pruning.clone()).await?;
        let built = Arc::new(TenantSemantics {
            resolver: Arc::new(resolver),
            glossary: Arc::new(glossary),
        });

        // Another turn may have loaded the same tenant meanwhile; keep the
        // first one stored.
        let stored = Arc::clone(
            self.tenants
                .entry(key)
                .or_insert_with(|| Arc::clone(&built))
                .value(),
        );
        if Arc::ptr_eq(&stored, &built) {
            info!(tenant_id = %ctx.tenant_id(), "Loaded semantic model");
            if let Some((interval, cancel)) = &self.watch {
                Arc::clone(&stored.glossary).spawn_watcher(*interval, cancel.child_token());
            }
        }
        Ok(stored)
    }
}

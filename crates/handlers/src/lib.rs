//! LokiStack handlers (create-or-update): resolve every dependency of a stack,
//! assemble its options, record the schema status and sync the generated objects.

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::anyhow;
use lokistack_apply::{sync_all, SyncReport};
use lokistack_core::prelude::*;
use lokistack_kubehub::{StoreClient, StoreError};
use lokistack_manifests::{Images, ManifestBuilder, Options, Ruler, StackManifests, Tenants};
use tracing::{error, info, info_span, Instrument};

pub mod gateway;
pub mod metrics;
mod resolve;
pub mod rules;
pub mod status;
pub mod storage;

pub use metrics::{MetricsCollector, StackCollector};

use resolve::Resolved;

/// Everything a reconciliation needs besides the request itself; built once per process.
#[derive(Clone)]
pub struct Context {
    pub store: Arc<dyn StoreClient>,
    pub images: Images,
    pub flags: FeatureFlags,
    pub builder: Arc<dyn ManifestBuilder>,
    pub collector: Arc<dyn StackCollector>,
}

impl Context {
    pub fn new(store: Arc<dyn StoreClient>, images: Images, flags: FeatureFlags) -> Self {
        Self { store, images, flags, builder: Arc::new(StackManifests), collector: Arc::new(MetricsCollector) }
    }

    pub fn with_builder(mut self, builder: Arc<dyn ManifestBuilder>) -> Self {
        self.builder = builder;
        self
    }

    pub fn with_collector(mut self, collector: Arc<dyn StackCollector>) -> Self {
        self.collector = collector;
        self
    }
}

/// Result of one reconciliation.
#[derive(Debug)]
pub enum Outcome {
    /// Every target object converged, or the stack no longer exists.
    Success(SyncReport),
    /// The stack is misconfigured; retrying without a change will not help.
    Degraded(DegradedError),
    /// Transient failure; the caller should retry with backoff.
    Error(anyhow::Error),
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::Degraded(_) => "degraded",
            Self::Error(_) => "error",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

/// Failure of a resolution step before it is folded into an [`Outcome`].
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Degraded(#[from] DegradedError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ReconcileError {
    /// Wrap a store failure with the lookup it belongs to.
    pub(crate) fn lookup(e: StoreError, what: &str, key: impl std::fmt::Display) -> Self {
        Self::Other(anyhow::Error::new(e).context(format!("{} {}", what, key)))
    }
}

/// Drive the stack at `req` one step towards its declared state.
///
/// Dropping the returned future aborts the in-flight store call; objects synced
/// before that stay applied.
pub async fn create_or_update_lokistack(ctx: &Context, req: &NamespacedName) -> Outcome {
    let span = info_span!("create_or_update_lokistack", stack = %req);
    async move {
        match reconcile(ctx, req).await {
            Ok(report) => Outcome::Success(report),
            Err(ReconcileError::Degraded(d)) => {
                info!(reason = d.reason.as_str(), message = %d.message, "stack degraded");
                Outcome::Degraded(d)
            }
            Err(ReconcileError::Other(e)) => Outcome::Error(e),
        }
    }
    .instrument(span)
    .await
}

async fn reconcile(ctx: &Context, req: &NamespacedName) -> Result<SyncReport, ReconcileError> {
    let Some(resolved) = resolve::resolve(ctx, req, chrono::Utc::now()).await? else {
        return Ok(SyncReport::default());
    };

    let opts = assemble(ctx, &resolved)?;
    let objects = ctx.builder.build_all(&opts).map_err(|e| {
        error!(error = %format!("{:#}", e), "failed to build manifests");
        e.context("failed to build manifests")
    })?;
    info!(count = objects.len(), "manifests built");

    // Written before any object so the status never lags the rendered config.
    status::set_storage_schema_status(ctx.store.as_ref(), req, &resolved.storage.schemas)
        .await
        .map_err(|e| {
            error!(error = %format!("{:#}", e), "failed to set storage schema status");
            e
        })?;

    let total = objects.len();
    let report = sync_all(ctx.store.as_ref(), &resolved.stack, objects).await;
    if report.failures > 0 {
        return Err(anyhow!(
            "failed to configure lokistack resources {}: {} of {} objects failed",
            req,
            report.failures,
            total
        )
        .into());
    }

    // 1x.extra-small is for development only.
    if opts.stack.size != LokiStackSizeType::OneXExtraSmall {
        ctx.collector.collect(&opts.stack, &opts.name);
    }
    Ok(report)
}

/// Merge resolved inputs into generator options and run the default passes.
fn assemble(ctx: &Context, resolved: &Resolved) -> anyhow::Result<Options> {
    let stack = &resolved.stack;
    let tenancy = resolved.tenancy.clone().unwrap_or_default();
    let rules = resolved.rules.clone().unwrap_or_default();
    let mut opts = Options {
        name: resolved.request.name.clone(),
        namespace: resolved.request.namespace.clone(),
        image: ctx.images.loki.clone(),
        gateway_image: ctx.images.gateway.clone(),
        gateway_base_domain: tenancy.base_domain,
        stack: stack.spec.clone(),
        flags: ctx.flags,
        object_storage: resolved.storage.clone(),
        alerting_rules: rules.alerting,
        recording_rules: rules.recording,
        ruler: Ruler { spec: rules.ruler_spec, secret: rules.ruler_secret },
        tenants: Tenants { secrets: tenancy.secrets, configs: tenancy.configs },
        sizing: Default::default(),
    };

    ctx.builder.apply_default_settings(&mut opts).map_err(|e| {
        error!(error = %format!("{:#}", e), "failed to conform options to build settings");
        e.context("failed to conform options to build settings")
    })?;
    if ctx.flags.enable_gateway {
        ctx.builder.apply_gateway_defaults(&mut opts).map_err(|e| {
            error!(error = %format!("{:#}", e), "failed to apply defaults options to gateway settings");
            e.context("failed to apply defaults options to gateway settings")
        })?;
    }
    Ok(opts)
}

use crate::provider::{CapabilityFactory, RetryPolicy, RetryingCapability, SharedCapability};
use crate::shared::sync::lock;
use crate::storage::{OverrideEntry, OverrideSource};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Default)]
struct OverrideCache {
    entries: HashMap<String, OverrideEntry>,
    refreshed_at: Option<Instant>,
}

/// Chooses the capability a unit runs against.
///
/// Override rows are cached for `ttl`; a failed refresh keeps serving the
/// previous snapshot and retries on the next lookup. Override capabilities are
/// built once per target id with the shared credential and closed by `close`.
pub struct CapabilityResolver {
    source: Arc<dyn OverrideSource>,
    factory: Arc<dyn CapabilityFactory>,
    credential: Option<String>,
    ttl: Duration,
    retry: Option<RetryPolicy>,
    cache: tokio::sync::Mutex<OverrideCache>,
    capabilities: Mutex<HashMap<String, SharedCapability>>,
}

impl CapabilityResolver {
    pub fn new(
        source: Arc<dyn OverrideSource>,
        factory: Arc<dyn CapabilityFactory>,
        credential: Option<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            source,
            factory,
            credential: credential.filter(|value| !value.trim().is_empty()),
            ttl,
            retry: None,
            cache: tokio::sync::Mutex::new(OverrideCache::default()),
            capabilities: Mutex::new(HashMap::new()),
        }
    }

    /// Wrap every override capability built from now on in a retry decorator.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Active override for `unit`, if any.
    pub async fn override_for(&self, unit: &str) -> Option<OverrideEntry> {
        let cache = self.refreshed_cache().await;
        cache.entries.get(unit).cloned()
    }

    pub async fn all_overrides(&self) -> HashMap<String, OverrideEntry> {
        self.refreshed_cache().await.entries.clone()
    }

    /// The override capability for `unit`, or `default` when there is no
    /// active override or no shared credential to build one with.
    pub async fn capability_for(&self, unit: &str, default: &SharedCapability) -> SharedCapability {
        let Some(credential) = self.credential.as_deref() else {
            return Arc::clone(default);
        };
        let Some(entry) = self.override_for(unit).await else {
            return Arc::clone(default);
        };

        let mut built = lock(&self.capabilities);
        if let Some(existing) = built.get(&entry.target_id) {
            return Arc::clone(existing);
        }
        match self.factory.build(&entry.target_id, credential) {
            Ok(capability) => {
                let capability = match &self.retry {
                    Some(policy) => RetryingCapability::wrap(capability, policy.clone()),
                    None => capability,
                };
                tracing::info!(unit, target = %entry.target_id, "using capability override");
                built.insert(entry.target_id.clone(), Arc::clone(&capability));
                capability
            }
            Err(err) => {
                tracing::warn!(
                    unit,
                    target = %entry.target_id,
                    error = %err,
                    "override capability unavailable; using default"
                );
                Arc::clone(default)
            }
        }
    }

    /// Close and forget every cached override capability.
    pub async fn close(&self) {
        let built: Vec<SharedCapability> = lock(&self.capabilities)
            .drain()
            .map(|(_, capability)| capability)
            .collect();
        for capability in built {
            capability.close().await;
        }
    }

    pub fn cached_capability_count(&self) -> usize {
        lock(&self.capabilities).len()
    }

    async fn refreshed_cache(&self) -> tokio::sync::MutexGuard<'_, OverrideCache> {
        let mut cache = self.cache.lock().await;
        let fresh = cache
            .refreshed_at
            .is_some_and(|at| at.elapsed() < self.ttl);
        if fresh {
            return cache;
        }

        match self.source.load_active_overrides().await {
            Ok(rows) => {
                cache.entries = rows
                    .into_iter()
                    .filter(|entry| entry.active)
                    .map(|entry| (entry.unit_name.clone(), entry))
                    .collect();
                cache.refreshed_at = Some(Instant::now());
                tracing::debug!(overrides = cache.entries.len(), "override cache refreshed");
            }
            Err(err) => {
                tracing::error!(error = %err, "override cache refresh failed; serving stale entries");
            }
        }
        cache
    }
}

use agentflow::orchestration::CapabilityResolver;
use agentflow::provider::{
    Capability, CapabilityError, CapabilityFactory, Completion, RetryPolicy, SharedCapability,
};
use agentflow::storage::{OverrideEntry, OverrideSource, SqliteStore, StoreError};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::tempdir;

struct Model {
    id: String,
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl Capability for Model {
    fn id(&self) -> &str {
        &self.id
    }

    async fn complete(
        &self,
        _system_prompt: &str,
        _user_message: &str,
        _image: Option<&str>,
    ) -> Result<Completion, CapabilityError> {
        Ok(Completion::new())
    }

    async fn validate_key(&self) -> bool {
        true
    }

    async fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct CountingFactory {
    built: AtomicUsize,
    closed: Arc<AtomicUsize>,
    credentials: Mutex<Vec<String>>,
}

impl CapabilityFactory for CountingFactory {
    fn build(&self, target_id: &str, credential: &str) -> Result<SharedCapability, CapabilityError> {
        self.built.fetch_add(1, Ordering::SeqCst);
        self.credentials
            .lock()
            .expect("credentials")
            .push(credential.to_string());
        Ok(Arc::new(Model {
            id: target_id.to_string(),
            closed: Arc::clone(&self.closed),
        }))
    }
}

/// Override rows the test can rewrite or break between lookups.
#[derive(Default)]
struct ScriptedOverrides {
    rows: Mutex<Vec<OverrideEntry>>,
    failing: AtomicBool,
    loads: AtomicUsize,
}

impl ScriptedOverrides {
    fn set(&self, unit: &str, target: &str, active: bool) {
        let mut rows = self.rows.lock().expect("rows");
        rows.retain(|row| row.unit_name != unit);
        rows.push(OverrideEntry {
            unit_name: unit.to_string(),
            target_id: target.to_string(),
            active,
            updated_at: Utc::now(),
        });
    }
}

#[async_trait]
impl OverrideSource for ScriptedOverrides {
    async fn load_active_overrides(&self) -> Result<Vec<OverrideEntry>, StoreError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Join("database unavailable".to_string()));
        }
        Ok(self.rows.lock().expect("rows").clone())
    }
}

fn default_model() -> SharedCapability {
    Arc::new(Model {
        id: "default-model".to_string(),
        closed: Arc::new(AtomicUsize::new(0)),
    })
}

#[tokio::test(start_paused = true)]
async fn overrides_are_cached_for_the_ttl_window() {
    let source = Arc::new(ScriptedOverrides::default());
    source.set("scorer", "model-a", true);
    let resolver = CapabilityResolver::new(
        source.clone(),
        Arc::new(CountingFactory::default()),
        Some("key".to_string()),
        Duration::from_secs(60),
    );
    let default = default_model();

    assert_eq!(resolver.capability_for("scorer", &default).await.id(), "model-a");
    source.set("scorer", "model-b", true);
    assert_eq!(resolver.capability_for("scorer", &default).await.id(), "model-a");
    assert_eq!(source.loads.load(Ordering::SeqCst), 1);

    tokio::time::advance(Duration::from_secs(61)).await;
    assert_eq!(resolver.capability_for("scorer", &default).await.id(), "model-b");
    assert_eq!(source.loads.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn refresh_failure_keeps_serving_the_stale_cache() {
    let source = Arc::new(ScriptedOverrides::default());
    source.set("scorer", "model-a", true);
    let resolver = CapabilityResolver::new(
        source.clone(),
        Arc::new(CountingFactory::default()),
        Some("key".to_string()),
        Duration::from_secs(60),
    );
    let default = default_model();
    assert!(resolver.override_for("scorer").await.is_some());

    source.failing.store(true, Ordering::SeqCst);
    tokio::time::advance(Duration::from_secs(61)).await;

    assert_eq!(resolver.capability_for("scorer", &default).await.id(), "model-a");
    // Still stale, so the next lookup retries the source.
    resolver.override_for("scorer").await;
    assert_eq!(source.loads.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn missing_credential_or_inactive_override_falls_back_to_default() {
    let source = Arc::new(ScriptedOverrides::default());
    source.set("scorer", "model-a", true);
    source.set("tagger", "model-b", false);
    let default = default_model();

    let without_key = CapabilityResolver::new(
        source.clone(),
        Arc::new(CountingFactory::default()),
        None,
        Duration::from_secs(60),
    );
    assert_eq!(without_key.capability_for("scorer", &default).await.id(), "default-model");

    let with_key = CapabilityResolver::new(
        source,
        Arc::new(CountingFactory::default()),
        Some("key".to_string()),
        Duration::from_secs(60),
    );
    assert_eq!(with_key.capability_for("tagger", &default).await.id(), "default-model");
    assert_eq!(with_key.all_overrides().await.len(), 1);
}

#[tokio::test]
async fn override_capabilities_are_built_once_per_target_and_closed() {
    let source = Arc::new(ScriptedOverrides::default());
    source.set("scorer", "model-a", true);
    source.set("summarizer", "model-a", true);
    let factory = Arc::new(CountingFactory::default());
    let resolver = CapabilityResolver::new(
        source,
        factory.clone(),
        Some("shared-key".to_string()),
        Duration::from_secs(60),
    );
    let default = default_model();

    let first = resolver.capability_for("scorer", &default).await;
    let second = resolver.capability_for("summarizer", &default).await;

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(factory.built.load(Ordering::SeqCst), 1);
    assert_eq!(
        factory.credentials.lock().expect("credentials").clone(),
        vec!["shared-key".to_string()]
    );
    assert_eq!(resolver.cached_capability_count(), 1);

    resolver.close().await;
    assert_eq!(factory.closed.load(Ordering::SeqCst), 1);
    assert_eq!(resolver.cached_capability_count(), 0);
}

#[tokio::test]
async fn sqlite_override_rows_feed_the_resolver() {
    let dir = tempdir().expect("tempdir");
    let store = SqliteStore::open(&dir.path().join("agentflow.db")).expect("open store");
    store.ensure_schema().expect("schema");
    store
        .upsert_override(&OverrideEntry {
            unit_name: "scorer".to_string(),
            target_id: "model-a".to_string(),
            active: false,
            updated_at: Utc::now(),
        })
        .expect("insert override");
    store
        .upsert_override(&OverrideEntry {
            unit_name: "scorer".to_string(),
            target_id: "model-c".to_string(),
            active: true,
            updated_at: Utc::now(),
        })
        .expect("update override");

    let resolver = CapabilityResolver::new(
        Arc::new(store),
        Arc::new(CountingFactory::default()),
        Some("key".to_string()),
        Duration::from_secs(60),
    );
    let entry = resolver.override_for("scorer").await.expect("active override");
    assert_eq!(entry.target_id, "model-c");
}

/// Override target whose gateway drops the first two calls.
struct GatewayHiccup {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Capability for GatewayHiccup {
    fn id(&self) -> &str {
        "model-hiccup"
    }

    async fn complete(
        &self,
        _system_prompt: &str,
        _user_message: &str,
        _image: Option<&str>,
    ) -> Result<Completion, CapabilityError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < 2 {
            return Err(CapabilityError::Status {
                capability: "model-hiccup".to_string(),
                status: 502,
                message: "bad gateway".to_string(),
            });
        }
        Ok(Completion::new())
    }

    async fn validate_key(&self) -> bool {
        true
    }

    async fn close(&self) {}
}

struct HiccupFactory {
    calls: Arc<AtomicUsize>,
}

impl CapabilityFactory for HiccupFactory {
    fn build(&self, _target_id: &str, _credential: &str) -> Result<SharedCapability, CapabilityError> {
        Ok(Arc::new(GatewayHiccup {
            calls: Arc::clone(&self.calls),
        }))
    }
}

#[tokio::test(start_paused = true)]
async fn override_capabilities_retry_transient_failures() {
    let source = Arc::new(ScriptedOverrides::default());
    source.set("scorer", "model-hiccup", true);
    let calls = Arc::new(AtomicUsize::new(0));
    let resolver = CapabilityResolver::new(
        source,
        Arc::new(HiccupFactory {
            calls: Arc::clone(&calls),
        }),
        Some("key".to_string()),
        Duration::from_secs(60),
    )
    .with_retry_policy(RetryPolicy::default());

    let capability = resolver.capability_for("scorer", &default_model()).await;
    assert_eq!(capability.id(), "model-hiccup");
    capability
        .complete("system", "hello", None)
        .await
        .expect("third attempt succeeds");

    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

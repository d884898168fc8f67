//! End-to-end dispatch through the registry, loader and cascade engine.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tiered_core::{
    CascadeStep, CoreError, CoreResult, ErrorHandling, FunctionMetadata, TierKind, Version,
};
use tiered_dispatch::{DispatchConfig, Dispatcher};
use tiered_loader::{
    CircuitState, CodeRuntime, Invocable, LoaderConfig, ResilientLoader, TemplateRuntime,
};
use tiered_registry::{FunctionStore, MemoryStore};

/// Template runtime whose handles for selected ids always fail when called
struct SabotagedRuntime {
    broken: HashSet<String>,
}

struct Broken(String);

#[async_trait]
impl Invocable for Broken {
    async fn call(&self, _input: Value) -> CoreResult<Value> {
        Err(CoreError::Execution {
            message: format!("{} crashed", self.0),
        })
    }
}

impl CodeRuntime for SabotagedRuntime {
    fn instantiate(
        &self,
        metadata: &FunctionMetadata,
        source: &str,
    ) -> CoreResult<Arc<dyn Invocable>> {
        if self.broken.contains(&metadata.id) {
            return Ok(Arc::new(Broken(metadata.id.clone())));
        }
        TemplateRuntime::new().instantiate(metadata, source)
    }
}

fn deploy_code(store: &MemoryStore, id: &str, version: Version, source: &str) -> FunctionMetadata {
    store
        .deploy(
            FunctionMetadata::code(id, version, "json"),
            Some(source.to_string()),
        )
        .unwrap()
}

fn build(store: Arc<dyn FunctionStore>, runtime: Arc<dyn CodeRuntime>, config: LoaderConfig) -> Dispatcher {
    let loader = ResilientLoader::new(Arc::clone(&store), Arc::clone(&runtime), config);
    Dispatcher::new(store)
        .with_loader(loader)
        .with_runtime(runtime)
        .with_config(DispatchConfig::default())
}

#[tokio::test]
async fn cascade_fallback_rescues_failing_code_step() {
    let store = Arc::new(MemoryStore::new());
    deploy_code(&store, "f", Version::new(1, 0, 0), r#"{"never": "seen"}"#);
    deploy_code(&store, "fallback-f", Version::new(1, 0, 0), r#"{"rescued": true}"#);
    let pipeline = store
        .deploy(
            FunctionMetadata::cascade(
                "pipeline",
                Version::new(1, 0, 0),
                vec![CascadeStep::new("f", TierKind::Code).with_fallback("fallback-f")],
                ErrorHandling::Fallback,
            ),
            None,
        )
        .unwrap();

    let runtime = Arc::new(SabotagedRuntime {
        broken: HashSet::from(["f".to_string()]),
    });
    let dispatcher = build(store, runtime, LoaderConfig::default());

    let result = dispatcher.dispatch(&pipeline, json!({ "n": 1 }), None).await;

    assert_eq!(result.status, 200);
    assert_eq!(result.output().unwrap()["output"]["rescued"], true);
    let meta = result.meta();
    assert_eq!(meta.executor_type, TierKind::Cascade);
    let tiers = meta.tiers_attempted.as_ref().unwrap();
    assert_eq!(tiers[0], "code");
    assert!(tiers.iter().any(|t| t.ends_with(":fallback")));
    assert!(meta.steps_executed.unwrap() >= 2);

    let wire = serde_json::to_value(&result).unwrap();
    assert_eq!(wire["body"]["_meta"]["tiersAttempted"], json!(["code", "code:fallback"]));
}

#[tokio::test]
async fn rollback_redirects_code_dispatch() {
    let store = Arc::new(MemoryStore::new());
    deploy_code(&store, "g", Version::new(1, 0, 0), r#"{"v": 1}"#);
    deploy_code(&store, "g", Version::new(2, 0, 0), r#"{"v": 2}"#);
    let dispatcher = build(
        store,
        Arc::new(TemplateRuntime::new()),
        LoaderConfig::default(),
    );

    let before = dispatcher.invoke("g", None, json!({})).await.unwrap();
    assert_eq!(before.output(), Some(&json!({ "v": 2 })));

    let loader = dispatcher.loader().unwrap();
    loader.rollback("g", Version::new(1, 0, 0)).await.unwrap();
    assert!(loader.circuit_breaker_state("g").is_some_and(|s| s.state == CircuitState::Closed));

    let after = dispatcher.invoke("g", None, json!({})).await.unwrap();
    assert_eq!(after.output(), Some(&json!({ "v": 1 })));
    assert_eq!(after.meta().from_cache, Some(true));
}

/// Store whose code reads always fail transiently
struct FailingCode {
    inner: MemoryStore,
    code_reads: AtomicU32,
}

#[async_trait]
impl FunctionStore for FailingCode {
    async fn get_metadata(
        &self,
        id: &str,
        version: Option<&Version>,
    ) -> CoreResult<FunctionMetadata> {
        self.inner.get_metadata(id, version).await
    }

    async fn get_code(&self, _id: &str, _version: Option<&Version>) -> CoreResult<String> {
        self.code_reads.fetch_add(1, Ordering::SeqCst);
        Err(CoreError::transient("object store timeout"))
    }
}

#[tokio::test(start_paused = true)]
async fn open_breaker_fails_code_dispatch_without_storage() {
    let store = Arc::new(FailingCode {
        inner: MemoryStore::new(),
        code_reads: AtomicU32::new(0),
    });
    let metadata = deploy_code(&store.inner, "h", Version::new(1, 0, 0), "{}");
    let config = LoaderConfig::default()
        .with_jitter(false)
        .with_max_retries(1)
        .with_breaker(2, 60_000, 1);
    let dispatcher = build(store.clone(), Arc::new(TemplateRuntime::new()), config);

    for _ in 0..2 {
        let result = dispatcher.dispatch(&metadata, json!({}), None).await;
        assert_eq!(result.status, 503);
        assert_eq!(result.meta().retry_count, Some(1));
    }
    assert_eq!(store.code_reads.load(Ordering::SeqCst), 4);

    let rejected = dispatcher.dispatch(&metadata, json!({}), None).await;
    assert_eq!(rejected.status, 503);
    assert!(rejected.error().unwrap().contains("Circuit breaker open"));
    assert_eq!(store.code_reads.load(Ordering::SeqCst), 4);

    let health = dispatcher.loader().unwrap().health_check();
    assert_eq!(health.open_circuits, vec!["h".to_string()]);
}

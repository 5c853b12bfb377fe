use std::{
    collections::HashMap,
    sync::Arc,
};

use async_trait::async_trait;
use cas::{
    CasDatabase as _,
    DataId,
    MissingObject,
};
use parking_lot::Mutex;

use crate::{
    cache::{
        Fingerprint,
        FunctionCache as _,
    },
    context::Context,
    errors::EngineError,
    registry::{
        self,
        AnyValue,
        EngineKey,
    },
};

/// A completed evaluation: the value beside the id it is stored under.
#[derive(Clone, Debug)]
pub struct BuiltValue {
    pub value: AnyValue,
    pub id: DataId,
}

/// A user-registered key-to-value function. Functions are pure over their
/// declared inputs; anything else they need is requested through the
/// [`FunctionInterface`] so the engine can track the dependency edge.
#[async_trait]
pub trait Function: Send + Sync {
    async fn compute(
        &self,
        key: AnyValue,
        fi: &FunctionInterface,
        ctx: &Context,
    ) -> anyhow::Result<AnyValue>;
}

/// Resolves the function responsible for a key type.
pub trait FunctionLookupDelegate: Send + Sync {
    fn function(&self, key_identifier: &str) -> Option<Arc<dyn Function>>;
}

type EvalResult = Result<BuiltValue, Arc<anyhow::Error>>;

struct InFlight {
    receiver: async_broadcast::Receiver<EvalResult>,
}

struct EngineInner {
    functions: Arc<dyn FunctionLookupDelegate>,
    in_flight: Mutex<HashMap<Fingerprint, InFlight>>,
}

/// The request scheduler. `build` turns a key into a value through the
/// registered function for its type, deduplicating concurrent identical
/// requests, rejecting dependency cycles, and memoizing results through the
/// function cache and the CAS.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(functions: Arc<dyn FunctionLookupDelegate>) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                functions,
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub async fn build(&self, key: AnyValue, ctx: &Context) -> anyhow::Result<BuiltValue> {
        let version = registry::key_version(&key.type_identifier)?;
        let fingerprint = Fingerprint::of(&key, version);
        let description = format!("{}:{}", key.type_identifier, fingerprint.short());

        {
            let state = ctx.request_state();
            let mut graph = state.graph.lock();
            graph
                .labels
                .entry(fingerprint)
                .or_insert_with(|| description.clone());
            if let Some(parent) = ctx.requester() {
                if let Err(cycle) = graph.graph.add_edge(parent, fingerprint) {
                    let path = cycle
                        .path
                        .iter()
                        .map(|fp| graph.labels.get(fp).cloned().unwrap_or_else(|| fp.short()))
                        .collect();
                    return Err(EngineError::CycleDetected { path }.into());
                }
            }
        }

        let mut receiver = {
            let mut in_flight = self.inner.in_flight.lock();
            match in_flight.get(&fingerprint) {
                Some(entry) => {
                    tracing::debug!(key = %description, "joining in-flight evaluation");
                    entry.receiver.clone()
                },
                None => {
                    let (sender, receiver) = async_broadcast::broadcast(1);
                    in_flight.insert(
                        fingerprint,
                        InFlight {
                            receiver: receiver.clone(),
                        },
                    );
                    let engine = self.clone();
                    let eval_ctx = ctx.with_requester(fingerprint);
                    let key = key.clone();
                    let desc = description.clone();
                    // The evaluation owns its own task: abandoning one
                    // waiter must not cancel work other waiters share, and
                    // the memoized result outlives every waiter.
                    ctx.handle().spawn(async move {
                        let result = engine
                            .evaluate(key, fingerprint, &desc, &eval_ctx)
                            .await
                            .map_err(Arc::new);
                        engine.inner.in_flight.lock().remove(&fingerprint);
                        let _ = sender.broadcast(result).await;
                    });
                    receiver
                },
            }
        };

        match receiver.recv().await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(recapture_shared(&e)),
            Err(_) => Err(anyhow::anyhow!("evaluation of {description} was dropped")),
        }
    }

    /// Typed sugar over [`Engine::build`].
    pub async fn build_typed<K: EngineKey>(&self, key: &K, ctx: &Context) -> anyhow::Result<K::Value> {
        let built = self.build(AnyValue::wrap(key)?, ctx).await?;
        built.value.unpack::<K::Value>()
    }

    async fn evaluate(
        &self,
        key: AnyValue,
        fingerprint: Fingerprint,
        description: &str,
        ctx: &Context,
    ) -> anyhow::Result<BuiltValue> {
        if let Some(tracer) = ctx.tracer() {
            tracer.span_begin("evaluate", description);
        }
        let result = self.evaluate_inner(key, fingerprint, description, ctx).await;
        if let Some(tracer) = ctx.tracer() {
            if let Err(e) = &result {
                tracer.error(&format!("{description}: {e:#}"));
            }
            tracer.span_end("evaluate");
        }
        result
    }

    async fn evaluate_inner(
        &self,
        key: AnyValue,
        fingerprint: Fingerprint,
        description: &str,
        ctx: &Context,
    ) -> anyhow::Result<BuiltValue> {
        match ctx.cache().get(&fingerprint).await {
            Ok(Some(id)) => match ctx.db().get(&id).await? {
                Some(object) => {
                    let value = AnyValue::decode_from(&object.data)?;
                    registry::ensure_registered(&value.type_identifier)?;
                    tracing::debug!(key = %description, "function cache hit");
                    return Ok(BuiltValue { value, id });
                },
                None => {
                    // The cached id points at a pruned object; treat the
                    // entry as a miss and re-evaluate.
                    tracing::warn!(key = %description, %id, "stale function cache entry");
                },
            },
            Ok(None) => {},
            Err(e) => {
                tracing::warn!(key = %description, "function cache read failed: {e:#}");
            },
        }

        let function = self
            .inner
            .functions
            .function(&key.type_identifier)
            .ok_or_else(|| {
                anyhow::anyhow!("no function registered for key type {}", key.type_identifier)
            })?;
        let fi = FunctionInterface {
            engine: self.clone(),
            key_id: fingerprint,
        };
        let value = function.compute(key, &fi, ctx).await?;

        let id = ctx.db().put(Vec::new(), value.encode_to_bytes()).await?;
        if let Err(e) = ctx.cache().update(fingerprint, id.clone()).await {
            tracing::warn!(key = %description, "function cache update failed: {e:#}");
        }
        Ok(BuiltValue { value, id })
    }
}

/// Handed to every function invocation; wraps `build` for subrequests and
/// carries the invoking key's identity so dependency edges land on the
/// right node.
pub struct FunctionInterface {
    engine: Engine,
    key_id: Fingerprint,
}

impl FunctionInterface {
    pub async fn request(&self, key: AnyValue, ctx: &Context) -> anyhow::Result<BuiltValue> {
        self.engine.build(key, &ctx.with_requester(self.key_id)).await
    }

    pub async fn request_typed<K: EngineKey>(&self, key: &K, ctx: &Context) -> anyhow::Result<K::Value> {
        let built = self.request(AnyValue::wrap(key)?, ctx).await?;
        built.value.unpack::<K::Value>()
    }
}

/// Rebuilds a shareable error for the second and later waiters of a
/// deduplicated evaluation. The formatted chain is preserved in the
/// message, and structured kinds are re-attached so downcasts keep
/// working across the broadcast boundary.
fn recapture_shared(e: &Arc<anyhow::Error>) -> anyhow::Error {
    let mut err = anyhow::anyhow!("{e:#}");
    if let Some(kind) = e.downcast_ref::<EngineError>() {
        err = err.context(kind.clone());
    }
    if let Some(kind) = e.downcast_ref::<MissingObject>() {
        err = err.context(kind.clone());
    }
    err
}

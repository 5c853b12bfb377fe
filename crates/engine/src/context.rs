use std::{
    any::{
        Any,
        TypeId,
    },
    collections::HashMap,
    sync::Arc,
};

use anyhow::Context as _;
use cas::CasDatabase;
use parking_lot::Mutex;
use tokio::runtime::Handle;

use crate::{
    cache::{
        Fingerprint,
        FunctionCache,
    },
    deps::DependencyGraph,
    tracer::Tracer,
};

/// Ambient state threaded through every evaluation: the dispatch handle,
/// the CAS database, the function cache, an optional tracer, and a
/// type-tagged bag of extension values for collaborators the engine does
/// not know about (executors, pipeline delegates).
///
/// Contexts are cheap to clone and copy-on-write: `with_value` returns a
/// new context, leaving the original untouched. The dependency graph is
/// created per context root, so one `Context::new` per top-level request
/// keeps unrelated builds from aliasing cycles.
#[derive(Clone)]
pub struct Context {
    core: Arc<ContextCore>,
    extensions: Extensions,
    request: Arc<RequestState>,
    requester: Option<Fingerprint>,
}

struct ContextCore {
    handle: Handle,
    db: Arc<dyn CasDatabase>,
    cache: Arc<dyn FunctionCache>,
    tracer: Option<Arc<dyn Tracer>>,
}

pub(crate) struct RequestState {
    pub graph: Mutex<GraphState>,
}

pub(crate) struct GraphState {
    pub graph: DependencyGraph<Fingerprint>,
    pub labels: HashMap<Fingerprint, String>,
}

#[derive(Clone, Default)]
struct Extensions {
    values: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl Context {
    pub fn new(handle: Handle, db: Arc<dyn CasDatabase>, cache: Arc<dyn FunctionCache>) -> Self {
        Self {
            core: Arc::new(ContextCore {
                handle,
                db,
                cache,
                tracer: None,
            }),
            extensions: Extensions::default(),
            request: Arc::new(RequestState {
                graph: Mutex::new(GraphState {
                    graph: DependencyGraph::new(),
                    labels: HashMap::new(),
                }),
            }),
            requester: None,
        }
    }

    pub fn with_tracer(self, tracer: Arc<dyn Tracer>) -> Self {
        Self {
            core: Arc::new(ContextCore {
                handle: self.core.handle.clone(),
                db: self.core.db.clone(),
                cache: self.core.cache.clone(),
                tracer: Some(tracer),
            }),
            ..self
        }
    }

    /// Returns a context that additionally carries `value`, keyed by its
    /// type. An existing value of the same type is shadowed.
    pub fn with_value<T: Send + Sync + 'static>(&self, value: T) -> Self {
        let mut next = self.clone();
        next.extensions.values.insert(TypeId::of::<T>(), Arc::new(value));
        next
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        let value = self.extensions.values.get(&TypeId::of::<T>())?.clone();
        value.downcast().ok()
    }

    pub fn require<T: Send + Sync + 'static>(&self) -> anyhow::Result<Arc<T>> {
        self.get::<T>().with_context(|| {
            format!(
                "context is missing a required {} value",
                std::any::type_name::<T>(),
            )
        })
    }

    pub fn handle(&self) -> &Handle {
        &self.core.handle
    }

    pub fn db(&self) -> &Arc<dyn CasDatabase> {
        &self.core.db
    }

    pub fn cache(&self) -> &Arc<dyn FunctionCache> {
        &self.core.cache
    }

    pub fn tracer(&self) -> Option<&Arc<dyn Tracer>> {
        self.core.tracer.as_ref()
    }

    pub(crate) fn requester(&self) -> Option<Fingerprint> {
        self.requester
    }

    pub(crate) fn with_requester(&self, requester: Fingerprint) -> Self {
        let mut next = self.clone();
        next.requester = Some(requester);
        next
    }

    pub(crate) fn request_state(&self) -> &RequestState {
        &self.request
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use cas::InMemoryCasDatabase;
    use tokio::runtime::Handle;

    use super::Context;
    use crate::cache::InMemoryFunctionCache;

    #[derive(PartialEq, Debug)]
    struct Marker(u32);

    #[tokio::test]
    async fn test_extension_values_are_copy_on_write() {
        let ctx = Context::new(
            Handle::current(),
            Arc::new(InMemoryCasDatabase::new()),
            Arc::new(InMemoryFunctionCache::new()),
        );
        assert_eq!(ctx.get::<Marker>(), None);
        assert!(ctx.require::<Marker>().is_err());

        let extended = ctx.with_value(Marker(1));
        assert_eq!(*extended.get::<Marker>().unwrap(), Marker(1));
        // The original context is untouched.
        assert_eq!(ctx.get::<Marker>(), None);

        let shadowed = extended.with_value(Marker(2));
        assert_eq!(*shadowed.get::<Marker>().unwrap(), Marker(2));
        assert_eq!(*extended.get::<Marker>().unwrap(), Marker(1));
    }
}

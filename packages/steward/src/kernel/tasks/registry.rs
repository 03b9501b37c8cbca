//! Handler registry: task type tag → invocation capability.
//!
//! Payloads are opaque structured documents to the engine; handlers own
//! their typing. Registration replaces any prior binding for the tag. A
//! reserved task whose tag has no binding is a permanent failure
//! (`handler_not_found`), never a retry.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use anyhow::Result;

/// Type-erased async handler.
pub type AsyncTaskFn = Arc<
    dyn Fn(serde_json::Value) -> Pin<Box<dyn Future<Output = Result<serde_json::Value>> + Send>>
        + Send
        + Sync,
>;

/// Type-erased synchronous handler, offloaded to a worker thread.
pub type BlockingTaskFn =
    Arc<dyn Fn(serde_json::Value) -> Result<serde_json::Value> + Send + Sync>;

/// How the executor must invoke a handler.
#[derive(Clone)]
pub enum Invocation {
    /// Awaited directly on the cooperative dispatcher.
    Async(AsyncTaskFn),
    /// Offloaded to a worker thread; `cpu_bound` invocations additionally go
    /// through the bounded worker pool sized `configured_max`.
    Blocking {
        func: BlockingTaskFn,
        cpu_bound: bool,
    },
}

/// A registered handler and its invocation mode.
#[derive(Clone)]
pub struct HandlerSpec {
    pub invocation: Invocation,
}

/// Thread-safe map from type tag to handler.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, HandlerSpec>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async-cooperative handler. Returns true if a prior
    /// binding for the tag was replaced.
    pub fn register<F, Fut>(&self, task_type: &str, handler: F) -> bool
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
    {
        let func: AsyncTaskFn = Arc::new(move |payload| Box::pin(handler(payload)));
        self.insert(task_type, Invocation::Async(func))
    }

    /// Register a plain blocking handler, run on a generic worker thread.
    pub fn register_blocking<F>(&self, task_type: &str, handler: F) -> bool
    where
        F: Fn(serde_json::Value) -> Result<serde_json::Value> + Send + Sync + 'static,
    {
        self.insert(
            task_type,
            Invocation::Blocking {
                func: Arc::new(handler),
                cpu_bound: false,
            },
        )
    }

    /// Register a CPU-bound handler, bounded by the executor's worker pool.
    pub fn register_cpu_bound<F>(&self, task_type: &str, handler: F) -> bool
    where
        F: Fn(serde_json::Value) -> Result<serde_json::Value> + Send + Sync + 'static,
    {
        self.insert(
            task_type,
            Invocation::Blocking {
                func: Arc::new(handler),
                cpu_bound: true,
            },
        )
    }

    fn insert(&self, task_type: &str, invocation: Invocation) -> bool {
        let mut handlers = self.handlers.write().expect("registry lock poisoned");
        handlers
            .insert(task_type.to_string(), HandlerSpec { invocation })
            .is_some()
    }

    /// Resolve the handler for a tag, if one is registered.
    pub fn resolve(&self, task_type: &str) -> Option<HandlerSpec> {
        let handlers = self.handlers.read().expect("registry lock poisoned");
        handlers.get(task_type).cloned()
    }

    pub fn is_registered(&self, task_type: &str) -> bool {
        let handlers = self.handlers.read().expect("registry lock poisoned");
        handlers.contains_key(task_type)
    }

    pub fn registered_types(&self) -> Vec<String> {
        let handlers = self.handlers.read().expect("registry lock poisoned");
        handlers.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn registered_async_handler_is_resolvable_and_callable() {
        let registry = HandlerRegistry::new();
        registry.register("echo", |payload| async move { Ok(payload) });

        let spec = registry.resolve("echo").expect("handler registered");
        let Invocation::Async(func) = spec.invocation else {
            panic!("expected async invocation");
        };
        let out = func(json!({"k": 1})).await.unwrap();
        assert_eq!(out, json!({"k": 1}));
    }

    #[test]
    fn blocking_registration_carries_cpu_bound_flag() {
        let registry = HandlerRegistry::new();
        registry.register_blocking("io", |_| Ok(json!(null)));
        registry.register_cpu_bound("crunch", |_| Ok(json!(null)));

        match registry.resolve("io").unwrap().invocation {
            Invocation::Blocking { cpu_bound, .. } => assert!(!cpu_bound),
            _ => panic!("expected blocking invocation"),
        }
        match registry.resolve("crunch").unwrap().invocation {
            Invocation::Blocking { cpu_bound, .. } => assert!(cpu_bound),
            _ => panic!("expected blocking invocation"),
        }
    }

    #[test]
    fn re_registration_replaces_prior_binding() {
        let registry = HandlerRegistry::new();
        assert!(!registry.register("echo", |p| async move { Ok(p) }));
        assert!(registry.register("echo", |_| async move { Ok(json!("new")) }));
        assert_eq!(registry.registered_types(), vec!["echo".to_string()]);
    }

    #[test]
    fn unknown_tag_does_not_resolve() {
        let registry = HandlerRegistry::new();
        assert!(registry.resolve("missing").is_none());
        assert!(!registry.is_registered("missing"));
    }
}

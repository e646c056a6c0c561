//! # Flow Pipelines
//!
//! A [`Flow`] is an ordered list of async interceptors over one value type.
//! Each node receives the value and either hands back a (possibly replaced)
//! value for the next node, returns `None` to abort the pipeline, or fails.
//!
//! ## Invariants
//! - **Ordered**: nodes run strictly in registration order, one at a time.
//! - **Short-Circuit**: once a node aborts, no later node runs and
//!   [`Flow::exec`] yields `Ok(None)`.
//! - **Snapshot**: `exec` copies the node list before running it, so a node
//!   pushed while a pipeline is in progress only affects later executions.

use std::future::Future;
use std::sync::Arc;
use std::sync::RwLock;

use futures::FutureExt;
use futures::future::BoxFuture;

/// What a node resolves to: the value to continue with, or `None` to abort.
pub type FlowFuture<T> = BoxFuture<'static, anyhow::Result<Option<T>>>;

type Node<T> = Arc<dyn Fn(T) -> FlowFuture<T> + Send + Sync>;
type ErrorHook<T> = Arc<dyn Fn(&anyhow::Error, &T) + Send + Sync>;

pub struct Flow<T> {
    name: &'static str,
    nodes: RwLock<Vec<Node<T>>>,
    on_error: RwLock<Option<ErrorHook<T>>>,
}

impl<T> Flow<T>
where
    T: Clone + Send + 'static,
{
    pub fn new(name: &'static str) -> Self {
        Self { name, nodes: RwLock::new(Vec::new()), on_error: RwLock::new(None) }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Appends a node to the end of the pipeline.
    pub fn push<F, Fut>(&self, node: F)
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<T>>> + Send + 'static,
    {
        let node: Node<T> = Arc::new(move |value| node(value).boxed());
        self.nodes.write().unwrap_or_else(|e| e.into_inner()).push(node);
    }

    /// Installs the hook that swallows node failures.
    ///
    /// With a hook installed a failing node aborts the pipeline (`Ok(None)`)
    /// after the hook has seen the error and the value the node was given.
    /// Without one the failure propagates out of [`Flow::exec`].
    pub fn on_error<F>(&self, hook: F)
    where
        F: Fn(&anyhow::Error, &T) + Send + Sync + 'static,
    {
        *self.on_error.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(hook));
    }

    pub fn len(&self) -> usize {
        self.nodes.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs every node in order over `value`.
    pub async fn exec(&self, value: T) -> anyhow::Result<Option<T>> {
        let nodes: Vec<Node<T>> = self.nodes.read().unwrap_or_else(|e| e.into_inner()).clone();
        if nodes.is_empty() {
            return Ok(Some(value));
        }
        let hook = self.on_error.read().unwrap_or_else(|e| e.into_inner()).clone();

        let mut value = value;
        for (step, node) in nodes.iter().enumerate() {
            let input = hook.as_ref().map(|_| value.clone());
            match node(value).await {
                Ok(Some(next)) => value = next,
                Ok(None) => {
                    tracing::debug!(flow = self.name, step, "flow aborted");
                    return Ok(None);
                }
                Err(e) => {
                    let e = e.context(format!("flow '{}' failed at step {}", self.name, step));
                    return match (hook.as_ref(), input) {
                        (Some(hook), Some(input)) => {
                            hook(&e, &input);
                            Ok(None)
                        }
                        _ => Err(e),
                    };
                }
            }
        }
        Ok(Some(value))
    }
}

impl<T> std::fmt::Debug for Flow<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self.nodes.read().map(|n| n.len()).unwrap_or(0);
        f.debug_struct("Flow").field("name", &self.name).field("nodes", &len).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use super::*;

    #[tokio::test]
    async fn test_empty_flow_passes_value_through() {
        let flow: Flow<u32> = Flow::new("empty");
        assert!(flow.is_empty());
        assert_eq!(flow.exec(7).await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn test_nodes_run_in_order_and_replace_value() {
        let flow: Flow<Vec<&'static str>> = Flow::new("order");
        flow.push(|mut v: Vec<&'static str>| async move {
            v.push("a");
            Ok(Some(v))
        });
        flow.push(|mut v: Vec<&'static str>| async move {
            v.push("b");
            Ok(Some(v))
        });

        let out = flow.exec(Vec::new()).await.unwrap();
        assert_eq!(out, Some(vec!["a", "b"]));
    }

    #[tokio::test]
    async fn test_abort_skips_remaining_nodes() {
        let flow: Flow<u32> = Flow::new("abort");
        let ran = Arc::new(AtomicUsize::new(0));

        flow.push(|_| async { Ok(None) });
        let counter = ran.clone();
        flow.push(move |v| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok(Some(v)) }
        });

        assert_eq!(flow.exec(1).await.unwrap(), None);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_error_without_hook_propagates() {
        let flow: Flow<u32> = Flow::new("fails");
        flow.push(|_| async { Err(anyhow::anyhow!("boom")) });

        let err = flow.exec(1).await.unwrap_err();
        assert!(format!("{:#}", err).contains("boom"));
        assert!(err.to_string().contains("fails"));
    }

    #[tokio::test]
    async fn test_error_with_hook_aborts() {
        let flow: Flow<u32> = Flow::new("hooked");
        let seen = Arc::new(Mutex::new(None));

        flow.push(|v| async move { Ok(Some(v + 1)) });
        flow.push(|_| async { Err(anyhow::anyhow!("boom")) });
        let sink = seen.clone();
        flow.on_error(move |_, input| {
            *sink.lock().unwrap() = Some(*input);
        });

        assert_eq!(flow.exec(1).await.unwrap(), None);
        // The hook sees the value the failing node was given.
        assert_eq!(*seen.lock().unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_push_during_exec_affects_only_later_runs() {
        let flow: Arc<Flow<u32>> = Arc::new(Flow::new("snapshot"));
        let inner = flow.clone();
        flow.push(move |v| {
            inner.push(|v| async move { Ok(Some(v * 10)) });
            async move { Ok(Some(v)) }
        });

        assert_eq!(flow.exec(1).await.unwrap(), Some(1));
        assert_eq!(flow.len(), 2);
        assert_eq!(flow.exec(1).await.unwrap(), Some(10));
    }
}

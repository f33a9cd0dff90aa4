use async_trait::async_trait;

use crate::error::Result;
use crate::proto::PodSpec;

/// Commits a placement decision to the cluster. Invoked off the dispatch
/// path once the permit is granted; binding failures are logged by the
/// engine and leave the pod to upstream retry.
#[async_trait]
pub trait Binder: Send + Sync {
    async fn bind(&self, pod: &PodSpec, node: &str) -> Result<()>;
}

/// Binder that only logs. Useful for relay-adjacent debugging setups where
/// no cluster write should happen.
pub struct LogBinder;

#[async_trait]
impl Binder for LogBinder {
    async fn bind(&self, pod: &PodSpec, node: &str) -> Result<()> {
        tracing::info!(pod = %pod.name, namespace = %pod.namespace, node, "pod bound");
        Ok(())
    }
}

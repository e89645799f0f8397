use thiserror::Error;

use crate::store::StoreError;

pub type LbResult<T> = Result<T, LbError>;

#[derive(Debug, Error)]
pub enum LbError {
    #[error("store error while {context}: {source}")]
    Store {
        context: String,
        #[source]
        source: StoreError,
    },
    #[error("no prefix configured for internal load balancers")]
    MissingPrefixConfig,
    #[error("timeout waiting for load balancer {name} to become {goal}")]
    WaitTimeout { name: String, goal: &'static str },
    #[error("no nodes available for load balancer {name}")]
    NoNodesAvailable { name: String },
    #[error("service was skipped")]
    SkipService,
    #[error("kube error: {0}")]
    KubeError(#[from] kube::Error),
}

impl LbError {
    /// Wrap a store failure with the operation that was attempted, so the
    /// caller has enough context to log and re-drive the reconcile.
    pub fn store(context: impl Into<String>, source: StoreError) -> Self {
        Self::Store {
            context: context.into(),
            source,
        }
    }
}

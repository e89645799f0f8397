use std::time::Duration;

use clap::Parser;
use tracing::level_filters::LevelFilter;

use crate::backoff::Backoff;
use crate::consts;

#[derive(Debug, Clone, Parser)]
pub struct OperatorConfig {
    /// Namespace in the control plane where all managed objects live.
    #[arg(long, env = "FERROLB_NAMESPACE")]
    pub namespace: String,

    /// Name of the control-plane network load balancers attach to.
    /// Only network interfaces on this network become destinations.
    #[arg(long, env = "FERROLB_NETWORK_NAME")]
    pub network_name: String,

    /// Prefix resource internal load balancers allocate their IPs from.
    /// Required as soon as a service requests an internal load balancer.
    #[arg(long, env = "FERROLB_PREFIX_NAME", default_value = None)]
    pub prefix_name: Option<String>,

    /// Cluster name. Part of every derived load balancer name, so it must
    /// stay stable across restarts.
    #[arg(long, env = "FERROLB_CLUSTER_NAME")]
    pub cluster_name: String,

    /// Initial delay of the activation/deletion poll.
    #[arg(
        long,
        env = "FERROLB_WAIT_INITIAL_DELAY_SECS",
        default_value_t = consts::DEFAULT_WAIT_INITIAL_DELAY_SECS
    )]
    pub wait_initial_delay_secs: u64,

    /// Multiplier applied to the poll delay after every attempt.
    #[arg(long, env = "FERROLB_WAIT_FACTOR", default_value_t = consts::DEFAULT_WAIT_FACTOR)]
    pub wait_factor: f64,

    /// Maximum number of poll attempts before giving up with a timeout.
    #[arg(long, env = "FERROLB_WAIT_STEPS", default_value_t = consts::DEFAULT_WAIT_STEPS)]
    pub wait_steps: u32,

    /// Skip the post-activation refresh of the routing object's `updated`
    /// label. The refresh only exists to invalidate a downstream cache.
    #[arg(long, env = "FERROLB_SKIP_ROUTING_REFRESH", default_value = "false")]
    pub skip_routing_refresh: bool,

    // Log level of the operator.
    #[arg(long, env = "FERROLB_LOG_LEVEL", default_value = "INFO")]
    pub log_level: LevelFilter,
}

impl OperatorConfig {
    #[must_use]
    pub fn wait_backoff(&self) -> Backoff {
        Backoff {
            initial_delay: Duration::from_secs(self.wait_initial_delay_secs),
            factor: self.wait_factor,
            steps: self.wait_steps,
        }
    }
}

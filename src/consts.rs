/// Service annotation that opts a load balancer into the internal type.
pub const INTERNAL_LB_ANNOTATION: &str = "service.beta.kubernetes.io/ferrolb-load-balancer-internal";

// Annotations stamped onto every managed LoadBalancer object.
pub const ANNOTATION_CLUSTER_NAME: &str = "cluster-name";
pub const ANNOTATION_SERVICE_NAME: &str = "service-name";
pub const ANNOTATION_SERVICE_NAMESPACE: &str = "service-namespace";
pub const ANNOTATION_SERVICE_UID: &str = "service-uid";

/// Label on the routing object bumped after every successful activation
/// so downstream consumers drop their cached view.
pub const ROUTING_UPDATED_LABEL: &str = "updated";

/// Field owner used for all server-side applies issued by this operator.
pub const FIELD_OWNER: &str = "ferrolb.dev/loadbalancer";

pub const FINALIZER_NAME: &str = "ferrolb.dev/finalizer";

// Pacing of the activation and deletion polls.
pub const DEFAULT_WAIT_INITIAL_DELAY_SECS: u64 = 1;
pub const DEFAULT_WAIT_FACTOR: f64 = 1.2;
pub const DEFAULT_WAIT_STEPS: u32 = 19;

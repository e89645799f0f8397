#![warn(
    // Base lints.
    clippy::all,
    // Some pedantic lints.
    clippy::pedantic,
    // New lints which are cool.
    clippy::nursery,
)]
#![
    allow(
        // I don't care about this.
        clippy::module_name_repetitions,
        // Yo, the hell you should put
        // it in docs, if signature is clear as sky.
        clippy::missing_errors_doc
    )
]

use clap::Parser;
use config::OperatorConfig;
use error::{LbError, LbResult};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Node, Service};
use kube::{
    api::{ListParams, Patch, PatchParams},
    runtime::{controller::Action, watcher, Controller},
    Resource, ResourceExt,
};
use lb::{LoadBalancerManager, LoadBalancerRequest};
use serde_json::json;
use std::{sync::Arc, time::Duration};
use store::KubeStore;

pub mod api;
pub mod backoff;
pub mod config;
pub mod consts;
pub mod destinations;
pub mod error;
pub mod finalizers;
pub mod lb;
pub mod store;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> LbResult<()> {
    dotenvy::dotenv().ok();
    let operator_config = OperatorConfig::parse();
    tracing_subscriber::fmt()
        .with_max_level(operator_config.log_level)
        .init();

    tracing::info!("Starting ferrolb operator v{}", env!("CARGO_PKG_VERSION"));
    let kube_client = kube::Client::try_default().await?;
    tracing::info!("Kube client is connected");

    let manager = LoadBalancerManager::new(
        KubeStore::new(kube_client.clone()),
        operator_config.namespace.clone(),
        operator_config.network_name.clone(),
        operator_config.prefix_name.clone(),
        operator_config.wait_backoff(),
        !operator_config.skip_routing_refresh,
    );
    let context = Arc::new(CurrentContext::new(
        kube_client.clone(),
        operator_config,
        manager,
    ));

    tracing::info!("Starting the controller");
    Controller::new(
        kube::Api::<Service>::all(kube_client),
        watcher::Config::default(),
    )
    .run(reconcile_service, on_error, context)
    .for_each(|reconcilation_result| async move {
        match reconcilation_result {
            Ok((service, _action)) => {
                tracing::info!("Reconcilation of a service {} was successful", service.name);
            }
            Err(err) => match err {
                // During reconcilation process,
                // the controller has decided to skip the service.
                kube::runtime::controller::Error::ReconcilerFailed(LbError::SkipService, _) => {}
                _ => {
                    tracing::error!("Error reconciling service: {:#?}", err);
                }
            },
        }
    })
    .await;
    Ok(())
}

pub struct CurrentContext {
    pub client: kube::Client,
    pub config: OperatorConfig,
    pub manager: LoadBalancerManager<KubeStore>,
}

impl CurrentContext {
    #[must_use]
    pub const fn new(
        client: kube::Client,
        config: OperatorConfig,
        manager: LoadBalancerManager<KubeStore>,
    ) -> Self {
        Self {
            client,
            config,
            manager,
        }
    }
}

/// Reconcile the service.
/// This function is called by the controller for each service event.
/// It drives the control-plane load balancer to the desired state and
/// reports the allocated IPs back on the service status. If the service
/// is being deleted, it tears the load balancer down first.
#[tracing::instrument(skip(svc, context), fields(service = svc.name_any()))]
pub async fn reconcile_service(
    svc: Arc<Service>,
    context: Arc<CurrentContext>,
) -> LbResult<Action> {
    let svc_type = svc
        .spec
        .as_ref()
        .and_then(|s| s.type_.as_ref())
        .map_or("ClusterIP", String::as_str);
    if svc_type != "LoadBalancer" {
        tracing::debug!("Service type is not LoadBalancer. Skipping...");
        return Err(LbError::SkipService);
    }

    tracing::info!("Starting service reconcilation");
    let request = LoadBalancerRequest::from_service(&svc, &context.config.cluster_name);

    // If the service is being deleted, tear down the load balancer and
    // release the service.
    if svc.meta().deletion_timestamp.is_some() {
        tracing::info!("Service deletion detected. Cleaning up resources.");
        context.manager.delete(&request).await?;
        finalizers::remove(context.client.clone(), &svc).await?;
        return Ok(Action::await_change());
    }

    // Add finalizer if it's not there yet.
    if !finalizers::check(&svc) {
        finalizers::add(context.client.clone(), &svc).await?;
    }

    let nodes = list_nodes(&context).await?;
    let ingress = context.manager.ensure(&request, &nodes).await?;
    report_ingress(&svc, &context, &ingress).await?;

    Ok(Action::requeue(Duration::from_secs(30)))
}

async fn list_nodes(context: &Arc<CurrentContext>) -> LbResult<Vec<Node>> {
    let nodes_api = kube::Api::<Node>::all(context.client.clone());
    let nodes = nodes_api
        .list(&ListParams::default())
        .await?
        .into_iter()
        .collect();
    Ok(nodes)
}

/// Writes the allocated IPs onto the service's load balancer status.
async fn report_ingress(
    svc: &Arc<Service>,
    context: &Arc<CurrentContext>,
    ingress: &[lb::IngressIp],
) -> LbResult<()> {
    if ingress.is_empty() {
        return Ok(());
    }
    let svc_api = kube::Api::<Service>::namespaced(
        context.client.clone(),
        svc.namespace()
            .unwrap_or_else(|| context.client.default_namespace().to_string())
            .as_str(),
    );
    let entries = ingress
        .iter()
        .map(|entry| json!({"ip": entry.ip}))
        .collect::<Vec<_>>();
    svc_api
        .patch_status(
            svc.name_any().as_str(),
            &PatchParams::default(),
            &Patch::Merge(json!({
                "status": {
                    "loadBalancer": {
                        "ingress": entries
                    }
                }
            })),
        )
        .await?;
    Ok(())
}

/// Handle the error during reconcilation.
#[allow(clippy::needless_pass_by_value)]
fn on_error(_: Arc<Service>, error: &LbError, _context: Arc<CurrentContext>) -> Action {
    match error {
        LbError::SkipService => Action::await_change(),
        _ => Action::requeue(Duration::from_secs(30)),
    }
}

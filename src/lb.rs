//! Load balancer reconciliation against the metal control plane.
//!
//! Every reconcile derives the load balancer's identity and desired spec from
//! the service, applies both the load balancer and its routing object with
//! forced field ownership, and then waits for the control plane to allocate
//! IPs. Repeated applies are convergent, so calls for the same identity need
//! no internal serialization.

use std::collections::BTreeMap;

use chrono::{SecondsFormat, Utc};
use k8s_openapi::api::core::v1::{Node, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::ResourceExt;

use crate::api::{
    self, EphemeralPrefixSource, IpSource, LoadBalancer, LoadBalancerPort, LoadBalancerRouting,
    LoadBalancerSpec, LoadBalancerType, LocalObjectReference, LocalUidReference, Network,
    PrefixSpec, PrefixTemplateSpec,
};
use crate::backoff::{self, Backoff, WaitError};
use crate::consts;
use crate::destinations::resolve_destinations;
use crate::error::{LbError, LbResult};
use crate::store::Store;

/// Derives the stable load balancer name for a service. The delimiter policy
/// must never change or existing services resolve to new identities across
/// restarts.
#[must_use]
pub fn load_balancer_name(cluster_name: &str, service_name: &str, service_uid: &str) -> String {
    let suffix = service_uid.split('-').next().unwrap_or_default();
    format!("{cluster_name}-{service_name}-{suffix}")
}

/// One ingress entry reported back to the caller, 1:1 from `status.ips`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressIp {
    pub ip: String,
}

/// Everything a single reconcile needs to know about the service, captured
/// up front so the reconcile itself never re-reads the service.
#[derive(Debug, Clone)]
pub struct LoadBalancerRequest {
    pub cluster_name: String,
    pub service_name: String,
    pub service_namespace: String,
    pub service_uid: String,
    pub ports: Vec<LoadBalancerPort>,
    pub ip_families: Vec<String>,
    pub internal: bool,
    /// Ingress the service currently reports, used to spot stale reads
    /// right after a type flip.
    pub current_ingress: Vec<IngressIp>,
}

impl LoadBalancerRequest {
    #[must_use]
    pub fn from_service(service: &Service, cluster_name: &str) -> Self {
        let spec = service.spec.clone().unwrap_or_default();
        let ports = spec
            .ports
            .unwrap_or_default()
            .into_iter()
            .map(|port| LoadBalancerPort {
                protocol: Some(port.protocol.unwrap_or_else(|| "TCP".to_string())),
                port: port.port,
            })
            .collect();
        let internal = service
            .annotations()
            .get(consts::INTERNAL_LB_ANNOTATION)
            .is_some_and(|value| value == "true");
        let current_ingress = service
            .status
            .as_ref()
            .and_then(|status| status.load_balancer.as_ref())
            .and_then(|lb| lb.ingress.as_ref())
            .map(|ingress| {
                ingress
                    .iter()
                    .filter_map(|entry| entry.ip.clone())
                    .map(|ip| IngressIp { ip })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            cluster_name: cluster_name.to_string(),
            service_name: service.name_any(),
            service_namespace: service.namespace().unwrap_or_default(),
            service_uid: service.uid().unwrap_or_default(),
            ports,
            ip_families: spec.ip_families.unwrap_or_default(),
            internal,
            current_ingress,
        }
    }

    #[must_use]
    pub fn load_balancer_name(&self) -> String {
        load_balancer_name(&self.cluster_name, &self.service_name, &self.service_uid)
    }

    const fn desired_type(&self) -> LoadBalancerType {
        if self.internal {
            LoadBalancerType::Internal
        } else {
            LoadBalancerType::Public
        }
    }
}

/// Reconciles load balancers and their routing objects in one namespace of
/// the control plane.
pub struct LoadBalancerManager<S> {
    store: S,
    namespace: String,
    network_name: String,
    prefix_name: Option<String>,
    backoff: Backoff,
    refresh_routing: bool,
}

impl<S: Store> LoadBalancerManager<S> {
    pub fn new(
        store: S,
        namespace: impl Into<String>,
        network_name: impl Into<String>,
        prefix_name: Option<String>,
        backoff: Backoff,
        refresh_routing: bool,
    ) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            network_name: network_name.into(),
            prefix_name,
            backoff,
            refresh_routing,
        }
    }

    /// Current ingress of the load balancer, or `None` when it does not
    /// exist.
    pub async fn get_ingress(
        &self,
        request: &LoadBalancerRequest,
    ) -> LbResult<Option<Vec<IngressIp>>> {
        let name = request.load_balancer_name();
        match self.store.get::<LoadBalancer>(&self.namespace, &name).await {
            Ok(lb) => Ok(Some(ingress_of(&lb))),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(LbError::store(format!("fetching load balancer {name}"), err)),
        }
    }

    /// Drives the load balancer for `request` to the desired state and
    /// returns its ingress once the control plane has allocated IPs.
    #[tracing::instrument(skip_all, fields(load_balancer = %request.load_balancer_name()))]
    pub async fn ensure(
        &self,
        request: &LoadBalancerRequest,
        nodes: &[Node],
    ) -> LbResult<Vec<IngressIp>> {
        let name = request.load_balancer_name();
        let desired_type = request.desired_type();

        let mut previous_type = None;
        match self.store.get::<LoadBalancer>(&self.namespace, &name).await {
            Ok(existing) => {
                previous_type = Some(existing.spec.type_);
                if existing.spec.type_ != desired_type {
                    // The allocation source differs per type, so the old
                    // object and its IP must go before the new one exists.
                    tracing::info!(
                        current = ?existing.spec.type_,
                        desired = ?desired_type,
                        "load balancer type changed, recreating"
                    );
                    self.delete(request).await?;
                }
            }
            Err(err) if err.is_not_found() => {}
            Err(err) => {
                return Err(LbError::store(format!("fetching load balancer {name}"), err))
            }
        }

        let desired = self.desired_load_balancer(request, desired_type)?;
        tracing::debug!("applying load balancer");
        let applied = self
            .store
            .apply_forced(&desired)
            .await
            .map_err(|err| LbError::store(format!("applying load balancer {name}"), err))?;

        self.apply_routing(&applied, nodes).await?;

        let ingress = self
            .wait_active(&name, previous_type, &request.current_ingress)
            .await?;
        if self.refresh_routing {
            self.touch_routing(&name).await?;
        }
        tracing::info!("load balancer became ready");
        Ok(ingress)
    }

    /// Recomputes the destination set after a node-set change. The computed
    /// set replaces the stored one wholesale.
    #[tracing::instrument(skip_all, fields(load_balancer = %request.load_balancer_name()))]
    pub async fn update_destinations(
        &self,
        request: &LoadBalancerRequest,
        nodes: &[Node],
    ) -> LbResult<()> {
        let name = request.load_balancer_name();
        if nodes.is_empty() {
            // Never silently point a live load balancer at zero destinations.
            return Err(LbError::NoNodesAvailable { name });
        }

        let lb: LoadBalancer = self
            .store
            .get(&self.namespace, &name)
            .await
            .map_err(|err| LbError::store(format!("fetching load balancer {name}"), err))?;
        let mut routing: LoadBalancerRouting = self
            .store
            .get(&self.namespace, &name)
            .await
            .map_err(|err| LbError::store(format!("fetching routing for load balancer {name}"), err))?;

        routing.destinations =
            resolve_destinations(&self.store, &self.namespace, nodes, &lb.spec.network_ref.name)
                .await?;
        self.store
            .patch_merge(&routing)
            .await
            .map_err(|err| LbError::store(format!("patching routing for load balancer {name}"), err))?;
        Ok(())
    }

    /// Deletes the load balancer and waits until it is gone. Deleting an
    /// absent load balancer succeeds.
    #[tracing::instrument(skip_all, fields(load_balancer = %request.load_balancer_name()))]
    pub async fn delete(&self, request: &LoadBalancerRequest) -> LbResult<()> {
        let name = request.load_balancer_name();
        match self
            .store
            .delete::<LoadBalancer>(&self.namespace, &name)
            .await
        {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {
                tracing::debug!("load balancer is already gone");
                return Ok(());
            }
            Err(err) => {
                return Err(LbError::store(format!("deleting load balancer {name}"), err))
            }
        }
        self.wait_deleted(&name).await
    }

    fn desired_load_balancer(
        &self,
        request: &LoadBalancerRequest,
        type_: LoadBalancerType,
    ) -> LbResult<LoadBalancer> {
        let ips = if type_ == LoadBalancerType::Internal {
            let prefix = self
                .prefix_name
                .as_ref()
                .ok_or(LbError::MissingPrefixConfig)?;
            Some(vec![IpSource {
                ephemeral: Some(EphemeralPrefixSource {
                    prefix_template: Some(PrefixTemplateSpec {
                        spec: PrefixSpec {
                            // TODO: drop the IPv4 pin once the platform
                            // allocates prefixes for IPv6 families.
                            ip_family: "IPv4".to_string(),
                            parent_ref: LocalObjectReference {
                                name: prefix.clone(),
                            },
                        },
                    }),
                }),
            }])
        } else {
            None
        };

        let mut lb = LoadBalancer::new(
            &request.load_balancer_name(),
            LoadBalancerSpec {
                type_,
                ip_families: request.ip_families.clone(),
                network_ref: LocalObjectReference {
                    name: self.network_name.clone(),
                },
                ports: request.ports.clone(),
                ips,
            },
        );
        lb.metadata.namespace = Some(self.namespace.clone());
        lb.metadata.annotations = Some(BTreeMap::from([
            (
                consts::ANNOTATION_CLUSTER_NAME.to_string(),
                request.cluster_name.clone(),
            ),
            (
                consts::ANNOTATION_SERVICE_NAME.to_string(),
                request.service_name.clone(),
            ),
            (
                consts::ANNOTATION_SERVICE_NAMESPACE.to_string(),
                request.service_namespace.clone(),
            ),
            (
                consts::ANNOTATION_SERVICE_UID.to_string(),
                request.service_uid.clone(),
            ),
        ]));
        Ok(lb)
    }

    /// Writes the routing object for `lb`: the resolved destination set plus
    /// a back-reference to the owning load balancer for cascading deletes.
    async fn apply_routing(&self, lb: &LoadBalancer, nodes: &[Node]) -> LbResult<()> {
        let destinations =
            resolve_destinations(&self.store, &self.namespace, nodes, &lb.spec.network_ref.name)
                .await?;

        let network: Network = self
            .store
            .get(&self.namespace, &lb.spec.network_ref.name)
            .await
            .map_err(|err| {
                LbError::store(format!("fetching network {}", lb.spec.network_ref.name), err)
            })?;

        let name = lb.name_any();
        let routing = LoadBalancerRouting {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(self.namespace.clone()),
                owner_references: Some(vec![OwnerReference {
                    api_version: api::networking_api_version(),
                    kind: "LoadBalancer".to_string(),
                    name: name.clone(),
                    uid: lb.uid().unwrap_or_default(),
                    ..OwnerReference::default()
                }]),
                ..ObjectMeta::default()
            },
            network_ref: LocalUidReference {
                name: network.name_any(),
                uid: network.uid().unwrap_or_default(),
            },
            destinations,
            ..LoadBalancerRouting::default()
        };

        tracing::debug!(destinations = routing.destinations.len(), "applying routing");
        self.store
            .apply_forced(&routing)
            .await
            .map_err(|err| LbError::store(format!("applying routing for load balancer {name}"), err))?;
        Ok(())
    }

    async fn wait_active(
        &self,
        name: &str,
        previous_type: Option<LoadBalancerType>,
        prior_ingress: &[IngressIp],
    ) -> LbResult<Vec<IngressIp>> {
        tracing::debug!("waiting for load balancer to become ready");
        let store = &self.store;
        let namespace = self.namespace.as_str();
        let outcome = backoff::wait_for(self.backoff, move || async move {
            let lb: LoadBalancer = store.get(namespace, name).await?;
            let ingress = ingress_of(&lb);
            if ingress.is_empty() {
                return Ok(None);
            }
            // Right after a type flip an unchanged externally-reported
            // ingress looks like a stale read; keep polling. Note this can
            // also defer a legitimate re-allocation of the same IPs until
            // the budget runs out.
            if previous_type != Some(lb.spec.type_) && ingress == prior_ingress {
                return Ok(None);
            }
            Ok(Some(ingress))
        })
        .await;

        match outcome {
            Ok(ingress) => Ok(ingress),
            Err(WaitError::Timeout) => Err(LbError::WaitTimeout {
                name: name.to_string(),
                goal: "ready",
            }),
            Err(WaitError::Failed(err)) => {
                Err(LbError::store(format!("polling load balancer {name}"), err))
            }
        }
    }

    async fn wait_deleted(&self, name: &str) -> LbResult<()> {
        tracing::debug!("waiting for load balancer to be deleted");
        let store = &self.store;
        let namespace = self.namespace.as_str();
        let outcome = backoff::wait_for(self.backoff, move || async move {
            match store.get::<LoadBalancer>(namespace, name).await {
                Ok(_) => Ok(None),
                Err(err) if err.is_not_found() => Ok(Some(())),
                Err(err) => Err(err),
            }
        })
        .await;

        match outcome {
            Ok(()) => Ok(()),
            Err(WaitError::Timeout) => Err(LbError::WaitTimeout {
                name: name.to_string(),
                goal: "deleted",
            }),
            Err(WaitError::Failed(err)) => {
                Err(LbError::store(format!("polling load balancer {name}"), err))
            }
        }
    }

    /// Bumps the `updated` label on the routing object so a downstream
    /// consumer drops its cached view of the destination set.
    async fn touch_routing(&self, name: &str) -> LbResult<()> {
        let mut routing: LoadBalancerRouting = self
            .store
            .get(&self.namespace, name)
            .await
            .map_err(|err| LbError::store(format!("fetching routing for load balancer {name}"), err))?;

        let stamp = Utc::now()
            .to_rfc3339_opts(SecondsFormat::Secs, true)
            .replace(':', "-");
        let stamp = stamp.trim_end_matches('Z').to_string();
        routing
            .metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(consts::ROUTING_UPDATED_LABEL.to_string(), stamp);

        self.store
            .patch_merge(&routing)
            .await
            .map_err(|err| LbError::store(format!("refreshing routing for load balancer {name}"), err))?;
        Ok(())
    }
}

fn ingress_of(lb: &LoadBalancer) -> Vec<IngressIp> {
    lb.status
        .as_ref()
        .map(|status| {
            status
                .ips
                .iter()
                .map(|ip| IngressIp { ip: ip.clone() })
                .collect()
        })
        .unwrap_or_default()
}

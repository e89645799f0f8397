//! Destination resolution: which network interfaces should receive traffic.
//!
//! Walks node -> machine -> network interface and keeps the interfaces on the
//! load balancer's network. A node whose machine is not registered yet is
//! skipped; a declared interface that cannot be fetched aborts the whole
//! resolution, since a half-computed destination set must never be applied.

use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;

use crate::api::{LocalUidReference, Machine, NetworkInterface};
use crate::error::{LbError, LbResult};
use crate::store::Store;

/// Machine name encoded in a node's provider ID, i.e. the substring after
/// the last `/`. Empty when the ID carries no separator or ends in one.
#[must_use]
pub fn machine_name_from_provider_id(provider_id: &str) -> &str {
    match provider_id.rfind('/') {
        Some(idx) => &provider_id[idx + 1..],
        None => "",
    }
}

/// Resolves the destination set for `nodes` on `network_name`, deduplicated
/// and sorted ascending by interface UID so repeated applies stay stable
/// regardless of input order.
pub async fn resolve_destinations<S: Store>(
    store: &S,
    namespace: &str,
    nodes: &[Node],
    network_name: &str,
) -> LbResult<Vec<LocalUidReference>> {
    let mut destinations = Vec::new();
    for node in nodes {
        let provider_id = node
            .spec
            .as_ref()
            .and_then(|spec| spec.provider_id.as_deref())
            .unwrap_or_default();
        let machine_name = machine_name_from_provider_id(provider_id);
        if machine_name.is_empty() {
            tracing::debug!(node = %node.name_any(), "node has no usable provider id, skipping");
            continue;
        }

        let machine: Machine = match store.get(namespace, machine_name).await {
            Ok(machine) => machine,
            Err(err) if err.is_not_found() => {
                tracing::debug!(node = %node.name_any(), machine = machine_name, "machine not registered yet, skipping node");
                continue;
            }
            Err(err) => {
                return Err(LbError::store(
                    format!("fetching machine {machine_name} for node {}", node.name_any()),
                    err,
                ))
            }
        };

        for attachment in &machine.spec.network_interfaces {
            let interface_name = attachment
                .network_interface_ref
                .as_ref()
                .map_or_else(|| format!("{machine_name}-{}", attachment.name), |r| r.name.clone());

            let interface: NetworkInterface =
                store.get(namespace, &interface_name).await.map_err(|err| {
                    LbError::store(
                        format!(
                            "fetching network interface {interface_name} for machine {machine_name}"
                        ),
                        err,
                    )
                })?;

            if interface.spec.network_ref.name == network_name {
                destinations.push(LocalUidReference {
                    name: interface.name_any(),
                    uid: interface.uid().unwrap_or_default(),
                });
            }
        }
    }

    destinations.sort_by(|a, b| a.uid.cmp(&b.uid));
    destinations.dedup_by(|a, b| a.uid == b.uid);
    Ok(destinations)
}

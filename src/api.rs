//! Control-plane resource types managed or read by the operator.

use std::borrow::Cow;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::NamespaceResourceScope;
use kube::CustomResource;
use serde::{Deserialize, Serialize};

pub const NETWORKING_GROUP: &str = "networking.metalcore.dev";
pub const API_VERSION: &str = "v1alpha1";

/// `apiVersion` of the networking group, as written on the wire.
#[must_use]
pub fn networking_api_version() -> String {
    format!("{NETWORKING_GROUP}/{API_VERSION}")
}

/// Reference to an object in the same namespace.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct LocalObjectReference {
    pub name: String,
}

/// Reference to an object in the same namespace, pinned to a concrete
/// incarnation via its UID.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct LocalUidReference {
    pub name: String,
    pub uid: String,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LoadBalancerType {
    #[default]
    Public,
    Internal,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerPort {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    pub port: i32,
}

/// An IP allocation carved out of a parent prefix resource, created and
/// released together with the load balancer.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EphemeralPrefixSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix_template: Option<PrefixTemplateSpec>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct PrefixTemplateSpec {
    pub spec: PrefixSpec,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PrefixSpec {
    pub ip_family: String,
    pub parent_ref: LocalObjectReference,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IpSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ephemeral: Option<EphemeralPrefixSource>,
}

/// A virtual IP with a port set, distributing traffic onto the destinations
/// listed in the `LoadBalancerRouting` object of the same name.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[kube(
    group = "networking.metalcore.dev",
    version = "v1alpha1",
    kind = "LoadBalancer",
    namespaced,
    status = "LoadBalancerStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerSpec {
    /// Decided once per object. A type change means teardown and recreate,
    /// since the IP allocation source differs between the types.
    #[serde(rename = "type")]
    pub type_: LoadBalancerType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ip_families: Vec<String>,
    pub network_ref: LocalObjectReference,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<LoadBalancerPort>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ips: Option<Vec<IpSource>>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct LoadBalancerStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ips: Vec<String>,
}

/// The concrete destination set of a load balancer. Unlike the other
/// resources its payload sits at the top level rather than under a `spec`,
/// so the kube plumbing is written out by hand.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerRouting {
    #[serde(default = "networking_api_version")]
    pub api_version: String,
    #[serde(default = "LoadBalancerRouting::kind_str")]
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub network_ref: LocalUidReference,
    /// Always on the wire, even empty: the merge patch must replace the
    /// stored set wholesale, and an omitted key would leave it untouched.
    #[serde(default)]
    pub destinations: Vec<LocalUidReference>,
}

impl LoadBalancerRouting {
    fn kind_str() -> String {
        "LoadBalancerRouting".to_string()
    }
}

impl Default for LoadBalancerRouting {
    fn default() -> Self {
        Self {
            api_version: networking_api_version(),
            kind: Self::kind_str(),
            metadata: ObjectMeta::default(),
            network_ref: LocalUidReference::default(),
            destinations: Vec::new(),
        }
    }
}

impl kube::Resource for LoadBalancerRouting {
    type DynamicType = ();
    type Scope = NamespaceResourceScope;

    fn kind(_: &()) -> Cow<'_, str> {
        "LoadBalancerRouting".into()
    }

    fn group(_: &()) -> Cow<'_, str> {
        NETWORKING_GROUP.into()
    }

    fn version(_: &()) -> Cow<'_, str> {
        API_VERSION.into()
    }

    fn plural(_: &()) -> Cow<'_, str> {
        "loadbalancerroutings".into()
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

/// The network a load balancer and its destinations live on. Read only for
/// its UID, which the routing object pins.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[kube(
    group = "networking.metalcore.dev",
    version = "v1alpha1",
    kind = "Network",
    namespaced,
    schema = "disabled"
)]
pub struct NetworkSpec {}

/// Compute instance backing a node. Read only for its declared network
/// interface attachments.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[kube(
    group = "compute.metalcore.dev",
    version = "v1alpha1",
    kind = "Machine",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub network_interfaces: Vec<MachineNetworkInterface>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineNetworkInterface {
    pub name: String,
    /// Explicit interface object backing this attachment. When absent the
    /// interface is named `{machine}-{attachment}` by convention.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_interface_ref: Option<LocalObjectReference>,
}

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[kube(
    group = "networking.metalcore.dev",
    version = "v1alpha1",
    kind = "NetworkInterface",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterfaceSpec {
    pub network_ref: LocalObjectReference,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn load_balancer_wire_shape() {
        let mut lb = LoadBalancer::new(
            "my-cluster-svc-abc",
            LoadBalancerSpec {
                type_: LoadBalancerType::Internal,
                ip_families: vec!["IPv4".to_string()],
                network_ref: LocalObjectReference {
                    name: "my-network".to_string(),
                },
                ports: vec![LoadBalancerPort {
                    protocol: Some("TCP".to_string()),
                    port: 443,
                }],
                ips: Some(vec![IpSource {
                    ephemeral: Some(EphemeralPrefixSource {
                        prefix_template: Some(PrefixTemplateSpec {
                            spec: PrefixSpec {
                                ip_family: "IPv4".to_string(),
                                parent_ref: LocalObjectReference {
                                    name: "my-prefix".to_string(),
                                },
                            },
                        }),
                    }),
                }]),
            },
        );
        lb.metadata.namespace = Some("ns".to_string());

        let value = serde_json::to_value(&lb).unwrap();
        assert_eq!(value["apiVersion"], "networking.metalcore.dev/v1alpha1");
        assert_eq!(value["kind"], "LoadBalancer");
        assert_eq!(value["spec"]["type"], "Internal");
        assert_eq!(value["spec"]["ipFamilies"], json!(["IPv4"]));
        assert_eq!(value["spec"]["networkRef"]["name"], "my-network");
        assert_eq!(
            value["spec"]["ports"],
            json!([{"protocol": "TCP", "port": 443}])
        );
        assert_eq!(
            value["spec"]["ips"][0]["ephemeral"]["prefixTemplate"]["spec"],
            json!({"ipFamily": "IPv4", "parentRef": {"name": "my-prefix"}})
        );
        // Status is server-owned and must not be part of the applied document.
        assert!(value.get("status").is_none());
    }

    #[test]
    fn routing_wire_shape() {
        let routing = LoadBalancerRouting {
            metadata: ObjectMeta {
                name: Some("my-cluster-svc-abc".to_string()),
                namespace: Some("ns".to_string()),
                ..ObjectMeta::default()
            },
            network_ref: LocalUidReference {
                name: "my-network".to_string(),
                uid: "net-uid".to_string(),
            },
            destinations: vec![LocalUidReference {
                name: "machine-1-primary".to_string(),
                uid: "nic-uid".to_string(),
            }],
            ..LoadBalancerRouting::default()
        };

        let value = serde_json::to_value(&routing).unwrap();
        assert_eq!(value["apiVersion"], "networking.metalcore.dev/v1alpha1");
        assert_eq!(value["kind"], "LoadBalancerRouting");
        assert_eq!(
            value["networkRef"],
            json!({"name": "my-network", "uid": "net-uid"})
        );
        assert_eq!(
            value["destinations"],
            json!([{"name": "machine-1-primary", "uid": "nic-uid"}])
        );
    }

    #[test]
    fn routing_serializes_empty_destinations_explicitly() {
        let routing = LoadBalancerRouting::default();
        let value = serde_json::to_value(&routing).unwrap();
        assert_eq!(value["destinations"], json!([]));
    }
}

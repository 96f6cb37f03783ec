//! Cluster Builder
//!
//! One managed Kubernetes cluster per region, attached to the region's node
//! subnet. Pod networking is left to a separate CNI layer (`networkPlugin:
//! none`); the pod and service ranges are still declared explicitly.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::graph::{Ref, ResourceGraph};
use super::ids::{ManagedClusterId, ResourceGroupId, SubnetId};
use super::resources::{ManagedClusterSpec, PrincipalRef, ResourceSpec};
use crate::error::{CatalogError, GraphError, IdError};

/// Agent pool name
pub const AGENT_POOL_NAME: &str = "main";
pub const AGENT_POOL_MODE: &str = "System";
pub const AGENT_POOL_TYPE: &str = "VirtualMachineScaleSets";
pub const OS_TYPE: &str = "Linux";
/// The pod network is configured by a CNI layer outside this tool
pub const NETWORK_PLUGIN: &str = "none";

const MAX_DNS_PREFIX_LEN: usize = 54;

/// Fixed per-cluster policy, overridable from the catalog file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterPolicy {
    pub kubernetes_version: String,
    pub vm_size: String,
    pub node_count: u32,
    pub max_pods: u32,
    pub os_disk_size_gb: u32,
    pub enable_rbac: bool,
}

impl Default for ClusterPolicy {
    fn default() -> Self {
        Self {
            kubernetes_version: "1.27.7".to_string(),
            vm_size: "Standard_B2s".to_string(),
            node_count: 1,
            max_pods: 250,
            os_disk_size_gb: 30,
            enable_rbac: true,
        }
    }
}

impl ClusterPolicy {
    pub fn validate(&self) -> Result<(), CatalogError> {
        let invalid = |field: &'static str, reason: String| CatalogError::InvalidPolicy { field, reason };

        let version_ok = !self.kubernetes_version.is_empty()
            && self
                .kubernetes_version
                .split('.')
                .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()));
        if !version_ok {
            return Err(invalid(
                "kubernetes_version",
                format!("'{}' is not a dotted version", self.kubernetes_version),
            ));
        }
        if self.vm_size.trim().is_empty() {
            return Err(invalid("vm_size", "must not be empty".to_string()));
        }
        if !(1..=1000).contains(&self.node_count) {
            return Err(invalid("node_count", format!("{} is outside 1..=1000", self.node_count)));
        }
        if !(10..=250).contains(&self.max_pods) {
            return Err(invalid("max_pods", format!("{} is outside 10..=250", self.max_pods)));
        }
        if !(30..=2048).contains(&self.os_disk_size_gb) {
            return Err(invalid(
                "os_disk_size_gb",
                format!("{} is outside 30..=2048", self.os_disk_size_gb),
            ));
        }
        Ok(())
    }

    /// ARM request body of a managed cluster under this policy
    pub fn arm_body(
        &self,
        id: &ManagedClusterId,
        location: &str,
        node_subnet: &SubnetId,
        network: &ClusterNetwork,
        dns_prefix: &str,
    ) -> serde_json::Value {
        json!({
            "location": location,
            "identity": { "type": "SystemAssigned" },
            "properties": {
                "kubernetesVersion": self.kubernetes_version,
                "dnsPrefix": dns_prefix,
                "enableRBAC": self.enable_rbac,
                "nodeResourceGroup": format!("{}-vm", id.name()),
                "agentPoolProfiles": [{
                    "name": AGENT_POOL_NAME,
                    "count": self.node_count,
                    "maxPods": self.max_pods,
                    "mode": AGENT_POOL_MODE,
                    "osDiskSizeGB": self.os_disk_size_gb,
                    "osType": OS_TYPE,
                    "type": AGENT_POOL_TYPE,
                    "vmSize": self.vm_size,
                    "vnetSubnetID": node_subnet.to_string(),
                    "nodeLabels": { "location": location }
                }],
                "networkProfile": {
                    "networkPlugin": NETWORK_PLUGIN,
                    "podCidr": network.pod_cidr.to_string(),
                    "serviceCidr": network.service_cidr.to_string(),
                    "dnsServiceIP": network.dns_service_ip.to_string()
                }
            }
        })
    }
}

/// Pod and service ranges of one cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterNetwork {
    pub pod_cidr: Ipv4Net,
    pub service_cidr: Ipv4Net,
    pub dns_service_ip: Ipv4Addr,
}

/// Handle to a declared cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterHandle {
    cluster: Ref<ManagedClusterId>,
}

impl ClusterHandle {
    pub fn cluster(&self) -> &Ref<ManagedClusterId> {
        &self.cluster
    }

    pub fn id(&self) -> &ManagedClusterId {
        self.cluster.id()
    }

    /// The cluster's system-assigned identity. Only resolvable once the
    /// cluster has been provisioned.
    pub fn principal(&self) -> PrincipalRef {
        PrincipalRef::new(self.cluster.node())
    }

    pub fn node_resource_group(&self) -> Result<ResourceGroupId, IdError> {
        self.cluster.id().node_resource_group()
    }
}

/// DNS prefix for a cluster: its name, cut to the API's limit
pub fn dns_prefix_for(cluster_name: &str) -> String {
    let mut prefix: String = cluster_name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .take(MAX_DNS_PREFIX_LEN)
        .collect();
    while prefix.ends_with('-') {
        prefix.pop();
    }
    prefix
}

/// Declare a managed cluster in `group`, attached to `node_subnet`
pub fn build_cluster(
    graph: &mut ResourceGraph,
    group: &Ref<ResourceGroupId>,
    location: &str,
    name: &str,
    node_subnet: &Ref<SubnetId>,
    network: ClusterNetwork,
    policy: &ClusterPolicy,
) -> Result<ClusterHandle, GraphError> {
    let id = ManagedClusterId::new(group.id(), name)?;
    // Fail at declaration time if the implicit group name would be invalid
    id.node_resource_group()?;

    debug!(cluster = %id, "Declaring managed cluster");

    let node = graph.declare(ResourceSpec::ManagedCluster(ManagedClusterSpec {
        id: id.clone(),
        group: group.clone(),
        location: location.to_string(),
        node_subnet: node_subnet.clone(),
        network,
        dns_prefix: dns_prefix_for(name),
        policy: policy.clone(),
    }))?;

    Ok(ClusterHandle {
        cluster: Ref::new(node, id),
    })
}

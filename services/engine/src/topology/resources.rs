//! Desired-state resource declarations
//!
//! A [`ResourceSpec`] describes one node of the topology graph. Inputs that
//! only exist once another resource is provisioned (the cluster identity) are
//! carried as deferred references and resolved by the scheduler through a
//! [`Resolver`], which only ever holds outputs of completed dependencies.

use std::collections::HashMap;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use super::cluster::{ClusterNetwork, ClusterPolicy};
use super::credentials::CredentialKind;
use super::graph::{NodeId, Ref, ResourceKey};
use super::ids::{
    ManagedClusterId, PeeringId, ResourceGroupId, ResourceId, ResourceKind, RoleAssignmentId,
    RoleDefinitionId, SubnetId, VirtualNetworkId,
};
use crate::error::ProvisionError;
use crate::provider::{DesiredResource, ProvisionedResource};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceGroupSpec {
    pub id: ResourceGroupId,
    pub location: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualNetworkSpec {
    pub id: VirtualNetworkId,
    pub group: Ref<ResourceGroupId>,
    pub location: String,
    pub address_prefixes: Vec<Ipv4Net>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubnetSpec {
    pub id: SubnetId,
    pub network: Ref<VirtualNetworkId>,
    pub address_prefix: Ipv4Net,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeeringSpec {
    pub id: PeeringId,
    pub local: Ref<VirtualNetworkId>,
    pub remote: Ref<VirtualNetworkId>,
    pub allow_virtual_network_access: bool,
    pub allow_forwarded_traffic: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedClusterSpec {
    pub id: ManagedClusterId,
    pub group: Ref<ResourceGroupId>,
    pub location: String,
    pub node_subnet: Ref<SubnetId>,
    pub network: ClusterNetwork,
    pub dns_prefix: String,
    pub policy: ClusterPolicy,
}

/// The system-assigned identity of a cluster, known once it is provisioned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrincipalRef {
    cluster: NodeId,
}

impl PrincipalRef {
    pub(crate) fn new(cluster: NodeId) -> Self {
        Self { cluster }
    }

    pub fn cluster(&self) -> NodeId {
        self.cluster
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrincipalType {
    ServicePrincipal,
}

impl std::fmt::Display for PrincipalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PrincipalType::ServicePrincipal => write!(f, "ServicePrincipal"),
        }
    }
}

/// Scope of a role assignment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssignmentScope {
    /// A resource group declared in the graph
    Declared(Ref<ResourceGroupId>),
    /// A resource group the cluster creates implicitly; only referenced by name
    ClusterManaged(ResourceGroupId),
}

impl AssignmentScope {
    pub fn group(&self) -> &ResourceGroupId {
        match self {
            AssignmentScope::Declared(r) => r.id(),
            AssignmentScope::ClusterManaged(id) => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleAssignmentSpec {
    pub id: RoleAssignmentId,
    pub scope: AssignmentScope,
    pub role_definition: RoleDefinitionId,
    pub principal: PrincipalRef,
    pub principal_type: PrincipalType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialsSpec {
    pub cluster: Ref<ManagedClusterId>,
    pub kind: CredentialKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceSpec {
    ResourceGroup(ResourceGroupSpec),
    VirtualNetwork(VirtualNetworkSpec),
    Subnet(SubnetSpec),
    Peering(PeeringSpec),
    ManagedCluster(ManagedClusterSpec),
    RoleAssignment(RoleAssignmentSpec),
    ClusterCredentials(CredentialsSpec),
}

impl ResourceSpec {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceSpec::ResourceGroup(_) => ResourceKind::ResourceGroup,
            ResourceSpec::VirtualNetwork(_) => ResourceKind::VirtualNetwork,
            ResourceSpec::Subnet(_) => ResourceKind::Subnet,
            ResourceSpec::Peering(_) => ResourceKind::VirtualNetworkPeering,
            ResourceSpec::ManagedCluster(_) => ResourceKind::ManagedCluster,
            ResourceSpec::RoleAssignment(_) => ResourceKind::RoleAssignment,
            ResourceSpec::ClusterCredentials(_) => ResourceKind::ClusterCredentials,
        }
    }

    /// The ARM resource this node manages. Credential reads manage nothing.
    pub fn resource_id(&self) -> Option<ResourceId> {
        match self {
            ResourceSpec::ResourceGroup(s) => Some(ResourceId::ResourceGroup(s.id.clone())),
            ResourceSpec::VirtualNetwork(s) => Some(ResourceId::VirtualNetwork(s.id.clone())),
            ResourceSpec::Subnet(s) => Some(ResourceId::Subnet(s.id.clone())),
            ResourceSpec::Peering(s) => Some(ResourceId::Peering(s.id.clone())),
            ResourceSpec::ManagedCluster(s) => Some(ResourceId::ManagedCluster(s.id.clone())),
            ResourceSpec::RoleAssignment(s) => Some(ResourceId::RoleAssignment(s.id.clone())),
            ResourceSpec::ClusterCredentials(_) => None,
        }
    }

    pub fn key(&self) -> ResourceKey {
        let name = match self {
            ResourceSpec::ClusterCredentials(s) => format!("{}/credentials/{}", s.cluster.id(), s.kind),
            // Every other spec manages a resource
            other => other
                .resource_id()
                .map(|id| id.to_string())
                .unwrap_or_default(),
        };
        ResourceKey::new(self.kind(), name)
    }

    /// Nodes this resource depends on
    pub fn references(&self) -> Vec<NodeId> {
        match self {
            ResourceSpec::ResourceGroup(_) => vec![],
            ResourceSpec::VirtualNetwork(s) => vec![s.group.node()],
            ResourceSpec::Subnet(s) => vec![s.network.node()],
            ResourceSpec::Peering(s) => vec![s.local.node(), s.remote.node()],
            ResourceSpec::ManagedCluster(s) => vec![s.group.node(), s.node_subnet.node()],
            ResourceSpec::RoleAssignment(s) => {
                let mut refs = vec![s.principal.cluster()];
                if let AssignmentScope::Declared(group) = &s.scope {
                    refs.push(group.node());
                }
                refs
            }
            ResourceSpec::ClusterCredentials(s) => vec![s.cluster.node()],
        }
    }

    /// Turn the declaration into a concrete request for a provider.
    ///
    /// Returns `None` for credential reads, which are not resources.
    pub fn resolve(&self, resolver: &Resolver) -> Result<Option<DesiredResource>, ProvisionError> {
        let desired = match self {
            ResourceSpec::ResourceGroup(s) => DesiredResource::ResourceGroup {
                id: s.id.clone(),
                location: s.location.clone(),
            },
            ResourceSpec::VirtualNetwork(s) => DesiredResource::VirtualNetwork {
                id: s.id.clone(),
                location: s.location.clone(),
                address_prefixes: s.address_prefixes.clone(),
            },
            ResourceSpec::Subnet(s) => DesiredResource::Subnet {
                id: s.id.clone(),
                address_prefix: s.address_prefix,
            },
            ResourceSpec::Peering(s) => DesiredResource::Peering {
                id: s.id.clone(),
                remote: s.remote.id().clone(),
                allow_virtual_network_access: s.allow_virtual_network_access,
                allow_forwarded_traffic: s.allow_forwarded_traffic,
            },
            ResourceSpec::ManagedCluster(s) => DesiredResource::ManagedCluster {
                id: s.id.clone(),
                location: s.location.clone(),
                node_subnet: s.node_subnet.id().clone(),
                network: s.network.clone(),
                dns_prefix: s.dns_prefix.clone(),
                policy: s.policy.clone(),
            },
            ResourceSpec::RoleAssignment(s) => DesiredResource::RoleAssignment {
                id: s.id.clone(),
                role_definition: s.role_definition,
                principal_id: resolver.principal(&s.principal, &s.id.to_string())?,
                principal_type: s.principal_type,
            },
            ResourceSpec::ClusterCredentials(_) => return Ok(None),
        };
        Ok(Some(desired))
    }
}

/// Read access to the outputs of completed dependencies
#[derive(Debug, Default)]
pub struct Resolver {
    outputs: HashMap<NodeId, ProvisionedResource>,
}

impl Resolver {
    pub(crate) fn new(outputs: HashMap<NodeId, ProvisionedResource>) -> Self {
        Self { outputs }
    }

    /// Principal id of the cluster behind `principal`
    pub fn principal(&self, principal: &PrincipalRef, resource: &str) -> Result<String, ProvisionError> {
        let cluster = self.outputs.get(&principal.cluster).ok_or_else(|| {
            ProvisionError::Unresolved {
                resource: resource.to_string(),
                message: format!("cluster node {} has not completed", principal.cluster),
            }
        })?;

        cluster
            .principal_id()
            .map(str::to_string)
            .ok_or_else(|| ProvisionError::Unresolved {
                resource: resource.to_string(),
                message: format!("cluster {} reports no system-assigned identity", cluster.id),
            })
    }
}

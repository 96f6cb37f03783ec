//! Typed Azure Resource Manager identifiers
//!
//! Every identifier is assembled from validated components, so a malformed
//! scope or role path cannot reach a provisioning call.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::IdError;

/// Built-in "Network Contributor" role
pub const NETWORK_CONTRIBUTOR_ROLE: Uuid = Uuid::from_u128(0x4d97b98b_1d4f_4787_a291_c67834d212e7);

/// Azure subscription identifier (a GUID)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    pub fn parse(raw: &str) -> Result<Self, IdError> {
        Uuid::parse_str(raw.trim())
            .map(Self)
            .map_err(|_| IdError::InvalidSubscription(raw.to_string()))
    }
}

impl FromStr for SubscriptionId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SubscriptionId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SubscriptionId> for String {
    fn from(value: SubscriptionId) -> Self {
        value.to_string()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// Naming rules per resource type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NameRule {
    ResourceGroup,
    VirtualNetwork,
    Subnet,
    Peering,
    ManagedCluster,
}

impl NameRule {
    pub fn label(self) -> &'static str {
        match self {
            NameRule::ResourceGroup => "resource group",
            NameRule::VirtualNetwork => "virtual network",
            NameRule::Subnet => "subnet",
            NameRule::Peering => "virtual network peering",
            NameRule::ManagedCluster => "managed cluster",
        }
    }

    fn length_bounds(self) -> (usize, usize) {
        match self {
            NameRule::ResourceGroup => (1, 90),
            NameRule::VirtualNetwork => (2, 64),
            NameRule::Subnet | NameRule::Peering => (1, 80),
            NameRule::ManagedCluster => (1, 63),
        }
    }

    fn allows(self, c: char) -> bool {
        if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
            return true;
        }
        match self {
            NameRule::ResourceGroup => matches!(c, '.' | '(' | ')'),
            NameRule::VirtualNetwork | NameRule::Subnet | NameRule::Peering => c == '.',
            NameRule::ManagedCluster => false,
        }
    }

    /// Check `name` against this rule
    pub fn check(self, name: &str) -> Result<(), IdError> {
        let invalid = |reason: String| IdError::InvalidName {
            kind: self.label(),
            name: name.to_string(),
            reason,
        };

        let (min, max) = self.length_bounds();
        let len = name.chars().count();
        if len < min || len > max {
            return Err(invalid(format!("length must be between {} and {}", min, max)));
        }

        if let Some(c) = name.chars().find(|c| !self.allows(*c)) {
            return Err(invalid(format!("character '{}' is not allowed", c)));
        }

        // Non-empty: the length check above guarantees both ends exist
        let first = name.chars().next().unwrap_or_default();
        let last = name.chars().last().unwrap_or_default();
        match self {
            NameRule::ResourceGroup => {
                if last == '.' {
                    return Err(invalid("must not end with '.'".to_string()));
                }
            }
            NameRule::VirtualNetwork | NameRule::Subnet | NameRule::Peering => {
                if !first.is_ascii_alphanumeric() {
                    return Err(invalid("must start with a letter or digit".to_string()));
                }
                if !(last.is_ascii_alphanumeric() || last == '_') {
                    return Err(invalid(
                        "must end with a letter, digit or underscore".to_string(),
                    ));
                }
            }
            NameRule::ManagedCluster => {
                if !first.is_ascii_alphanumeric() || !last.is_ascii_alphanumeric() {
                    return Err(invalid(
                        "must start and end with a letter or digit".to_string(),
                    ));
                }
            }
        }

        Ok(())
    }
}

/// `/subscriptions/{sub}/resourceGroups/{name}`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceGroupId {
    subscription: SubscriptionId,
    name: String,
}

impl ResourceGroupId {
    pub fn new(subscription: SubscriptionId, name: &str) -> Result<Self, IdError> {
        NameRule::ResourceGroup.check(name)?;
        Ok(Self {
            subscription,
            name: name.to_string(),
        })
    }

    pub fn subscription(&self) -> SubscriptionId {
        self.subscription
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ResourceGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/subscriptions/{}/resourceGroups/{}", self.subscription, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VirtualNetworkId {
    group: ResourceGroupId,
    name: String,
}

impl VirtualNetworkId {
    pub fn new(group: &ResourceGroupId, name: &str) -> Result<Self, IdError> {
        NameRule::VirtualNetwork.check(name)?;
        Ok(Self {
            group: group.clone(),
            name: name.to_string(),
        })
    }

    pub fn group(&self) -> &ResourceGroupId {
        &self.group
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for VirtualNetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/providers/Microsoft.Network/virtualNetworks/{}",
            self.group, self.name
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubnetId {
    network: VirtualNetworkId,
    name: String,
}

impl SubnetId {
    pub fn new(network: &VirtualNetworkId, name: &str) -> Result<Self, IdError> {
        NameRule::Subnet.check(name)?;
        Ok(Self {
            network: network.clone(),
            name: name.to_string(),
        })
    }

    pub fn network(&self) -> &VirtualNetworkId {
        &self.network
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for SubnetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/subnets/{}", self.network, self.name)
    }
}

/// A peering lives under its local (source) network
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeeringId {
    network: VirtualNetworkId,
    name: String,
}

impl PeeringId {
    pub fn new(network: &VirtualNetworkId, name: &str) -> Result<Self, IdError> {
        NameRule::Peering.check(name)?;
        Ok(Self {
            network: network.clone(),
            name: name.to_string(),
        })
    }

    pub fn network(&self) -> &VirtualNetworkId {
        &self.network
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for PeeringId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/virtualNetworkPeerings/{}", self.network, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ManagedClusterId {
    group: ResourceGroupId,
    name: String,
}

impl ManagedClusterId {
    pub fn new(group: &ResourceGroupId, name: &str) -> Result<Self, IdError> {
        NameRule::ManagedCluster.check(name)?;
        Ok(Self {
            group: group.clone(),
            name: name.to_string(),
        })
    }

    pub fn group(&self) -> &ResourceGroupId {
        &self.group
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The infrastructure resource group the cluster creates for its nodes
    pub fn node_resource_group(&self) -> Result<ResourceGroupId, IdError> {
        ResourceGroupId::new(self.group.subscription(), &format!("{}-vm", self.name))
    }
}

impl fmt::Display for ManagedClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/providers/Microsoft.ContainerService/managedClusters/{}",
            self.group, self.name
        )
    }
}

/// Role definitions are addressed at subscription scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoleDefinitionId {
    subscription: SubscriptionId,
    role: Uuid,
}

impl RoleDefinitionId {
    pub fn new(subscription: SubscriptionId, role: Uuid) -> Self {
        Self { subscription, role }
    }

    pub fn network_contributor(subscription: SubscriptionId) -> Self {
        Self::new(subscription, NETWORK_CONTRIBUTOR_ROLE)
    }

    pub fn role(&self) -> Uuid {
        self.role
    }
}

impl fmt::Display for RoleDefinitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "/subscriptions/{}/providers/Microsoft.Authorization/roleDefinitions/{}",
            self.subscription, self.role
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoleAssignmentId {
    scope: ResourceGroupId,
    name: Uuid,
}

impl RoleAssignmentId {
    /// Derive a stable assignment name from scope, role and the cluster
    /// owning the principal. Re-declaring the same binding yields the same id.
    pub fn derive(
        scope: &ResourceGroupId,
        role: &RoleDefinitionId,
        cluster: &ManagedClusterId,
    ) -> Self {
        let seed = format!("{}|{}|{}", scope, role, cluster);
        Self {
            scope: scope.clone(),
            name: Uuid::new_v5(&Uuid::NAMESPACE_URL, seed.as_bytes()),
        }
    }

    pub fn scope(&self) -> &ResourceGroupId {
        &self.scope
    }

    pub fn name(&self) -> Uuid {
        self.name
    }
}

impl fmt::Display for RoleAssignmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/providers/Microsoft.Authorization/roleAssignments/{}",
            self.scope, self.name
        )
    }
}

/// Kinds of nodes in the topology graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    ResourceGroup,
    VirtualNetwork,
    Subnet,
    VirtualNetworkPeering,
    ManagedCluster,
    RoleAssignment,
    ClusterCredentials,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::ResourceGroup => write!(f, "resource_group"),
            ResourceKind::VirtualNetwork => write!(f, "virtual_network"),
            ResourceKind::Subnet => write!(f, "subnet"),
            ResourceKind::VirtualNetworkPeering => write!(f, "virtual_network_peering"),
            ResourceKind::ManagedCluster => write!(f, "managed_cluster"),
            ResourceKind::RoleAssignment => write!(f, "role_assignment"),
            ResourceKind::ClusterCredentials => write!(f, "cluster_credentials"),
        }
    }
}

/// Any addressable ARM resource in the topology
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceId {
    ResourceGroup(ResourceGroupId),
    VirtualNetwork(VirtualNetworkId),
    Subnet(SubnetId),
    Peering(PeeringId),
    ManagedCluster(ManagedClusterId),
    RoleAssignment(RoleAssignmentId),
}

impl ResourceId {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceId::ResourceGroup(_) => ResourceKind::ResourceGroup,
            ResourceId::VirtualNetwork(_) => ResourceKind::VirtualNetwork,
            ResourceId::Subnet(_) => ResourceKind::Subnet,
            ResourceId::Peering(_) => ResourceKind::VirtualNetworkPeering,
            ResourceId::ManagedCluster(_) => ResourceKind::ManagedCluster,
            ResourceId::RoleAssignment(_) => ResourceKind::RoleAssignment,
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceId::ResourceGroup(id) => id.fmt(f),
            ResourceId::VirtualNetwork(id) => id.fmt(f),
            ResourceId::Subnet(id) => id.fmt(f),
            ResourceId::Peering(id) => id.fmt(f),
            ResourceId::ManagedCluster(id) => id.fmt(f),
            ResourceId::RoleAssignment(id) => id.fmt(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUB: &str = "00000000-0000-0000-0000-000000000001";

    fn group() -> ResourceGroupId {
        ResourceGroupId::new(SubscriptionId::parse(SUB).unwrap(), "rg-aks-northeurope").unwrap()
    }

    #[test]
    fn test_subnet_path() {
        let vnet = VirtualNetworkId::new(&group(), "vnet-ne").unwrap();
        let subnet = SubnetId::new(&vnet, "node-subnet-ne").unwrap();

        assert_eq!(
            subnet.to_string(),
            "/subscriptions/00000000-0000-0000-0000-000000000001/resourceGroups/rg-aks-northeurope/providers/Microsoft.Network/virtualNetworks/vnet-ne/subnets/node-subnet-ne"
        );
    }

    #[test]
    fn test_role_definition_embeds_subscription() {
        let role = RoleDefinitionId::network_contributor(SubscriptionId::parse(SUB).unwrap());
        assert_eq!(
            role.to_string(),
            "/subscriptions/00000000-0000-0000-0000-000000000001/providers/Microsoft.Authorization/roleDefinitions/4d97b98b-1d4f-4787-a291-c67834d212e7"
        );
    }

    #[test]
    fn test_node_resource_group_naming() {
        let cluster = ManagedClusterId::new(&group(), "k8s-cluster-ne").unwrap();
        let infra = cluster.node_resource_group().unwrap();
        assert_eq!(infra.name(), "k8s-cluster-ne-vm");
        assert_eq!(infra.subscription(), group().subscription());
    }

    #[test]
    fn test_role_assignment_name_is_stable() {
        let cluster = ManagedClusterId::new(&group(), "k8s-cluster-ne").unwrap();
        let role = RoleDefinitionId::network_contributor(group().subscription());

        let a = RoleAssignmentId::derive(&group(), &role, &cluster);
        let b = RoleAssignmentId::derive(&group(), &role, &cluster);
        let other = RoleAssignmentId::derive(&cluster.node_resource_group().unwrap(), &role, &cluster);

        assert_eq!(a, b);
        assert_ne!(a.name(), other.name());
    }

    #[test]
    fn test_name_rules() {
        assert!(NameRule::ManagedCluster.check("k8s-cluster-ne").is_ok());
        assert!(NameRule::ManagedCluster.check("-cluster").is_err());
        assert!(NameRule::ManagedCluster.check("k8s.cluster").is_err());
        assert!(NameRule::VirtualNetwork.check("v").is_err());
        assert!(NameRule::ResourceGroup.check("rg.").is_err());
        assert!(NameRule::ResourceGroup.check("rg(prod)").is_ok());
        assert!(NameRule::Subnet.check("node subnet").is_err());
        assert!(NameRule::Peering.check(&"p".repeat(81)).is_err());
    }

    #[test]
    fn test_subscription_rejects_non_guid() {
        assert!(matches!(
            SubscriptionId::parse("my-subscription"),
            Err(IdError::InvalidSubscription(_))
        ));
        assert_eq!(SubscriptionId::parse(SUB).unwrap().to_string(), SUB);
    }
}

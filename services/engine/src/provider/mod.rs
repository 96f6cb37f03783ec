//! Provisioning Backends
//!
//! Trait-based abstraction over the system that actually creates resources.
//! The scheduler only talks to [`ResourceProvider`]; backends own identity by
//! name, long-running operation polling and error reporting.
//!
//! - `azure`: Azure Resource Manager REST API
//! - `memory`: in-process backend with ARM-like semantics (tests, offline preview)

pub mod azure;
pub mod identity;
pub mod memory;

pub use azure::{ArmProvider, ArmSettings};
pub use identity::{AccessToken, TokenSource};
pub use memory::InMemoryProvider;

use std::fmt;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::error::ProvisionError;
use crate::topology::cluster::{ClusterNetwork, ClusterPolicy};
use crate::topology::credentials::{CredentialKind, EncodedKubeconfig};
use crate::topology::ids::{
    ManagedClusterId, PeeringId, ResourceGroupId, ResourceId, RoleAssignmentId, RoleDefinitionId,
    SubnetId, VirtualNetworkId,
};
use crate::topology::resources::PrincipalType;

/// Provisioning state reported by the backend
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ProvisioningState {
    Accepted,
    Creating,
    Updating,
    Deleting,
    Succeeded,
    Failed,
    Canceled,
    Other(String),
}

impl ProvisioningState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProvisioningState::Succeeded | ProvisioningState::Failed | ProvisioningState::Canceled
        )
    }

    pub fn is_ready(&self) -> bool {
        *self == ProvisioningState::Succeeded
    }
}

impl From<&str> for ProvisioningState {
    fn from(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "accepted" => ProvisioningState::Accepted,
            "creating" => ProvisioningState::Creating,
            "updating" => ProvisioningState::Updating,
            "deleting" => ProvisioningState::Deleting,
            "succeeded" => ProvisioningState::Succeeded,
            "failed" => ProvisioningState::Failed,
            "canceled" | "cancelled" => ProvisioningState::Canceled,
            _ => ProvisioningState::Other(value.to_string()),
        }
    }
}

impl From<String> for ProvisioningState {
    fn from(value: String) -> Self {
        ProvisioningState::from(value.as_str())
    }
}

impl From<ProvisioningState> for String {
    fn from(value: ProvisioningState) -> Self {
        value.to_string()
    }
}

impl fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProvisioningState::Accepted => write!(f, "Accepted"),
            ProvisioningState::Creating => write!(f, "Creating"),
            ProvisioningState::Updating => write!(f, "Updating"),
            ProvisioningState::Deleting => write!(f, "Deleting"),
            ProvisioningState::Succeeded => write!(f, "Succeeded"),
            ProvisioningState::Failed => write!(f, "Failed"),
            ProvisioningState::Canceled => write!(f, "Canceled"),
            ProvisioningState::Other(s) => write!(f, "{}", s),
        }
    }
}

/// State of one directional virtual network peering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeeringState {
    /// Only this side exists
    Initiated,
    /// Both sides exist and traffic flows
    Connected,
    /// The remote side was removed
    Disconnected,
    /// Not provisioned, or the backend did not report a state
    Unknown,
}

impl From<&str> for PeeringState {
    fn from(value: &str) -> Self {
        match value {
            "Initiated" => PeeringState::Initiated,
            "Connected" => PeeringState::Connected,
            "Disconnected" => PeeringState::Disconnected,
            _ => PeeringState::Unknown,
        }
    }
}

impl fmt::Display for PeeringState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeeringState::Initiated => write!(f, "Initiated"),
            PeeringState::Connected => write!(f, "Connected"),
            PeeringState::Disconnected => write!(f, "Disconnected"),
            PeeringState::Unknown => write!(f, "Unknown"),
        }
    }
}

/// A resource as reported by the backend, in ARM response shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionedResource {
    /// Full resource id
    pub id: String,
    pub state: ProvisioningState,
    /// The `properties` object of the response
    pub properties: serde_json::Value,
    /// The `identity` object of the response, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<serde_json::Value>,
}

impl ProvisionedResource {
    /// Build from a raw ARM response body
    pub fn from_arm(body: &serde_json::Value) -> Option<Self> {
        let id = body.get("id")?.as_str()?.to_string();
        let properties = body
            .get("properties")
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        // Role assignments carry no provisioning state once they exist
        let state = properties
            .get("provisioningState")
            .and_then(|s| s.as_str())
            .map(ProvisioningState::from)
            .unwrap_or(ProvisioningState::Succeeded);

        Some(Self {
            id,
            state,
            properties,
            identity: body.get("identity").cloned(),
        })
    }

    /// System-assigned identity principal of a managed cluster
    pub fn principal_id(&self) -> Option<&str> {
        self.identity
            .as_ref()
            .and_then(|i| i.get("principalId"))
            .and_then(|p| p.as_str())
    }

    pub fn peering_state(&self) -> PeeringState {
        self.properties
            .get("peeringState")
            .and_then(|s| s.as_str())
            .map(PeeringState::from)
            .unwrap_or(PeeringState::Unknown)
    }
}

/// Child collections a virtual network PUT replaces wholesale
pub const NETWORK_CHILD_COLLECTIONS: [&str; 2] = ["subnets", "virtualNetworkPeerings"];

/// A fully resolved request to create or reconcile one resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DesiredResource {
    ResourceGroup {
        id: ResourceGroupId,
        location: String,
    },
    VirtualNetwork {
        id: VirtualNetworkId,
        location: String,
        address_prefixes: Vec<Ipv4Net>,
    },
    Subnet {
        id: SubnetId,
        address_prefix: Ipv4Net,
    },
    Peering {
        id: PeeringId,
        remote: VirtualNetworkId,
        allow_virtual_network_access: bool,
        allow_forwarded_traffic: bool,
    },
    ManagedCluster {
        id: ManagedClusterId,
        location: String,
        node_subnet: SubnetId,
        network: ClusterNetwork,
        dns_prefix: String,
        policy: ClusterPolicy,
    },
    RoleAssignment {
        id: RoleAssignmentId,
        role_definition: RoleDefinitionId,
        principal_id: String,
        principal_type: PrincipalType,
    },
}

impl DesiredResource {
    pub fn id(&self) -> ResourceId {
        match self {
            DesiredResource::ResourceGroup { id, .. } => ResourceId::ResourceGroup(id.clone()),
            DesiredResource::VirtualNetwork { id, .. } => ResourceId::VirtualNetwork(id.clone()),
            DesiredResource::Subnet { id, .. } => ResourceId::Subnet(id.clone()),
            DesiredResource::Peering { id, .. } => ResourceId::Peering(id.clone()),
            DesiredResource::ManagedCluster { id, .. } => ResourceId::ManagedCluster(id.clone()),
            DesiredResource::RoleAssignment { id, .. } => ResourceId::RoleAssignment(id.clone()),
        }
    }

    /// Whether a PUT must be preceded by a read of the live resource
    pub fn reads_before_put(&self) -> bool {
        matches!(
            self,
            DesiredResource::VirtualNetwork { .. } | DesiredResource::RoleAssignment { .. }
        )
    }

    /// Whether `live` differs in a property that cannot be updated in place.
    ///
    /// A role assignment keeps its principal for life; a recreated cluster
    /// brings a new principal under the same assignment name.
    pub fn must_replace(&self, live: &ProvisionedResource) -> bool {
        match self {
            DesiredResource::RoleAssignment { principal_id, .. } => live
                .properties
                .get("principalId")
                .and_then(|p| p.as_str())
                .map(|current| current != principal_id.as_str())
                .unwrap_or(false),
            _ => false,
        }
    }

    /// PUT body reconciling `live` towards this request.
    ///
    /// A virtual network PUT drops every subnet and peering its body does not
    /// list, so the live ones are carried over.
    pub fn put_body(&self, live: Option<&ProvisionedResource>) -> serde_json::Value {
        let mut body = self.arm_body();
        if let (DesiredResource::VirtualNetwork { .. }, Some(live)) = (self, live) {
            for collection in NETWORK_CHILD_COLLECTIONS {
                if let Some(children) = live.properties.get(collection) {
                    body["properties"][collection] = children.clone();
                }
            }
        }
        body
    }

    /// The ARM request body for this resource
    pub fn arm_body(&self) -> serde_json::Value {
        use serde_json::json;

        match self {
            DesiredResource::ResourceGroup { location, .. } => json!({ "location": location }),
            DesiredResource::VirtualNetwork {
                location,
                address_prefixes,
                ..
            } => json!({
                "location": location,
                "properties": {
                    "addressSpace": {
                        "addressPrefixes": address_prefixes.iter().map(|p| p.to_string()).collect::<Vec<_>>()
                    }
                }
            }),
            DesiredResource::Subnet { address_prefix, .. } => json!({
                "properties": { "addressPrefix": address_prefix.to_string() }
            }),
            DesiredResource::Peering {
                remote,
                allow_virtual_network_access,
                allow_forwarded_traffic,
                ..
            } => json!({
                "properties": {
                    "remoteVirtualNetwork": { "id": remote.to_string() },
                    "allowVirtualNetworkAccess": allow_virtual_network_access,
                    "allowForwardedTraffic": allow_forwarded_traffic
                }
            }),
            DesiredResource::ManagedCluster {
                id,
                location,
                node_subnet,
                network,
                dns_prefix,
                policy,
            } => policy.arm_body(id, location, node_subnet, network, dns_prefix),
            DesiredResource::RoleAssignment {
                role_definition,
                principal_id,
                principal_type,
                ..
            } => json!({
                "properties": {
                    "roleDefinitionId": role_definition.to_string(),
                    "principalId": principal_id,
                    "principalType": principal_type.to_string()
                }
            }),
        }
    }
}

/// Trait for provisioning backends
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// Create or reconcile a resource and wait for a terminal state.
    ///
    /// Identity is by resource id: applying the same request twice never
    /// creates a second resource.
    async fn apply(&self, resource: &DesiredResource) -> Result<ProvisionedResource, ProvisionError>;

    /// Read a resource; `None` if it does not exist
    async fn read(&self, id: &ResourceId) -> Result<Option<ProvisionedResource>, ProvisionError>;

    /// Delete a resource and wait until it is gone. Deleting a missing
    /// resource succeeds.
    async fn delete(&self, id: &ResourceId) -> Result<(), ProvisionError>;

    /// List the encoded kubeconfig entries of a provisioned cluster
    async fn list_credentials(
        &self,
        cluster: &ManagedClusterId,
        kind: CredentialKind,
    ) -> Result<Vec<EncodedKubeconfig>, ProvisionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provisioning_state_parsing() {
        assert_eq!(ProvisioningState::from("Succeeded"), ProvisioningState::Succeeded);
        assert_eq!(ProvisioningState::from("canceled"), ProvisioningState::Canceled);
        assert!(ProvisioningState::from("Failed").is_terminal());
        assert!(!ProvisioningState::from("Creating").is_terminal());
        assert_eq!(
            ProvisioningState::from("Migrating"),
            ProvisioningState::Other("Migrating".to_string())
        );
    }

    #[test]
    fn test_from_arm_reads_identity_and_peering() {
        let body = serde_json::json!({
            "id": "/subscriptions/x/resourceGroups/rg/providers/Microsoft.ContainerService/managedClusters/c",
            "identity": { "type": "SystemAssigned", "principalId": "1234" },
            "properties": { "provisioningState": "Succeeded", "peeringState": "Connected" }
        });

        let resource = ProvisionedResource::from_arm(&body).unwrap();
        assert!(resource.state.is_ready());
        assert_eq!(resource.principal_id(), Some("1234"));
        assert_eq!(resource.peering_state(), PeeringState::Connected);
    }

    fn network() -> DesiredResource {
        let sub = crate::topology::ids::SubscriptionId::parse("00000000-0000-0000-0000-000000000001").unwrap();
        let group = ResourceGroupId::new(sub, "rg-aks-northeurope").unwrap();
        DesiredResource::VirtualNetwork {
            id: VirtualNetworkId::new(&group, "vnet-ne").unwrap(),
            location: "northeurope".to_string(),
            address_prefixes: vec!["10.0.0.0/20".parse().unwrap()],
        }
    }

    #[test]
    fn test_network_put_carries_live_children() {
        let desired = network();
        let live = ProvisionedResource::from_arm(&serde_json::json!({
            "id": desired.id().to_string(),
            "properties": {
                "provisioningState": "Succeeded",
                "addressSpace": { "addressPrefixes": ["10.0.0.0/16"] },
                "subnets": [{ "name": "node-subnet-ne", "properties": { "addressPrefix": "10.0.0.0/23" } }],
                "virtualNetworkPeerings": [{ "name": "vnet-peering-ne-we" }]
            }
        }))
        .unwrap();

        let body = desired.put_body(Some(&live));
        assert_eq!(body["properties"]["subnets"][0]["name"], "node-subnet-ne");
        assert_eq!(body["properties"]["virtualNetworkPeerings"][0]["name"], "vnet-peering-ne-we");
        // The desired address space still wins
        assert_eq!(body["properties"]["addressSpace"]["addressPrefixes"][0], "10.0.0.0/20");

        assert!(desired.put_body(None)["properties"].get("subnets").is_none());
        assert!(desired.reads_before_put());
    }

    #[test]
    fn test_role_assignment_with_new_principal_is_replaced() {
        let sub = crate::topology::ids::SubscriptionId::parse("00000000-0000-0000-0000-000000000001").unwrap();
        let group = ResourceGroupId::new(sub, "rg-aks-northeurope").unwrap();
        let cluster = ManagedClusterId::new(&group, "k8s-cluster-ne").unwrap();
        let role = RoleDefinitionId::network_contributor(sub);
        let desired = DesiredResource::RoleAssignment {
            id: RoleAssignmentId::derive(&group, &role, &cluster),
            role_definition: role,
            principal_id: "new-principal".to_string(),
            principal_type: PrincipalType::ServicePrincipal,
        };

        let live = |principal: &str| ProvisionedResource {
            id: desired.id().to_string(),
            state: ProvisioningState::Succeeded,
            properties: serde_json::json!({ "principalId": principal }),
            identity: None,
        };

        assert!(desired.must_replace(&live("old-principal")));
        assert!(!desired.must_replace(&live("new-principal")));
        assert!(!network().must_replace(&live("old-principal")));
    }

    #[test]
    fn test_from_arm_without_state_is_ready() {
        let body = serde_json::json!({
            "id": "/subscriptions/x/resourceGroups/rg/providers/Microsoft.Authorization/roleAssignments/y",
            "properties": { "principalId": "1234" }
        });

        let resource = ProvisionedResource::from_arm(&body).unwrap();
        assert_eq!(resource.state, ProvisioningState::Succeeded);
        assert_eq!(resource.principal_id(), None);
    }
}

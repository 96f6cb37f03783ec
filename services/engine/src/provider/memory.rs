//! In-memory backend
//!
//! Behaves like Azure Resource Manager where the topology cares: identity by
//! resource id, parents must exist before children, clusters get a system
//! identity and an infrastructure resource group, and peerings connect once
//! both directions exist. Used by tests and by offline previews.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde_json::json;
use uuid::Uuid;

use super::{
    DesiredResource, PeeringState, ProvisionedResource, ProvisioningState, ResourceProvider,
    NETWORK_CHILD_COLLECTIONS,
};
use crate::error::ProvisionError;
use crate::topology::credentials::{CredentialKind, EncodedKubeconfig};
use crate::topology::ids::{ManagedClusterId, ResourceId};

#[derive(Debug, Default)]
struct MemoryState {
    resources: BTreeMap<String, ProvisionedResource>,
    failing: HashSet<String>,
    stalled: HashSet<String>,
    apply_counts: HashMap<String, usize>,
}

impl MemoryState {
    fn exists(&self, id: &str) -> bool {
        self.resources
            .get(id)
            .map(|r| r.state.is_ready())
            .unwrap_or(false)
    }

    fn require_parent(&self, resource: &str, parent: &str) -> Result<(), ProvisionError> {
        if self.exists(parent) {
            return Ok(());
        }
        Err(ProvisionError::Rejected {
            resource: resource.to_string(),
            status: 404,
            message: format!("ParentResourceNotFound: {} does not exist", parent),
        })
    }

    fn check_parents(&self, desired: &DesiredResource) -> Result<(), ProvisionError> {
        let resource = desired.id().to_string();
        match desired {
            DesiredResource::ResourceGroup { .. } => Ok(()),
            DesiredResource::VirtualNetwork { id, .. } => {
                self.require_parent(&resource, &id.group().to_string())
            }
            DesiredResource::Subnet { id, .. } => {
                self.require_parent(&resource, &id.network().to_string())
            }
            DesiredResource::Peering { id, remote, .. } => {
                self.require_parent(&resource, &id.network().to_string())?;
                self.require_parent(&resource, &remote.to_string())
            }
            DesiredResource::ManagedCluster { id, node_subnet, .. } => {
                self.require_parent(&resource, &id.group().to_string())?;
                self.require_parent(&resource, &node_subnet.to_string())
            }
            DesiredResource::RoleAssignment { id, .. } => {
                self.require_parent(&resource, &id.scope().to_string())
            }
        }
    }

    /// Direct children of `network` in `collection`
    fn children(&self, network: &str, collection: &str) -> Vec<&ProvisionedResource> {
        let prefix = format!("{}/{}/", network, collection);
        self.resources
            .iter()
            .filter(|(id, _)| id.starts_with(&prefix) && !id[prefix.len()..].contains('/'))
            .map(|(_, r)| r)
            .collect()
    }

    /// A virtual network as ARM returns it, children inline
    fn network_view(&self, id: &str) -> Option<ProvisionedResource> {
        let mut network = self.resources.get(id)?.clone();
        for collection in NETWORK_CHILD_COLLECTIONS {
            let children: Vec<serde_json::Value> = self
                .children(id, collection)
                .into_iter()
                .map(|child| {
                    json!({
                        "id": child.id,
                        "name": resource_name(&child.id),
                        "properties": child.properties,
                    })
                })
                .collect();
            network.properties[collection] = json!(children);
        }
        Some(network)
    }

    fn live(&self, desired: &DesiredResource, id: &str) -> Option<ProvisionedResource> {
        match desired {
            DesiredResource::VirtualNetwork { .. } => self.network_view(id),
            _ => self.resources.get(id).cloned(),
        }
    }

    fn subnet_in_use(&self, subnet: &str) -> bool {
        self.resources.values().any(|r| {
            r.properties["agentPoolProfiles"]
                .as_array()
                .map(|pools| pools.iter().any(|p| p["vnetSubnetID"].as_str() == Some(subnet)))
                .unwrap_or(false)
        })
    }

    /// Check a PUT body against what already exists under `id`. A network
    /// PUT deletes every child its body does not list.
    fn accept_put(
        &mut self,
        desired: &DesiredResource,
        id: &str,
        body: &serde_json::Value,
    ) -> Result<(), ProvisionError> {
        match desired {
            DesiredResource::VirtualNetwork { .. } => {
                let mut dropped = Vec::new();
                for collection in NETWORK_CHILD_COLLECTIONS {
                    let listed: HashSet<String> = body["properties"][collection]
                        .as_array()
                        .map(|children| {
                            children
                                .iter()
                                .filter_map(|c| c["name"].as_str().map(str::to_string))
                                .collect()
                        })
                        .unwrap_or_default();
                    for child in self.children(id, collection) {
                        if !listed.contains(resource_name(&child.id)) {
                            dropped.push(child.id.clone());
                        }
                    }
                }

                if let Some(in_use) = dropped.iter().find(|child| self.subnet_in_use(child)) {
                    return Err(ProvisionError::Rejected {
                        resource: id.to_string(),
                        status: 400,
                        message: format!("InUseSubnetCannotBeDeleted: {} is in use", in_use),
                    });
                }
                for child in dropped {
                    self.remove_tree(&child);
                }
                Ok(())
            }
            DesiredResource::RoleAssignment { principal_id, .. } => {
                let current = self
                    .resources
                    .get(id)
                    .and_then(|r| r.properties["principalId"].as_str());
                match current {
                    Some(current) if current != principal_id.as_str() => {
                        Err(ProvisionError::Rejected {
                            resource: id.to_string(),
                            status: 409,
                            message: "RoleAssignmentUpdateNotPermitted: principal cannot change"
                                .to_string(),
                        })
                    }
                    _ => Ok(()),
                }
            }
            _ => Ok(()),
        }
    }

    /// The peering in `remote` that points back at `local`
    fn reverse_peering(&self, local: &str, remote: &str) -> Option<String> {
        let prefix = format!("{}/virtualNetworkPeerings/", remote);
        self.resources
            .iter()
            .filter(|(id, _)| id.starts_with(&prefix))
            .find(|(_, r)| r.properties["remoteVirtualNetwork"]["id"].as_str() == Some(local))
            .map(|(id, _)| id.clone())
    }

    fn set_peering_state(&mut self, id: &str, state: PeeringState) {
        if let Some(peering) = self.resources.get_mut(id) {
            peering.properties["peeringState"] = json!(state.to_string());
        }
    }

    /// Remove `id` and everything nested under it
    fn remove_tree(&mut self, id: &str) {
        let nested = format!("{}/", id);
        let removed: Vec<String> = self
            .resources
            .keys()
            .filter(|k| k.as_str() == id || k.starts_with(&nested))
            .cloned()
            .collect();

        for key in &removed {
            self.resources.remove(key);
        }

        // Peerings whose remote network went away are left disconnected
        let orphaned: Vec<String> = self
            .resources
            .iter()
            .filter(|(_, r)| {
                r.properties["remoteVirtualNetwork"]["id"]
                    .as_str()
                    .map(|remote| removed.iter().any(|k| k == remote))
                    .unwrap_or(false)
            })
            .map(|(k, _)| k.clone())
            .collect();
        for key in orphaned {
            self.set_peering_state(&key, PeeringState::Disconnected);
        }
    }
}

fn resource_name(id: &str) -> &str {
    id.rsplit('/').next().unwrap_or(id)
}

/// Fake kubeconfig served for a cluster
fn kubeconfig_for(cluster: &ManagedClusterId, kind: CredentialKind) -> String {
    format!(
        "apiVersion: v1\nkind: Config\nclusters:\n- name: {name}\n  cluster:\n    server: https://{name}.hcp.example.azmk8s.io:443\nusers:\n- name: cluster{kind}_{group}_{name}\ncurrent-context: {name}\n",
        name = cluster.name(),
        group = cluster.group().name(),
        kind = kind,
    )
}

/// ARM-like backend held entirely in process memory
#[derive(Debug, Default)]
pub struct InMemoryProvider {
    state: Mutex<MemoryState>,
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every apply of the resource named `name` end in `Failed`
    pub fn fail_resource(&self, name: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.failing.insert(name.to_string());
        }
    }

    /// Leave the resource named `name` in `Creating` forever
    pub fn stall_resource(&self, name: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.stalled.insert(name.to_string());
        }
    }

    /// Clear injected failures and stalls
    pub fn heal(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.failing.clear();
            state.stalled.clear();
        }
    }

    /// Number of resources currently held
    pub fn resource_count(&self) -> usize {
        self.state.lock().map(|s| s.resources.len()).unwrap_or(0)
    }

    /// How many times the resource with full id `id` was applied
    pub fn apply_count(&self, id: &str) -> usize {
        self.state
            .lock()
            .map(|s| s.apply_counts.get(id).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.state
            .lock()
            .map(|s| s.resources.contains_key(id))
            .unwrap_or(false)
    }

    fn lock(&self, resource: &str) -> Result<std::sync::MutexGuard<'_, MemoryState>, ProvisionError> {
        self.state.lock().map_err(|_| ProvisionError::Transport {
            resource: resource.to_string(),
            message: "in-memory state lock poisoned".to_string(),
        })
    }
}

#[async_trait]
impl ResourceProvider for InMemoryProvider {
    fn name(&self) -> &str {
        "in-memory"
    }

    async fn apply(&self, desired: &DesiredResource) -> Result<ProvisionedResource, ProvisionError> {
        let id = desired.id().to_string();
        let mut state = self.lock(&id)?;

        state.check_parents(desired)?;

        let live = if desired.reads_before_put() {
            state.live(desired, &id)
        } else {
            None
        };
        if live.as_ref().map(|current| desired.must_replace(current)).unwrap_or(false) {
            state.remove_tree(&id);
        }
        let body = desired.put_body(live.as_ref());
        state.accept_put(desired, &id, &body)?;
        *state.apply_counts.entry(id.clone()).or_default() += 1;

        let name = resource_name(&id).to_string();
        let mut properties = body.get("properties").cloned().unwrap_or_else(|| json!({}));
        // Children are held as resources of their own
        if let Some(fields) = properties.as_object_mut() {
            for collection in NETWORK_CHILD_COLLECTIONS {
                fields.remove(collection);
            }
        }
        let mut identity = None;

        let provisioning = if state.failing.contains(&name) {
            ProvisioningState::Failed
        } else if state.stalled.contains(&name) {
            ProvisioningState::Creating
        } else {
            ProvisioningState::Succeeded
        };
        properties["provisioningState"] = json!(provisioning.to_string());

        match desired {
            DesiredResource::ManagedCluster { id: cluster, location, .. }
                if provisioning.is_ready() =>
            {
                identity = Some(json!({
                    "type": "SystemAssigned",
                    "principalId": Uuid::new_v5(&Uuid::NAMESPACE_URL, id.as_bytes()).to_string(),
                }));
                // The cluster owns its infrastructure resource group
                if let Ok(infra) = cluster.node_resource_group() {
                    let infra_id = infra.to_string();
                    state.resources.entry(infra_id.clone()).or_insert(ProvisionedResource {
                        id: infra_id,
                        state: ProvisioningState::Succeeded,
                        properties: json!({
                            "provisioningState": "Succeeded",
                            "managedBy": id,
                            "location": location,
                        }),
                        identity: None,
                    });
                }
            }
            DesiredResource::Peering { id: peering, remote, .. } if provisioning.is_ready() => {
                let local = peering.network().to_string();
                match state.reverse_peering(&local, &remote.to_string()) {
                    Some(reverse) => {
                        state.set_peering_state(&reverse, PeeringState::Connected);
                        properties["peeringState"] = json!(PeeringState::Connected.to_string());
                    }
                    None => {
                        properties["peeringState"] = json!(PeeringState::Initiated.to_string());
                    }
                }
            }
            _ => {}
        }

        let resource = ProvisionedResource {
            id: id.clone(),
            state: provisioning.clone(),
            properties,
            identity,
        };
        state.resources.insert(id.clone(), resource.clone());
        let resource = match desired {
            DesiredResource::VirtualNetwork { .. } => state.network_view(&id).unwrap_or(resource),
            _ => resource,
        };

        match provisioning {
            ProvisioningState::Succeeded => Ok(resource),
            ProvisioningState::Creating => Err(ProvisionError::Pending {
                resource: id,
                state: provisioning,
                waited: Duration::ZERO,
            }),
            other => Err(ProvisionError::Failed {
                resource: id,
                state: other,
            }),
        }
    }

    async fn read(&self, id: &ResourceId) -> Result<Option<ProvisionedResource>, ProvisionError> {
        let key = id.to_string();
        let state = self.lock(&key)?;
        match id {
            ResourceId::VirtualNetwork(_) => Ok(state.network_view(&key)),
            _ => Ok(state.resources.get(&key).cloned()),
        }
    }

    async fn delete(&self, id: &ResourceId) -> Result<(), ProvisionError> {
        let key = id.to_string();
        let mut state = self.lock(&key)?;

        if let ResourceId::ManagedCluster(cluster) = id {
            if let Ok(infra) = cluster.node_resource_group() {
                state.remove_tree(&infra.to_string());
            }
        }
        state.remove_tree(&key);
        Ok(())
    }

    async fn list_credentials(
        &self,
        cluster: &ManagedClusterId,
        kind: CredentialKind,
    ) -> Result<Vec<EncodedKubeconfig>, ProvisionError> {
        let key = cluster.to_string();
        let state = self.lock(&key)?;

        match state.resources.get(&key) {
            Some(resource) if resource.state.is_ready() => {}
            Some(resource) => {
                return Err(ProvisionError::Rejected {
                    resource: key,
                    status: 409,
                    message: format!("cluster is {}", resource.state),
                })
            }
            None => {
                return Err(ProvisionError::Rejected {
                    resource: key,
                    status: 404,
                    message: "ResourceNotFound".to_string(),
                })
            }
        }

        let name = match kind {
            CredentialKind::Admin => "clusterAdmin",
            CredentialKind::User => "clusterUser",
        };
        Ok(vec![EncodedKubeconfig {
            name: name.to_string(),
            value: base64::engine::general_purpose::STANDARD.encode(kubeconfig_for(cluster, kind)),
        }])
    }
}

//! Full multi-region topology
//!
//! Runs every builder over a validated catalog and keeps the handles the
//! output exporter needs.

use tracing::info;

use super::access::{grant_access, AccessGrants};
use super::cluster::{build_cluster, ClusterHandle, ClusterNetwork};
use super::credentials::{extract_credentials, CredentialKind};
use super::graph::{NodeId, ResourceGraph};
use super::network::{build_network, NetworkHandles};
use super::peering::{build_bidirectional, PeeringPair};
use super::validate::ValidatedCatalog;
use crate::config::AzureContext;
use crate::error::GraphError;

/// Everything declared for one region
#[derive(Debug, Clone)]
pub struct RegionDeployment {
    pub name: String,
    pub network: NetworkHandles,
    pub cluster: ClusterHandle,
    pub access: AccessGrants,
    pub credentials: NodeId,
}

#[derive(Debug, Clone)]
pub struct Stack {
    graph: ResourceGraph,
    regions: Vec<RegionDeployment>,
    peerings: Vec<PeeringPair>,
}

impl Stack {
    pub fn build(
        ctx: &AzureContext,
        catalog: &ValidatedCatalog,
        credential_kind: CredentialKind,
    ) -> Result<Self, GraphError> {
        let mut graph = ResourceGraph::new();
        let mut regions = Vec::with_capacity(catalog.regions().len());

        for region in catalog.regions() {
            let network = build_network(&mut graph, ctx, region)?;
            let cluster = build_cluster(
                &mut graph,
                &network.resource_group,
                &network.location,
                &region.descriptor.cluster_name,
                &network.subnet,
                ClusterNetwork {
                    pod_cidr: region.networks.pod_cidr,
                    service_cidr: region.networks.service_cidr,
                    dns_service_ip: region.networks.dns_service_ip,
                },
                catalog.cluster_policy(),
            )?;
            let access = grant_access(&mut graph, &cluster, &network.resource_group)?;
            let credentials = extract_credentials(&mut graph, cluster.cluster(), credential_kind)?;

            regions.push(RegionDeployment {
                name: region.name().to_string(),
                network,
                cluster,
                access,
                credentials,
            });
        }

        let mut peerings = Vec::with_capacity(catalog.peerings().len());
        for declaration in catalog.peerings() {
            // Validation guarantees both endpoints are catalog regions
            let endpoint = |name: &str| {
                regions
                    .iter()
                    .find(|r| r.name == name)
                    .map(|r| r.network.virtual_network.clone())
            };
            let (Some(from), Some(to)) = (endpoint(&declaration.from), endpoint(&declaration.to)) else {
                continue;
            };

            peerings.push(build_bidirectional(
                &mut graph,
                &declaration.key(),
                &from,
                &to,
                &declaration.forward_name,
                &declaration.reverse_name,
            )?);
        }

        info!(
            regions = regions.len(),
            peerings = peerings.len(),
            resources = graph.len(),
            "Built topology graph"
        );

        Ok(Self {
            graph,
            regions,
            peerings,
        })
    }

    pub fn graph(&self) -> &ResourceGraph {
        &self.graph
    }

    pub fn regions(&self) -> &[RegionDeployment] {
        &self.regions
    }

    pub fn peerings(&self) -> &[PeeringPair] {
        &self.peerings
    }

    /// Region that owns `node`, if any. Peerings belong to no single region.
    pub fn region_of(&self, node: NodeId) -> Option<&str> {
        self.regions
            .iter()
            .find(|r| {
                let owned = [
                    r.network.resource_group.node(),
                    r.network.virtual_network.node(),
                    r.network.subnet.node(),
                    r.cluster.cluster().node(),
                    r.access.infrastructure,
                    r.access.primary,
                    r.credentials,
                ];
                owned.contains(&node)
            })
            .map(|r| r.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::catalog::RegionCatalog;
    use crate::topology::ids::ResourceKind;

    fn stack() -> Stack {
        let catalog = RegionCatalog::default_europe().validate().unwrap();
        Stack::build(&AzureContext::for_tests(), &catalog, CredentialKind::Admin).unwrap()
    }

    #[test]
    fn test_resource_counts() {
        let stack = stack();
        let graph = stack.graph();

        assert_eq!(graph.count(ResourceKind::ResourceGroup), 3);
        assert_eq!(graph.count(ResourceKind::VirtualNetwork), 3);
        assert_eq!(graph.count(ResourceKind::Subnet), 3);
        assert_eq!(graph.count(ResourceKind::ManagedCluster), 3);
        assert_eq!(graph.count(ResourceKind::RoleAssignment), 6);
        assert_eq!(graph.count(ResourceKind::ClusterCredentials), 3);
        assert_eq!(graph.count(ResourceKind::VirtualNetworkPeering), 6);
        assert_eq!(stack.peerings().len(), 3);
    }

    #[test]
    fn test_peering_keys() {
        let stack = stack();
        let keys: Vec<_> = stack.peerings().iter().map(|p| p.key.as_str()).collect();

        assert_eq!(
            keys,
            vec![
                "northeurope_westeurope",
                "northeurope_francecentral",
                "westeurope_francecentral"
            ]
        );
    }

    #[test]
    fn test_region_ownership() {
        let stack = stack();
        let ne = &stack.regions()[0];

        assert_eq!(stack.region_of(ne.cluster.cluster().node()), Some("northeurope"));
        assert_eq!(stack.region_of(ne.credentials), Some("northeurope"));
        assert_eq!(stack.region_of(stack.peerings()[0].forward.node()), None);
    }

    #[test]
    fn test_regions_are_independent() {
        let stack = stack();
        let graph = stack.graph();
        let ne = &stack.regions()[0];
        let we = &stack.regions()[1];

        let downstream = graph.transitive_dependents(ne.network.resource_group.node());
        assert!(downstream.contains(&ne.credentials));
        assert!(!downstream.contains(&we.cluster.cluster().node()));
        // Peerings touching the failed region are downstream of it
        assert!(downstream.contains(&stack.peerings()[0].forward.node()));
        assert!(!downstream.contains(&stack.peerings()[2].forward.node()));
    }
}

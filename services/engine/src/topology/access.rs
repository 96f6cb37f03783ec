//! Access Grantor
//!
//! Binds a cluster's system-assigned identity to the Network Contributor role
//! on its infrastructure resource group and on its primary resource group.

use super::cluster::ClusterHandle;
use super::graph::{NodeId, Ref, ResourceGraph};
use super::ids::{ResourceGroupId, RoleAssignmentId, RoleDefinitionId};
use super::resources::{AssignmentScope, PrincipalType, ResourceSpec, RoleAssignmentSpec};
use crate::error::GraphError;

/// The two role assignments of one cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessGrants {
    /// Scoped to `<cluster>-vm`
    pub infrastructure: NodeId,
    /// Scoped to the cluster's own resource group
    pub primary: NodeId,
}

fn grant(
    graph: &mut ResourceGraph,
    cluster: &ClusterHandle,
    scope: AssignmentScope,
) -> Result<NodeId, GraphError> {
    let role = RoleDefinitionId::network_contributor(scope.group().subscription());
    let id = RoleAssignmentId::derive(scope.group(), &role, cluster.id());

    graph.declare(ResourceSpec::RoleAssignment(RoleAssignmentSpec {
        id,
        scope,
        role_definition: role,
        principal: cluster.principal(),
        principal_type: PrincipalType::ServicePrincipal,
    }))
}

pub fn grant_access(
    graph: &mut ResourceGraph,
    cluster: &ClusterHandle,
    group: &Ref<ResourceGroupId>,
) -> Result<AccessGrants, GraphError> {
    let infrastructure = grant(
        graph,
        cluster,
        AssignmentScope::ClusterManaged(cluster.node_resource_group()?),
    )?;
    let primary = grant(graph, cluster, AssignmentScope::Declared(group.clone()))?;

    Ok(AccessGrants {
        infrastructure,
        primary,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AzureContext;
    use crate::topology::catalog::RegionCatalog;
    use crate::topology::cluster::{build_cluster, ClusterNetwork};
    use crate::topology::ids::{ResourceKind, NETWORK_CONTRIBUTOR_ROLE};
    use crate::topology::network::build_network;

    fn setup() -> (ResourceGraph, ClusterHandle, Ref<ResourceGroupId>) {
        let catalog = RegionCatalog::default_europe().validate().unwrap();
        let ctx = AzureContext::for_tests();
        let mut graph = ResourceGraph::new();
        let region = &catalog.regions()[0];
        let net = build_network(&mut graph, &ctx, region).unwrap();
        let cluster = build_cluster(
            &mut graph,
            &net.resource_group,
            &net.location,
            &region.descriptor.cluster_name,
            &net.subnet,
            ClusterNetwork {
                pod_cidr: region.networks.pod_cidr,
                service_cidr: region.networks.service_cidr,
                dns_service_ip: region.networks.dns_service_ip,
            },
            catalog.cluster_policy(),
        )
        .unwrap();
        (graph, cluster, net.resource_group)
    }

    fn assignment(graph: &ResourceGraph, node: NodeId) -> RoleAssignmentSpec {
        match graph.node(node).spec() {
            ResourceSpec::RoleAssignment(spec) => spec.clone(),
            other => panic!("expected a role assignment, got {:?}", other.kind()),
        }
    }

    #[test]
    fn test_two_grants_with_distinct_scopes() {
        let (mut graph, cluster, group) = setup();
        let grants = grant_access(&mut graph, &cluster, &group).unwrap();

        let infra = assignment(&graph, grants.infrastructure);
        let primary = assignment(&graph, grants.primary);

        assert_eq!(infra.scope.group().name(), "k8s-cluster-ne-vm");
        assert_eq!(primary.scope.group(), group.id());
        assert_ne!(infra.id, primary.id);
        for spec in [&infra, &primary] {
            assert_eq!(spec.role_definition.role(), NETWORK_CONTRIBUTOR_ROLE);
            assert_eq!(spec.principal, cluster.principal());
            assert_eq!(spec.principal_type, PrincipalType::ServicePrincipal);
        }
    }

    #[test]
    fn test_grants_wait_for_cluster() {
        let (mut graph, cluster, group) = setup();
        let grants = grant_access(&mut graph, &cluster, &group).unwrap();
        let cluster_node = cluster.cluster().node();

        assert!(graph.node(grants.infrastructure).depends_on().contains(&cluster_node));
        assert!(graph.node(grants.primary).depends_on().contains(&cluster_node));
        assert!(graph.node(grants.primary).depends_on().contains(&group.node()));
    }

    #[test]
    fn test_regrant_is_idempotent() {
        let (mut graph, cluster, group) = setup();
        let first = grant_access(&mut graph, &cluster, &group).unwrap();
        let second = grant_access(&mut graph, &cluster, &group).unwrap();

        assert_eq!(first, second);
        assert_eq!(graph.count(ResourceKind::RoleAssignment), 2);
    }
}

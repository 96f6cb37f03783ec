//! Network Builder
//!
//! Per region: resource group, then virtual network, then node subnet.
//! Regions are independent of each other.

use tracing::debug;

use super::graph::{Ref, ResourceGraph};
use super::ids::{ResourceGroupId, SubnetId, VirtualNetworkId};
use super::resources::{ResourceGroupSpec, ResourceSpec, SubnetSpec, VirtualNetworkSpec};
use super::validate::ValidatedRegion;
use crate::config::AzureContext;
use crate::error::GraphError;

/// Handles to one region's network chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkHandles {
    pub location: String,
    pub resource_group: Ref<ResourceGroupId>,
    pub virtual_network: Ref<VirtualNetworkId>,
    pub subnet: Ref<SubnetId>,
}

pub fn build_network(
    graph: &mut ResourceGraph,
    ctx: &AzureContext,
    region: &ValidatedRegion,
) -> Result<NetworkHandles, GraphError> {
    let descriptor = &region.descriptor;
    let location = descriptor.location.clone();

    let group_id = ResourceGroupId::new(ctx.subscription, &descriptor.resource_group_name)?;
    let group_node = graph.declare(ResourceSpec::ResourceGroup(ResourceGroupSpec {
        id: group_id.clone(),
        location: location.clone(),
    }))?;
    let resource_group = Ref::new(group_node, group_id);

    let vnet_id = VirtualNetworkId::new(resource_group.id(), &descriptor.vnet_name)?;
    let vnet_node = graph.declare(ResourceSpec::VirtualNetwork(VirtualNetworkSpec {
        id: vnet_id.clone(),
        group: resource_group.clone(),
        location: location.clone(),
        address_prefixes: region.networks.address_space.clone(),
    }))?;
    let virtual_network = Ref::new(vnet_node, vnet_id);

    let subnet_id = SubnetId::new(virtual_network.id(), &descriptor.node_subnet_name)?;
    let subnet_node = graph.declare(ResourceSpec::Subnet(SubnetSpec {
        id: subnet_id.clone(),
        network: virtual_network.clone(),
        address_prefix: region.networks.node_subnet,
    }))?;
    let subnet = Ref::new(subnet_node, subnet_id);

    debug!(region = %region.name(), vnet = %virtual_network.id(), "Declared region network");

    Ok(NetworkHandles {
        location,
        resource_group,
        virtual_network,
        subnet,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::catalog::RegionCatalog;
    use crate::topology::ids::ResourceKind;
    use crate::topology::resources::ResourceSpec;

    #[test]
    fn test_one_chain_per_region() {
        let catalog = RegionCatalog::default_europe().validate().unwrap();
        let ctx = AzureContext::for_tests();
        let mut graph = ResourceGraph::new();

        for region in catalog.regions() {
            let net = build_network(&mut graph, &ctx, region).unwrap();
            assert_eq!(net.location, region.descriptor.location);
            assert!(graph
                .node(net.virtual_network.node())
                .depends_on()
                .contains(&net.resource_group.node()));
            assert!(graph
                .node(net.subnet.node())
                .depends_on()
                .contains(&net.virtual_network.node()));
        }

        let regions = catalog.regions().len();
        assert_eq!(graph.count(ResourceKind::ResourceGroup), regions);
        assert_eq!(graph.count(ResourceKind::VirtualNetwork), regions);
        assert_eq!(graph.count(ResourceKind::Subnet), regions);
    }

    #[test]
    fn test_subnet_inside_address_space() {
        let catalog = RegionCatalog::default_europe().validate().unwrap();
        let ctx = AzureContext::for_tests();
        let mut graph = ResourceGraph::new();

        for region in catalog.regions() {
            let net = build_network(&mut graph, &ctx, region).unwrap();
            let (prefix, space) = match (
                graph.node(net.subnet.node()).spec(),
                graph.node(net.virtual_network.node()).spec(),
            ) {
                (ResourceSpec::Subnet(s), ResourceSpec::VirtualNetwork(v)) => {
                    (s.address_prefix, v.address_prefixes.clone())
                }
                _ => panic!("unexpected node kinds"),
            };
            assert!(space.iter().any(|block| block.contains(&prefix)));
        }
    }

    #[test]
    fn test_rebuild_is_idempotent() {
        let catalog = RegionCatalog::default_europe().validate().unwrap();
        let ctx = AzureContext::for_tests();
        let mut graph = ResourceGraph::new();
        let region = &catalog.regions()[0];

        let first = build_network(&mut graph, &ctx, region).unwrap();
        let second = build_network(&mut graph, &ctx, region).unwrap();

        assert_eq!(first, second);
        assert_eq!(graph.len(), 3);
    }
}

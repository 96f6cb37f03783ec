//! Peering Builder
//!
//! Each declared region pair becomes two directional peerings. Both depend on
//! both endpoint networks, and neither depends on the other.

use tracing::debug;

use super::graph::{Ref, ResourceGraph};
use super::ids::{PeeringId, VirtualNetworkId};
use super::resources::{PeeringSpec, ResourceSpec};
use crate::error::GraphError;

/// Declare the peering `local` -> `remote`, named `name` inside `local`
pub fn build_peering(
    graph: &mut ResourceGraph,
    local: &Ref<VirtualNetworkId>,
    remote: &Ref<VirtualNetworkId>,
    name: &str,
) -> Result<Ref<PeeringId>, GraphError> {
    let id = PeeringId::new(local.id(), name)?;
    let node = graph.declare(ResourceSpec::Peering(PeeringSpec {
        id: id.clone(),
        local: local.clone(),
        remote: remote.clone(),
        allow_virtual_network_access: true,
        allow_forwarded_traffic: true,
    }))?;
    Ok(Ref::new(node, id))
}

/// Both directions of one region pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeeringPair {
    /// `"<from>_<to>"`
    pub key: String,
    pub forward: Ref<PeeringId>,
    pub reverse: Ref<PeeringId>,
}

pub fn build_bidirectional(
    graph: &mut ResourceGraph,
    key: &str,
    from: &Ref<VirtualNetworkId>,
    to: &Ref<VirtualNetworkId>,
    forward_name: &str,
    reverse_name: &str,
) -> Result<PeeringPair, GraphError> {
    let forward = build_peering(graph, from, to, forward_name)?;
    let reverse = build_peering(graph, to, from, reverse_name)?;

    debug!(pair = %key, "Declared bidirectional peering");

    Ok(PeeringPair {
        key: key.to_string(),
        forward,
        reverse,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AzureContext;
    use crate::topology::catalog::RegionCatalog;
    use crate::topology::ids::ResourceKind;
    use crate::topology::network::build_network;

    fn peering_spec(graph: &ResourceGraph, peering: &Ref<PeeringId>) -> PeeringSpec {
        match graph.node(peering.node()).spec() {
            ResourceSpec::Peering(spec) => spec.clone(),
            other => panic!("expected a peering, got {:?}", other.kind()),
        }
    }

    #[test]
    fn test_pair_is_swapped_with_flags() {
        let catalog = RegionCatalog::default_europe().validate().unwrap();
        let ctx = AzureContext::for_tests();
        let mut graph = ResourceGraph::new();
        let ne = build_network(&mut graph, &ctx, &catalog.regions()[0]).unwrap();
        let we = build_network(&mut graph, &ctx, &catalog.regions()[1]).unwrap();

        let pair = build_bidirectional(
            &mut graph,
            "northeurope_westeurope",
            &ne.virtual_network,
            &we.virtual_network,
            "vnet-peering-ne-we",
            "vnet-peering-we-ne",
        )
        .unwrap();

        let forward = peering_spec(&graph, &pair.forward);
        let reverse = peering_spec(&graph, &pair.reverse);
        assert_eq!(forward.local, reverse.remote);
        assert_eq!(forward.remote, reverse.local);
        assert!(forward.allow_virtual_network_access && forward.allow_forwarded_traffic);
        assert!(reverse.allow_virtual_network_access && reverse.allow_forwarded_traffic);
        assert_eq!(graph.count(ResourceKind::VirtualNetworkPeering), 2);
    }

    #[test]
    fn test_peering_waits_on_both_networks_only() {
        let catalog = RegionCatalog::default_europe().validate().unwrap();
        let ctx = AzureContext::for_tests();
        let mut graph = ResourceGraph::new();
        let ne = build_network(&mut graph, &ctx, &catalog.regions()[0]).unwrap();
        let fc = build_network(&mut graph, &ctx, &catalog.regions()[2]).unwrap();

        let pair = build_bidirectional(
            &mut graph,
            "northeurope_francecentral",
            &ne.virtual_network,
            &fc.virtual_network,
            "vnet-peering-ne-fc",
            "vnet-peering-fc-ne",
        )
        .unwrap();

        let expected = [ne.virtual_network.node(), fc.virtual_network.node()];
        for peering in [&pair.forward, &pair.reverse] {
            let deps: Vec<_> = graph.node(peering.node()).depends_on().iter().copied().collect();
            assert_eq!(deps, expected.to_vec());
        }
    }

    #[test]
    fn test_redeclare_pair_is_idempotent() {
        let catalog = RegionCatalog::default_europe().validate().unwrap();
        let ctx = AzureContext::for_tests();
        let mut graph = ResourceGraph::new();
        let ne = build_network(&mut graph, &ctx, &catalog.regions()[0]).unwrap();
        let we = build_network(&mut graph, &ctx, &catalog.regions()[1]).unwrap();

        let build = |graph: &mut ResourceGraph| {
            build_bidirectional(
                graph,
                "northeurope_westeurope",
                &ne.virtual_network,
                &we.virtual_network,
                "vnet-peering-ne-we",
                "vnet-peering-we-ne",
            )
            .unwrap()
        };
        let first = build(&mut graph);
        let second = build(&mut graph);

        assert_eq!(first, second);
        assert_eq!(graph.count(ResourceKind::VirtualNetworkPeering), 2);
    }
}

//! Output Exporter
//!
//! The published result set: subnet and network ids per region, both peering
//! states per region pair, and decoded kubeconfigs.

use std::collections::BTreeMap;
use std::ops::Index;

use serde::{Serialize, Serializer};
use serde_json::json;

use super::credentials::Secret;
use super::stack::Stack;
use crate::orchestrator::{NodeOutcome, RunReport};
use crate::provider::PeeringState;

#[derive(Debug, Clone, Default, Serialize)]
pub struct StackOutputs {
    /// region -> node subnet id
    pub subnet_node_ids: BTreeMap<String, String>,
    /// region -> virtual network id
    pub virtual_network_ids: BTreeMap<String, String>,
    /// `"<from>_<to>"` -> (forward state, reverse state)
    pub vnet_peering_states: PeeringStates,
    /// region -> decoded kubeconfig, only for regions whose cluster is ready
    pub kubeconfigs: BTreeMap<String, Secret<String>>,
}

/// Forward and reverse state of one peering pair
pub type PairStates = (PeeringState, PeeringState);

/// Peering states keyed by `"<from>_<to>"`, in catalog declaration order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeeringStates(Vec<(String, PairStates)>);

impl PeeringStates {
    /// Set the states of `key`. A key seen before keeps its position.
    pub fn insert(&mut self, key: String, states: PairStates) {
        match self.0.iter_mut().find(|(existing, _)| *existing == key) {
            Some((_, slot)) => *slot = states,
            None => self.0.push((key, states)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&PairStates> {
        self.0
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, states)| states)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.iter().map(|(key, _)| key)
    }

    pub fn values(&self) -> impl Iterator<Item = &PairStates> {
        self.0.iter().map(|(_, states)| states)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PairStates)> {
        self.0.iter().map(|(key, states)| (key, states))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Index<&str> for PeeringStates {
    type Output = PairStates;

    fn index(&self, key: &str) -> &PairStates {
        match self.get(key) {
            Some(states) => states,
            None => panic!("no peering states for '{}'", key),
        }
    }
}

impl Serialize for PeeringStates {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.iter())
    }
}

impl StackOutputs {
    pub fn collect(stack: &Stack, report: &RunReport) -> Self {
        let mut outputs = StackOutputs::default();

        for region in stack.regions() {
            if let Some(subnet) = report.outcome(region.network.subnet.node()).and_then(NodeOutcome::resource) {
                outputs
                    .subnet_node_ids
                    .insert(region.name.clone(), subnet.id.clone());
            }

            if let Some(vnet) = report
                .outcome(region.network.virtual_network.node())
                .and_then(NodeOutcome::resource)
            {
                outputs
                    .virtual_network_ids
                    .insert(region.name.clone(), vnet.id.clone());
            }

            if let Some(NodeOutcome::Credentials(kubeconfig)) = report.outcome(region.credentials) {
                outputs
                    .kubeconfigs
                    .insert(region.name.clone(), kubeconfig.clone());
            }
        }

        let state_of = |node| {
            report
                .outcome(node)
                .and_then(NodeOutcome::resource)
                .map(|r| r.peering_state())
                .unwrap_or(PeeringState::Unknown)
        };
        for pair in stack.peerings() {
            outputs.vnet_peering_states.insert(
                pair.key.clone(),
                (state_of(pair.forward.node()), state_of(pair.reverse.node())),
            );
        }

        outputs
    }

    /// JSON document of all outputs. Kubeconfigs stay redacted unless
    /// `reveal_secrets` is set.
    pub fn to_json(&self, reveal_secrets: bool) -> serde_json::Value {
        let kubeconfigs: BTreeMap<&str, serde_json::Value> = self
            .kubeconfigs
            .iter()
            .map(|(region, secret)| {
                let value = if reveal_secrets {
                    json!(secret.expose())
                } else {
                    json!(secret.to_string())
                };
                (region.as_str(), value)
            })
            .collect();

        json!({
            "subnet_node_ids": self.subnet_node_ids,
            "virtual_network_ids": self.virtual_network_ids,
            "vnet_peering_states": self.vnet_peering_states,
            "kubeconfigs": kubeconfigs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::config::AzureContext;
    use crate::orchestrator::Orchestrator;
    use crate::provider::InMemoryProvider;
    use crate::topology::catalog::RegionCatalog;
    use crate::topology::credentials::CredentialKind;

    async fn applied(provider: Arc<InMemoryProvider>) -> (Stack, RunReport) {
        let catalog = RegionCatalog::default_europe().validate().unwrap();
        let stack = Stack::build(&AzureContext::for_tests(), &catalog, CredentialKind::Admin).unwrap();
        let report = Orchestrator::new(provider, 4).apply(stack.graph()).await;
        (stack, report)
    }

    #[tokio::test]
    async fn test_outputs_after_full_apply() {
        let (stack, report) = applied(Arc::new(InMemoryProvider::new())).await;
        let outputs = StackOutputs::collect(&stack, &report);

        assert_eq!(outputs.subnet_node_ids.len(), 3);
        assert_eq!(outputs.virtual_network_ids.len(), 3);
        assert_eq!(outputs.kubeconfigs.len(), 3);
        assert!(outputs.subnet_node_ids["northeurope"].ends_with("/subnets/node-subnet-ne"));

        for states in outputs.vnet_peering_states.values() {
            assert_eq!(*states, (PeeringState::Connected, PeeringState::Connected));
        }
    }

    #[tokio::test]
    async fn test_peering_states_follow_catalog_order() {
        let (stack, report) = applied(Arc::new(InMemoryProvider::new())).await;
        let outputs = StackOutputs::collect(&stack, &report);
        let expected = [
            "northeurope_westeurope",
            "northeurope_francecentral",
            "westeurope_francecentral",
        ];

        assert_eq!(outputs.vnet_peering_states.keys().map(String::as_str).collect::<Vec<_>>(), expected);

        let json = outputs.to_json(false);
        let keys: Vec<&str> = json["vnet_peering_states"]
            .as_object()
            .unwrap()
            .keys()
            .map(String::as_str)
            .collect();
        assert_eq!(keys, expected);
    }

    #[test]
    fn test_peering_states_reinsert_keeps_position() {
        let mut states = PeeringStates::default();
        states.insert("b_a".to_string(), (PeeringState::Initiated, PeeringState::Unknown));
        states.insert("a_c".to_string(), (PeeringState::Unknown, PeeringState::Unknown));
        states.insert("b_a".to_string(), (PeeringState::Connected, PeeringState::Connected));

        assert_eq!(states.len(), 2);
        assert_eq!(states.keys().map(String::as_str).collect::<Vec<_>>(), ["b_a", "a_c"]);
        assert_eq!(states["b_a"], (PeeringState::Connected, PeeringState::Connected));
        assert!(states.get("c_a").is_none());
    }

    #[tokio::test]
    async fn test_json_redacts_unless_revealed() {
        let (stack, report) = applied(Arc::new(InMemoryProvider::new())).await;
        let outputs = StackOutputs::collect(&stack, &report);

        let hidden = outputs.to_json(false);
        assert_eq!(hidden["kubeconfigs"]["westeurope"], "[REDACTED]");
        assert_eq!(hidden["vnet_peering_states"]["northeurope_westeurope"][0], "Connected");

        let shown = outputs.to_json(true);
        assert!(shown["kubeconfigs"]["westeurope"]
            .as_str()
            .unwrap()
            .starts_with("apiVersion: v1"));
    }

    #[tokio::test]
    async fn test_failed_region_keeps_peering_keys() {
        let provider = Arc::new(InMemoryProvider::new());
        provider.fail_resource("rg-aks-francecentral");
        let (stack, report) = applied(provider).await;
        let outputs = StackOutputs::collect(&stack, &report);

        assert_eq!(outputs.vnet_peering_states.len(), 3);
        assert_eq!(
            outputs.vnet_peering_states["westeurope_francecentral"],
            (PeeringState::Unknown, PeeringState::Unknown)
        );
        assert!(!outputs.kubeconfigs.contains_key("francecentral"));
        assert_eq!(outputs.kubeconfigs.len(), 2);
    }
}

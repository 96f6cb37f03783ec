//! End-to-end scenarios against the in-memory backend

use std::io::Write;
use std::sync::Arc;

use aks_mesh_engine::config::AzureContext;
use aks_mesh_engine::orchestrator::{NodeOutcome, Orchestrator};
use aks_mesh_engine::provider::{InMemoryProvider, PeeringState};
use aks_mesh_engine::topology::credentials::CredentialKind;
use aks_mesh_engine::topology::ids::{ResourceKind, SubscriptionId};
use aks_mesh_engine::topology::{RegionCatalog, Stack, StackOutputs};

const SUBSCRIPTION: &str = "6f1c2a4e-9b1d-4c8e-a1f2-3d4e5f6a7b8c";

fn context() -> AzureContext {
    AzureContext::new(SubscriptionId::parse(SUBSCRIPTION).unwrap())
}

fn europe() -> Stack {
    let catalog = RegionCatalog::default_europe().validate().unwrap();
    Stack::build(&context(), &catalog, CredentialKind::Admin).unwrap()
}

#[tokio::test]
async fn test_three_region_platform() {
    let stack = europe();
    let provider = Arc::new(InMemoryProvider::new());
    let orchestrator = Orchestrator::new(provider.clone(), 8);

    let report = orchestrator.apply(stack.graph()).await;
    assert!(report.is_success());

    let outputs = StackOutputs::collect(&stack, &report);

    let peering_keys: Vec<&str> = outputs.vnet_peering_states.keys().map(String::as_str).collect();
    assert_eq!(
        peering_keys,
        vec![
            "northeurope_westeurope",
            "northeurope_francecentral",
            "westeurope_francecentral"
        ]
    );
    for states in outputs.vnet_peering_states.values() {
        assert_eq!(*states, (PeeringState::Connected, PeeringState::Connected));
    }

    for region in ["northeurope", "westeurope", "francecentral"] {
        assert!(outputs.subnet_node_ids.contains_key(region));
        assert!(outputs.virtual_network_ids.contains_key(region));
        assert!(outputs.subnet_node_ids[region].starts_with(&outputs.virtual_network_ids[region]));

        let kubeconfig = outputs.kubeconfigs[region].expose();
        assert!(kubeconfig.starts_with("apiVersion: v1"));
    }
    assert_eq!(outputs.subnet_node_ids.len(), 3);
    assert_eq!(outputs.virtual_network_ids.len(), 3);
}

#[tokio::test]
async fn test_role_assignments_target_both_groups() {
    let stack = europe();
    let provider = Arc::new(InMemoryProvider::new());
    let report = Orchestrator::new(provider.clone(), 8).apply(stack.graph()).await;

    for region in stack.regions() {
        let infra = report.outcome(region.access.infrastructure).and_then(NodeOutcome::resource);
        let primary = report.outcome(region.access.primary).and_then(NodeOutcome::resource);
        let (infra, primary) = (infra.unwrap(), primary.unwrap());

        let infra_group = format!("/resourceGroups/{}-vm/", region.cluster.id().name());
        assert!(infra.id.contains(&infra_group));
        assert!(primary
            .id
            .contains(&format!("/resourceGroups/{}/", region.network.resource_group.id().name())));
        assert_eq!(
            infra.properties["principalId"],
            primary.properties["principalId"]
        );
    }
}

#[tokio::test]
async fn test_failed_region_is_isolated() {
    let stack = europe();
    let provider = Arc::new(InMemoryProvider::new());
    provider.fail_resource("k8s-cluster-we");

    let report = Orchestrator::new(provider.clone(), 8).apply(stack.graph()).await;
    let outputs = StackOutputs::collect(&stack, &report);

    assert!(!report.is_success());
    assert_eq!(report.summary().failed, 1);
    // Networking of the failed region still completes
    assert_eq!(outputs.subnet_node_ids.len(), 3);
    assert_eq!(
        outputs.vnet_peering_states["northeurope_westeurope"],
        (PeeringState::Connected, PeeringState::Connected)
    );
    assert!(outputs.kubeconfigs.contains_key("northeurope"));
    assert!(outputs.kubeconfigs.contains_key("francecentral"));
    assert!(!outputs.kubeconfigs.contains_key("westeurope"));
}

#[tokio::test]
async fn test_stuck_cluster_exports_no_kubeconfig() {
    let stack = europe();
    let provider = Arc::new(InMemoryProvider::new());
    provider.stall_resource("k8s-cluster-ne");

    let report = Orchestrator::new(provider.clone(), 8).apply(stack.graph()).await;
    let ne = &stack.regions()[0];

    match report.outcome(ne.cluster.cluster().node()) {
        Some(NodeOutcome::Failed(err)) => assert!(err.is_pending()),
        other => panic!("expected a pending cluster, got {:?}", other),
    }
    for node in [ne.access.infrastructure, ne.access.primary, ne.credentials] {
        assert!(matches!(
            report.outcome(node),
            Some(NodeOutcome::Skipped { blocked_by }) if *blocked_by == ne.cluster.cluster().node()
        ));
    }

    let outputs = StackOutputs::collect(&stack, &report);
    assert!(!outputs.kubeconfigs.contains_key("northeurope"));

    // Once the cluster settles, a second apply completes the region
    provider.heal();
    let report = Orchestrator::new(provider.clone(), 8).apply(stack.graph()).await;
    assert!(report.is_success());
    assert!(StackOutputs::collect(&stack, &report)
        .kubeconfigs
        .contains_key("northeurope"));
}

#[tokio::test]
async fn test_reapply_creates_no_duplicates() {
    let stack = europe();
    let provider = Arc::new(InMemoryProvider::new());
    let orchestrator = Orchestrator::new(provider.clone(), 8);

    assert!(orchestrator.apply(stack.graph()).await.is_success());
    let after_first = provider.resource_count();
    let second = orchestrator.apply(stack.graph()).await;

    // Re-putting a network must keep the subnets its clusters sit in
    assert!(second.is_success());
    assert_eq!(provider.resource_count(), after_first);
    for region in stack.regions() {
        assert!(provider.contains(&region.network.subnet.id().to_string()));
    }
    let cluster = stack.regions()[0].cluster.id().to_string();
    assert_eq!(provider.apply_count(&cluster), 2);

    // Rebuilding the graph from the same catalog declares the same resources
    let again = europe();
    assert_eq!(again.graph().len(), stack.graph().len());
    assert_eq!(
        again.graph().count(ResourceKind::RoleAssignment),
        stack.graph().count(ResourceKind::RoleAssignment)
    );
}

#[tokio::test]
async fn test_catalog_file_with_policy_override() {
    let catalog = serde_json::json!({
        "regions": [
            {
                "name": "swedencentral",
                "resource_group_name": "rg-aks-swedencentral",
                "location": "swedencentral",
                "address_prefixes": ["10.1.0.0/20"],
                "vnet_name": "vnet-sc",
                "node_subnet_name": "node-subnet-sc",
                "node_subnet_prefix": "10.1.0.0/23",
                "pod_cidr": "198.190.0.0/16",
                "service_cidr": "192.190.0.0/16",
                "dns_service_ip": "192.190.0.10",
                "cluster_name": "k8s-cluster-sc"
            },
            {
                "name": "norwayeast",
                "resource_group_name": "rg-aks-norwayeast",
                "location": "norwayeast",
                "address_prefixes": ["10.1.16.0/20"],
                "vnet_name": "vnet-no",
                "node_subnet_name": "node-subnet-no",
                "node_subnet_prefix": "10.1.16.0/23",
                "pod_cidr": "198.192.0.0/16",
                "service_cidr": "192.192.0.0/16",
                "dns_service_ip": "192.192.0.10",
                "cluster_name": "k8s-cluster-no"
            }
        ],
        "peerings": [
            {
                "from": "swedencentral",
                "to": "norwayeast",
                "forward_name": "peer-sc-no",
                "reverse_name": "peer-no-sc"
            }
        ],
        "cluster_policy": { "node_count": 3, "vm_size": "Standard_D4s_v5" }
    });

    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "{}", catalog).unwrap();

    let validated = RegionCatalog::from_file(file.path()).unwrap().validate().unwrap();
    assert_eq!(validated.cluster_policy().node_count, 3);
    assert_eq!(validated.cluster_policy().max_pods, 250);

    let stack = Stack::build(&context(), &validated, CredentialKind::User).unwrap();
    let provider = Arc::new(InMemoryProvider::new());
    let report = Orchestrator::new(provider, 2).apply(stack.graph()).await;
    let outputs = StackOutputs::collect(&stack, &report);

    assert!(report.is_success());
    assert_eq!(
        outputs.vnet_peering_states.keys().map(String::as_str).collect::<Vec<_>>(),
        vec!["swedencentral_norwayeast"]
    );
    assert!(outputs.kubeconfigs["norwayeast"].expose().contains("clusteruser_"));
}

#[tokio::test]
async fn test_destroy_then_refresh_reports_absent() {
    let stack = europe();
    let provider = Arc::new(InMemoryProvider::new());
    let orchestrator = Orchestrator::new(provider.clone(), 8);

    orchestrator.apply(stack.graph()).await;
    let report = orchestrator.destroy(stack.graph()).await;
    assert!(report.is_success());
    assert_eq!(provider.resource_count(), 0);

    let report = orchestrator.refresh(stack.graph()).await;
    assert_eq!(report.summary().absent, stack.graph().len());
    assert!(StackOutputs::collect(&stack, &report).kubeconfigs.is_empty());
}

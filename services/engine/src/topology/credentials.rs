//! Credential Extractor
//!
//! Kubeconfig bundles are read from a cluster once it is ready, decoded and
//! wrapped in [`Secret`] so they cannot end up in logs by accident.

use std::fmt;
use std::str::FromStr;

use base64::Engine;
use serde::{Deserialize, Serialize, Serializer};

use super::graph::{NodeId, Ref, ResourceGraph};
use super::ids::ManagedClusterId;
use super::resources::{CredentialsSpec, ResourceSpec};
use crate::error::{GraphError, ProvisionError};

/// Which kubeconfig bundle to request from the cluster
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialKind {
    #[default]
    Admin,
    User,
}

impl CredentialKind {
    /// ARM action listing this bundle
    pub fn action(self) -> &'static str {
        match self {
            CredentialKind::Admin => "listClusterAdminCredential",
            CredentialKind::User => "listClusterUserCredential",
        }
    }
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialKind::Admin => write!(f, "admin"),
            CredentialKind::User => write!(f, "user"),
        }
    }
}

impl FromStr for CredentialKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "admin" => Ok(CredentialKind::Admin),
            "user" => Ok(CredentialKind::User),
            other => Err(format!("unknown credential kind '{}', expected admin or user", other)),
        }
    }
}

/// One entry of a credential listing, as returned by the API
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct EncodedKubeconfig {
    pub name: String,
    /// base64 encoded kubeconfig
    pub value: String,
}

impl fmt::Debug for EncodedKubeconfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncodedKubeconfig")
            .field("name", &self.name)
            .field("value", &"[REDACTED]")
            .finish()
    }
}

/// Sensitive value that redacts itself in Debug, Display and Serialize
#[derive(Clone, PartialEq, Eq)]
pub struct Secret<T>(T);

impl<T> Secret<T> {
    pub fn new(value: T) -> Self {
        Self(value)
    }

    pub fn expose(&self) -> &T {
        &self.0
    }

    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret([REDACTED])")
    }
}

impl<T> fmt::Display for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl<T> Serialize for Secret<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("[REDACTED]")
    }
}

/// Declare a credential read for `cluster`
pub fn extract_credentials(
    graph: &mut ResourceGraph,
    cluster: &Ref<ManagedClusterId>,
    kind: CredentialKind,
) -> Result<NodeId, GraphError> {
    graph.declare(ResourceSpec::ClusterCredentials(CredentialsSpec {
        cluster: cluster.clone(),
        kind,
    }))
}

/// Decode the primary entry of a credential listing to plain text
pub fn decode_kubeconfig(
    resource: &str,
    entries: &[EncodedKubeconfig],
) -> Result<Secret<String>, ProvisionError> {
    let invalid = |message: String| ProvisionError::InvalidResponse {
        resource: resource.to_string(),
        message,
    };

    let primary = entries
        .first()
        .ok_or_else(|| invalid("credential listing is empty".to_string()))?;

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(primary.value.trim())
        .map_err(|e| invalid(format!("kubeconfig '{}' is not valid base64: {}", primary.name, e)))?;

    let text = String::from_utf8(bytes)
        .map_err(|_| invalid(format!("kubeconfig '{}' is not valid UTF-8", primary.name)))?;

    if text.trim().is_empty() {
        return Err(invalid(format!("kubeconfig '{}' is empty", primary.name)));
    }

    Ok(Secret::new(text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;

    fn entry(name: &str, plain: &str) -> EncodedKubeconfig {
        EncodedKubeconfig {
            name: name.to_string(),
            value: STANDARD.encode(plain),
        }
    }

    #[test]
    fn test_redeclare_returns_same_node() {
        use crate::config::AzureContext;
        use crate::topology::catalog::RegionCatalog;
        use crate::topology::cluster::{build_cluster, ClusterNetwork};
        use crate::topology::ids::ResourceKind;
        use crate::topology::network::build_network;

        let catalog = RegionCatalog::default_europe().validate().unwrap();
        let region = &catalog.regions()[0];
        let mut graph = ResourceGraph::new();
        let net = build_network(&mut graph, &AzureContext::for_tests(), region).unwrap();
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

        let first = extract_credentials(&mut graph, cluster.cluster(), CredentialKind::Admin).unwrap();
        let nodes = graph.len();
        let second = extract_credentials(&mut graph, cluster.cluster(), CredentialKind::Admin).unwrap();

        assert_eq!(first, second);
        assert_eq!(graph.len(), nodes);
        assert_eq!(graph.count(ResourceKind::ClusterCredentials), 1);
        assert_eq!(graph.count(ResourceKind::ManagedCluster), 1);

        // The user bundle is a separate read of the same cluster
        let user = extract_credentials(&mut graph, cluster.cluster(), CredentialKind::User).unwrap();
        assert_ne!(user, first);
        assert_eq!(graph.count(ResourceKind::ClusterCredentials), 2);
    }

    #[test]
    fn test_decode_takes_first_entry() {
        let entries = vec![
            entry("clusterAdmin", "apiVersion: v1\nkind: Config\n"),
            entry("other", "ignored"),
        ];

        let decoded = decode_kubeconfig("cluster", &entries).unwrap();
        assert_eq!(decoded.expose(), "apiVersion: v1\nkind: Config\n");
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(
            decode_kubeconfig("cluster", &[]),
            Err(ProvisionError::InvalidResponse { .. })
        ));

        let garbage = EncodedKubeconfig {
            name: "clusterAdmin".to_string(),
            value: "not base64!!".to_string(),
        };
        assert!(decode_kubeconfig("cluster", &[garbage]).is_err());
    }

    #[test]
    fn test_secret_is_redacted() {
        let secret = Secret::new("token-value".to_string());

        assert_eq!(format!("{}", secret), "[REDACTED]");
        assert!(!format!("{:?}", secret).contains("token-value"));
        assert_eq!(serde_json::to_string(&secret).unwrap(), "\"[REDACTED]\"");
        assert_eq!(secret.into_inner(), "token-value");
    }

    #[test]
    fn test_credential_kind_parsing() {
        assert_eq!("admin".parse::<CredentialKind>(), Ok(CredentialKind::Admin));
        assert_eq!("USER".parse::<CredentialKind>(), Ok(CredentialKind::User));
        assert!("root".parse::<CredentialKind>().is_err());
        assert_eq!(CredentialKind::default(), CredentialKind::Admin);
        assert_eq!(CredentialKind::User.action(), "listClusterUserCredential");
    }
}

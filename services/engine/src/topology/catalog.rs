//! Region Catalog
//!
//! Static per-region parameters and the declared peering pairs. Pure data:
//! see [`super::validate`] for the checks run before anything is provisioned.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::cluster::ClusterPolicy;
use crate::error::CatalogError;

/// Per-region deployment parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionDescriptor {
    /// Region key used in outputs (e.g., "northeurope")
    pub name: String,
    pub resource_group_name: String,
    /// Azure location the resource group is created in
    pub location: String,
    /// Address space of the region's virtual network
    pub address_prefixes: Vec<String>,
    pub vnet_name: String,
    pub node_subnet_name: String,
    /// Must sit inside `address_prefixes`
    pub node_subnet_prefix: String,
    pub pod_cidr: String,
    pub service_cidr: String,
    /// Must be an address inside `service_cidr`
    pub dns_service_ip: String,
    pub cluster_name: String,
}

/// An unordered region pair joined by two directional peerings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeeringDeclaration {
    pub from: String,
    pub to: String,
    /// Name of the `from` -> `to` peering, unique in `from`'s resource group
    pub forward_name: String,
    /// Name of the `to` -> `from` peering, unique in `to`'s resource group
    pub reverse_name: String,
}

impl PeeringDeclaration {
    pub fn new(from: &str, to: &str, forward_name: &str, reverse_name: &str) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            forward_name: forward_name.to_string(),
            reverse_name: reverse_name.to_string(),
        }
    }

    /// Output key for this pair: `"<from>_<to>"`
    pub fn key(&self) -> String {
        format!("{}_{}", self.from, self.to)
    }

    /// Whether this declaration joins the same two regions as `other`
    pub fn same_pair(&self, other: &PeeringDeclaration) -> bool {
        (self.from == other.from && self.to == other.to)
            || (self.from == other.to && self.to == other.from)
    }
}

/// The full deployment catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionCatalog {
    pub regions: Vec<RegionDescriptor>,
    #[serde(default)]
    pub peerings: Vec<PeeringDeclaration>,
    #[serde(default)]
    pub cluster_policy: ClusterPolicy,
}

impl RegionCatalog {
    /// Load a catalog from a JSON file
    pub fn from_file(path: &Path) -> Result<Self, CatalogError> {
        let raw = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        serde_json::from_str(&raw).map_err(|source| CatalogError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn region(&self, name: &str) -> Option<&RegionDescriptor> {
        self.regions.iter().find(|r| r.name == name)
    }

    /// The three-region European platform: North Europe, West Europe and
    /// France Central, fully meshed.
    pub fn default_europe() -> Self {
        Self {
            regions: vec![
                region("northeurope", "ne", 0, 170, 172),
                region("westeurope", "we", 16, 174, 176),
                region("francecentral", "fc", 32, 178, 180),
            ],
            peerings: vec![
                PeeringDeclaration::new(
                    "northeurope",
                    "westeurope",
                    "vnet-peering-ne-we",
                    "vnet-peering-we-ne",
                ),
                PeeringDeclaration::new(
                    "northeurope",
                    "francecentral",
                    "vnet-peering-ne-fc",
                    "vnet-peering-fc-ne",
                ),
                PeeringDeclaration::new(
                    "westeurope",
                    "francecentral",
                    "vnet-peering-we-fc",
                    "vnet-peering-fc-we",
                ),
            ],
            cluster_policy: ClusterPolicy::default(),
        }
    }
}

impl Default for RegionCatalog {
    fn default() -> Self {
        Self::default_europe()
    }
}

fn region(location: &str, short: &str, third_octet: u8, pod_net: u8, service_net: u8) -> RegionDescriptor {
    RegionDescriptor {
        name: location.to_string(),
        resource_group_name: format!("rg-aks-{}", location),
        location: location.to_string(),
        address_prefixes: vec![format!("10.0.{}.0/20", third_octet)],
        vnet_name: format!("vnet-{}", short),
        node_subnet_name: format!("node-subnet-{}", short),
        node_subnet_prefix: format!("10.0.{}.0/23", third_octet),
        pod_cidr: format!("198.{}.0.0/16", pod_net),
        service_cidr: format!("192.{}.0.0/16", service_net),
        dns_service_ip: format!("192.{}.0.53", service_net),
        cluster_name: format!("k8s-cluster-{}", short),
    }
}

//! Catalog validation
//!
//! Configuration errors fail fast here, before any provisioning call. A
//! [`ValidatedCatalog`] is the only input the topology builders accept.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::str::FromStr;

use ipnet::Ipv4Net;
use tracing::debug;

use super::catalog::{PeeringDeclaration, RegionCatalog, RegionDescriptor};
use super::cluster::ClusterPolicy;
use super::ids::NameRule;
use crate::error::CatalogError;

/// Parsed network ranges of one region
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionNetworks {
    pub address_space: Vec<Ipv4Net>,
    pub node_subnet: Ipv4Net,
    pub pod_cidr: Ipv4Net,
    pub service_cidr: Ipv4Net,
    pub dns_service_ip: Ipv4Addr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedRegion {
    pub descriptor: RegionDescriptor,
    pub networks: RegionNetworks,
}

impl ValidatedRegion {
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }
}

/// A catalog whose names and CIDR invariants have been checked
#[derive(Debug, Clone)]
pub struct ValidatedCatalog {
    regions: Vec<ValidatedRegion>,
    peerings: Vec<PeeringDeclaration>,
    cluster_policy: ClusterPolicy,
}

impl ValidatedCatalog {
    pub fn regions(&self) -> &[ValidatedRegion] {
        &self.regions
    }

    pub fn region(&self, name: &str) -> Option<&ValidatedRegion> {
        self.regions.iter().find(|r| r.name() == name)
    }

    pub fn peerings(&self) -> &[PeeringDeclaration] {
        &self.peerings
    }

    pub fn cluster_policy(&self) -> &ClusterPolicy {
        &self.cluster_policy
    }
}

impl RegionCatalog {
    /// Check every configuration-time contract of the catalog
    pub fn validate(&self) -> Result<ValidatedCatalog, CatalogError> {
        if self.regions.is_empty() {
            return Err(CatalogError::Empty);
        }

        self.cluster_policy.validate()?;

        let mut seen_regions = HashSet::new();
        // Resource group names claimed so far, with the region and field claiming them
        let mut seen_groups: HashMap<String, (&str, &'static str)> = HashMap::new();
        let mut regions = Vec::with_capacity(self.regions.len());

        for descriptor in &self.regions {
            if !seen_regions.insert(descriptor.name.as_str()) {
                return Err(CatalogError::DuplicateRegion(descriptor.name.clone()));
            }

            // Each cluster also owns an infrastructure group named `<cluster_name>-vm`
            let claims = [
                (descriptor.resource_group_name.clone(), "resource_group_name"),
                (format!("{}-vm", descriptor.cluster_name), "cluster_name"),
            ];
            for (group, field) in claims {
                if let Some((other, other_field)) = seen_groups.get(&group) {
                    return Err(invalid(
                        descriptor,
                        field,
                        format!(
                            "resource group '{}' already used by the {} of region '{}'",
                            group, other_field, other
                        ),
                    ));
                }
                seen_groups.insert(group, (descriptor.name.as_str(), field));
            }

            let networks = validate_region(descriptor)?;
            regions.push(ValidatedRegion {
                descriptor: descriptor.clone(),
                networks,
            });
        }

        check_global_overlaps(&regions)?;
        validate_peerings(&self.peerings, &regions)?;

        debug!(
            regions = regions.len(),
            peerings = self.peerings.len(),
            "Catalog validated"
        );

        Ok(ValidatedCatalog {
            regions,
            peerings: self.peerings.clone(),
            cluster_policy: self.cluster_policy.clone(),
        })
    }
}

fn invalid(region: &RegionDescriptor, field: &'static str, reason: impl Into<String>) -> CatalogError {
    CatalogError::InvalidField {
        region: region.name.clone(),
        field,
        reason: reason.into(),
    }
}

fn check_name(
    region: &RegionDescriptor,
    field: &'static str,
    rule: NameRule,
    value: &str,
) -> Result<(), CatalogError> {
    rule.check(value)
        .map_err(|e| invalid(region, field, e.to_string()))
}

fn parse_cidr(region: &RegionDescriptor, field: &'static str, raw: &str) -> Result<Ipv4Net, CatalogError> {
    let net = Ipv4Net::from_str(raw.trim())
        .map_err(|_| invalid(region, field, format!("'{}' is not an IPv4 CIDR block", raw)))?;

    if net.trunc() != net {
        return Err(invalid(
            region,
            field,
            format!("'{}' has host bits set (did you mean {}?)", raw, net.trunc()),
        ));
    }

    Ok(net)
}

fn validate_region(region: &RegionDescriptor) -> Result<RegionNetworks, CatalogError> {
    if region.name.trim().is_empty() {
        return Err(invalid(region, "name", "must not be empty"));
    }
    if region.location.trim().is_empty() {
        return Err(invalid(region, "location", "must not be empty"));
    }

    check_name(region, "resource_group_name", NameRule::ResourceGroup, &region.resource_group_name)?;
    check_name(region, "vnet_name", NameRule::VirtualNetwork, &region.vnet_name)?;
    check_name(region, "node_subnet_name", NameRule::Subnet, &region.node_subnet_name)?;
    check_name(region, "cluster_name", NameRule::ManagedCluster, &region.cluster_name)?;

    if region.address_prefixes.is_empty() {
        return Err(invalid(region, "address_prefixes", "must list at least one CIDR block"));
    }

    let address_space = region
        .address_prefixes
        .iter()
        .map(|raw| parse_cidr(region, "address_prefixes", raw))
        .collect::<Result<Vec<_>, _>>()?;

    let node_subnet = parse_cidr(region, "node_subnet_prefix", &region.node_subnet_prefix)?;
    if !address_space.iter().any(|space| space.contains(&node_subnet)) {
        return Err(invalid(
            region,
            "node_subnet_prefix",
            format!("{} is not inside the virtual network address space", node_subnet),
        ));
    }

    let pod_cidr = parse_cidr(region, "pod_cidr", &region.pod_cidr)?;
    let service_cidr = parse_cidr(region, "service_cidr", &region.service_cidr)?;

    let dns_service_ip = Ipv4Addr::from_str(region.dns_service_ip.trim()).map_err(|_| {
        invalid(
            region,
            "dns_service_ip",
            format!("'{}' is not an IPv4 address", region.dns_service_ip),
        )
    })?;

    if !service_cidr.contains(&dns_service_ip) {
        return Err(invalid(
            region,
            "dns_service_ip",
            format!("{} is not inside service_cidr {}", dns_service_ip, service_cidr),
        ));
    }
    if service_cidr.prefix_len() < 31
        && (dns_service_ip == service_cidr.network() || dns_service_ip == service_cidr.broadcast())
    {
        return Err(invalid(
            region,
            "dns_service_ip",
            format!("{} is the network or broadcast address of {}", dns_service_ip, service_cidr),
        ));
    }

    Ok(RegionNetworks {
        address_space,
        node_subnet,
        pod_cidr,
        service_cidr,
        dns_service_ip,
    })
}

/// Two aligned CIDR blocks overlap iff one contains the other's network address
pub fn blocks_overlap(a: &Ipv4Net, b: &Ipv4Net) -> bool {
    a.contains(&b.network()) || b.contains(&a.network())
}

/// Address spaces, pod CIDRs and service CIDRs must be pairwise disjoint
/// across every region, including within a single region.
fn check_global_overlaps(regions: &[ValidatedRegion]) -> Result<(), CatalogError> {
    let mut blocks: Vec<(&str, &'static str, Ipv4Net)> = Vec::new();

    for region in regions {
        for net in &region.networks.address_space {
            blocks.push((region.name(), "address_prefixes", *net));
        }
        blocks.push((region.name(), "pod_cidr", region.networks.pod_cidr));
        blocks.push((region.name(), "service_cidr", region.networks.service_cidr));
    }

    for (i, (region, field, cidr)) in blocks.iter().enumerate() {
        for (other_region, other_field, other_cidr) in &blocks[i + 1..] {
            if blocks_overlap(cidr, other_cidr) {
                return Err(CatalogError::CidrOverlap {
                    region: region.to_string(),
                    field: *field,
                    cidr: cidr.to_string(),
                    other_region: other_region.to_string(),
                    other_field: *other_field,
                    other_cidr: other_cidr.to_string(),
                });
            }
        }
    }

    Ok(())
}

fn validate_peerings(
    peerings: &[PeeringDeclaration],
    regions: &[ValidatedRegion],
) -> Result<(), CatalogError> {
    let mut names: HashSet<(String, String)> = HashSet::new();

    for (i, peering) in peerings.iter().enumerate() {
        let lookup = |name: &str| {
            regions
                .iter()
                .find(|r| r.name() == name)
                .ok_or_else(|| CatalogError::UnknownPeeringRegion {
                    from: peering.from.clone(),
                    to: peering.to.clone(),
                    missing: name.to_string(),
                })
        };
        let from = lookup(&peering.from)?;
        let to = lookup(&peering.to)?;

        if peering.from == peering.to {
            return Err(CatalogError::SelfPeering(peering.from.clone()));
        }

        if peerings[..i].iter().any(|earlier| earlier.same_pair(peering)) {
            return Err(CatalogError::DuplicatePeering(
                peering.from.clone(),
                peering.to.clone(),
            ));
        }

        for (region, name, field) in [
            (from, &peering.forward_name, "forward_name"),
            (to, &peering.reverse_name, "reverse_name"),
        ] {
            check_name(&region.descriptor, field, NameRule::Peering, name)?;

            let group = region.descriptor.resource_group_name.clone();
            if !names.insert((group.clone(), name.clone())) {
                return Err(CatalogError::DuplicatePeeringName {
                    name: name.clone(),
                    resource_group: group,
                });
            }
        }
    }

    Ok(())
}

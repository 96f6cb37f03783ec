//! Error types for catalog validation, graph declaration and provisioning.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::provider::ProvisioningState;
use crate::topology::graph::ResourceKey;

/// Errors produced by the typed identifier builders
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
    /// A resource name violates the naming rules of its resource type
    #[error("invalid {kind} name '{name}': {reason}")]
    InvalidName {
        kind: &'static str,
        name: String,
        reason: String,
    },

    /// Subscription ids must be GUIDs
    #[error("invalid subscription id '{0}': expected a GUID")]
    InvalidSubscription(String),
}

/// Configuration errors, raised before any provisioning call
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog declares no regions")]
    Empty,

    #[error("region '{0}' is declared more than once")]
    DuplicateRegion(String),

    #[error("region '{region}': field '{field}' is invalid: {reason}")]
    InvalidField {
        region: String,
        field: &'static str,
        reason: String,
    },

    #[error(
        "region '{region}': {field} {cidr} overlaps {other_field} {other_cidr} of region '{other_region}'"
    )]
    CidrOverlap {
        region: String,
        field: &'static str,
        cidr: String,
        other_region: String,
        other_field: &'static str,
        other_cidr: String,
    },

    #[error("peering {from}_{to} references unknown region '{missing}'")]
    UnknownPeeringRegion {
        from: String,
        to: String,
        missing: String,
    },

    #[error("peering must join two distinct regions, got '{0}' on both sides")]
    SelfPeering(String),

    #[error("region pair {0}_{1} is declared for peering more than once")]
    DuplicatePeering(String, String),

    #[error("peering name '{name}' is used twice in resource group '{resource_group}'")]
    DuplicatePeeringName { name: String, resource_group: String },

    #[error("cluster policy field '{field}' is invalid: {reason}")]
    InvalidPolicy { field: &'static str, reason: String },

    #[error("failed to read catalog {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse catalog {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors raised while declaring resources into the dependency graph
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("resource {0} is declared twice with different inputs")]
    ConflictingDeclaration(ResourceKey),

    #[error("resource {resource} references node #{dependency}, which is not part of this graph")]
    UnknownDependency { resource: ResourceKey, dependency: usize },

    #[error(transparent)]
    Id(#[from] IdError),
}

/// Errors reported by a provisioning backend
///
/// Carried as-is to the operator. Nothing at this layer retries them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProvisionError {
    #[error("{resource}: request rejected ({status}): {message}")]
    Rejected {
        resource: String,
        status: u16,
        message: String,
    },

    #[error("{resource}: provisioning ended in state {state}")]
    Failed {
        resource: String,
        state: ProvisioningState,
    },

    #[error("{resource}: still {state} after {waited:?}")]
    Pending {
        resource: String,
        state: ProvisioningState,
        waited: Duration,
    },

    #[error("{resource}: transport error: {message}")]
    Transport { resource: String, message: String },

    #[error("{resource}: unexpected response: {message}")]
    InvalidResponse { resource: String, message: String },

    #[error("{resource}: dependency output unavailable: {message}")]
    Unresolved { resource: String, message: String },

    #[error("authentication failed: {0}")]
    Authentication(String),
}

impl ProvisionError {
    /// Whether the resource may still converge on its own
    pub fn is_pending(&self) -> bool {
        matches!(self, ProvisionError::Pending { .. })
    }
}

impl From<anyhow::Error> for ProvisionError {
    fn from(err: anyhow::Error) -> Self {
        ProvisionError::Authentication(format!("{:#}", err))
    }
}

//! AKS Mesh Engine Library
//!
//! Declarative multi-region AKS platform: typed resource graph, local
//! dependency-ordered scheduler and provisioning backends.

pub mod config;
pub mod error;
pub mod orchestrator;
pub mod provider;
pub mod topology;

pub use config::{AzureContext, EngineSettings};
pub use error::{CatalogError, GraphError, IdError, ProvisionError};
pub use orchestrator::{NodeOutcome, Orchestrator, Plan, RunReport};
pub use provider::{ArmProvider, InMemoryProvider, ResourceProvider};
pub use topology::{RegionCatalog, Stack, StackOutputs};

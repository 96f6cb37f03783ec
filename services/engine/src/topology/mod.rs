//! Multi-region topology model
//!
//! Region catalog in, dependency graph of desired resources out:
//! - `catalog` / `validate`: per-region parameters and their checks
//! - `network`, `peering`, `cluster`, `access`, `credentials`: builders that
//!   declare resources into a [`graph::ResourceGraph`]
//! - `stack`: runs every builder over a catalog
//! - `outputs`: the published result set

pub mod access;
pub mod catalog;
pub mod cluster;
pub mod credentials;
pub mod graph;
pub mod ids;
pub mod network;
pub mod outputs;
pub mod peering;
pub mod resources;
pub mod stack;
pub mod validate;

pub use catalog::{PeeringDeclaration, RegionCatalog, RegionDescriptor};
pub use graph::{NodeId, Ref, ResourceGraph};
pub use outputs::StackOutputs;
pub use stack::Stack;
pub use validate::ValidatedCatalog;

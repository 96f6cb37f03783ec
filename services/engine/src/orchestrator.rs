//! Topology Orchestrator
//!
//! Local scheduler for a [`ResourceGraph`]: a node starts as soon as every
//! node it depends on has completed, independent nodes run concurrently up to
//! the configured parallelism, and a failed node skips everything downstream
//! of it while unrelated nodes carry on.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::{self, BoxFuture, FutureExt};
use futures::stream::{self, FuturesUnordered, StreamExt};
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::error::ProvisionError;
use crate::provider::{ProvisionedResource, ResourceProvider};
use crate::topology::credentials::{decode_kubeconfig, Secret};
use crate::topology::graph::{Node, NodeId, ResourceGraph};
use crate::topology::ids::ResourceKind;
use crate::topology::resources::{ResourceSpec, Resolver};

/// Lifecycle operation of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Apply,
    Refresh,
    Destroy,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Apply => write!(f, "apply"),
            Operation::Refresh => write!(f, "refresh"),
            Operation::Destroy => write!(f, "destroy"),
        }
    }
}

/// Result for one node of a run
#[derive(Debug, Clone)]
pub enum NodeOutcome {
    /// The resource exists and is ready
    Ready(ProvisionedResource),
    /// Decoded kubeconfig of a ready cluster
    Credentials(Secret<String>),
    Failed(ProvisionError),
    /// Not attempted because `blocked_by` did not complete
    Skipped { blocked_by: NodeId },
    /// Refresh found nothing, or destroy had nothing to remove
    Absent,
    Deleted,
}

impl NodeOutcome {
    /// Whether nodes waiting on this one may proceed
    pub fn unblocks(&self) -> bool {
        matches!(
            self,
            NodeOutcome::Ready(_) | NodeOutcome::Credentials(_) | NodeOutcome::Deleted | NodeOutcome::Absent
        )
    }

    pub fn resource(&self) -> Option<&ProvisionedResource> {
        match self {
            NodeOutcome::Ready(resource) => Some(resource),
            _ => None,
        }
    }
}

/// Counts per outcome
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub ready: usize,
    pub failed: usize,
    /// Still provisioning when polling gave up
    pub pending: usize,
    pub skipped: usize,
    pub absent: usize,
    pub deleted: usize,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub operation: Operation,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    outcomes: BTreeMap<NodeId, NodeOutcome>,
}

impl RunReport {
    pub fn outcome(&self, node: NodeId) -> Option<&NodeOutcome> {
        self.outcomes.get(&node)
    }

    pub fn outcomes(&self) -> impl Iterator<Item = (NodeId, &NodeOutcome)> {
        self.outcomes.iter().map(|(id, outcome)| (*id, outcome))
    }

    pub fn failures(&self) -> impl Iterator<Item = (NodeId, &ProvisionError)> {
        self.outcomes.iter().filter_map(|(id, outcome)| match outcome {
            NodeOutcome::Failed(err) => Some((*id, err)),
            _ => None,
        })
    }

    pub fn is_success(&self) -> bool {
        self.outcomes
            .values()
            .all(|o| !matches!(o, NodeOutcome::Failed(_) | NodeOutcome::Skipped { .. }))
    }

    pub fn summary(&self) -> RunSummary {
        let mut summary = RunSummary::default();
        for outcome in self.outcomes.values() {
            match outcome {
                NodeOutcome::Ready(_) | NodeOutcome::Credentials(_) => summary.ready += 1,
                NodeOutcome::Failed(err) if err.is_pending() => summary.pending += 1,
                NodeOutcome::Failed(_) => summary.failed += 1,
                NodeOutcome::Skipped { .. } => summary.skipped += 1,
                NodeOutcome::Absent => summary.absent += 1,
                NodeOutcome::Deleted => summary.deleted += 1,
            }
        }
        summary
    }
}

/// Planned action for one node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlannedAction {
    Create,
    Update,
    /// Credential reads change nothing
    Read,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedChange {
    pub resource: String,
    pub kind: ResourceKind,
    pub action: PlannedAction,
}

/// Preview of an apply, in dependency waves
#[derive(Debug, Clone, Default, Serialize)]
pub struct Plan {
    pub waves: Vec<Vec<PlannedChange>>,
}

impl Plan {
    pub fn count(&self, action: PlannedAction) -> usize {
        self.waves
            .iter()
            .flatten()
            .filter(|change| change.action == action)
            .count()
    }
}

#[derive(Clone, Copy)]
enum Direction {
    /// Dependencies first
    Forward,
    /// Dependents first
    Reverse,
}

pub struct Orchestrator {
    provider: Arc<dyn ResourceProvider>,
    parallelism: usize,
}

impl Orchestrator {
    pub fn new(provider: Arc<dyn ResourceProvider>, parallelism: usize) -> Self {
        Self {
            provider,
            parallelism: parallelism.max(1),
        }
    }

    pub fn provider(&self) -> &Arc<dyn ResourceProvider> {
        &self.provider
    }

    /// Create or reconcile every node of the graph
    pub async fn apply(&self, graph: &ResourceGraph) -> RunReport {
        let started_at = Utc::now();
        info!(provider = %self.provider.name(), resources = graph.len(), "Starting apply");

        let provider = self.provider.clone();
        let mut outcomes = self
            .run(graph, Direction::Forward, |node, outputs| {
                start_apply(provider.clone(), node, outputs)
            })
            .await;

        self.settle_peerings(graph, &mut outcomes).await;
        self.finish(Operation::Apply, started_at, outcomes)
    }

    /// Read every resource of the graph without changing anything
    pub async fn refresh(&self, graph: &ResourceGraph) -> RunReport {
        let started_at = Utc::now();
        info!(provider = %self.provider.name(), resources = graph.len(), "Starting refresh");

        let provider = self.provider.clone();
        let outcomes = self
            .run(graph, Direction::Forward, |node, outputs| {
                start_refresh(provider.clone(), node, outputs)
            })
            .await;

        self.finish(Operation::Refresh, started_at, outcomes)
    }

    /// Delete every resource of the graph, dependents first
    pub async fn destroy(&self, graph: &ResourceGraph) -> RunReport {
        let started_at = Utc::now();
        info!(provider = %self.provider.name(), resources = graph.len(), "Starting destroy");

        let provider = self.provider.clone();
        let outcomes = self
            .run(graph, Direction::Reverse, |node, _| {
                start_destroy(provider.clone(), node)
            })
            .await;

        self.finish(Operation::Destroy, started_at, outcomes)
    }

    /// What an apply would do, read from the backend
    pub async fn preview(&self, graph: &ResourceGraph) -> Result<Plan, ProvisionError> {
        let mut waves = Vec::new();

        for wave in graph.waves() {
            let changes: Vec<Result<PlannedChange, ProvisionError>> = stream::iter(wave)
                .map(|id| {
                    let provider = self.provider.clone();
                    let node = graph.node(id);
                    let resource = node.key().name.clone();
                    let kind = node.key().kind;
                    let target = node.spec().resource_id();
                    async move {
                        let action = match target {
                            None => PlannedAction::Read,
                            Some(target) => match provider.read(&target).await? {
                                Some(_) => PlannedAction::Update,
                                None => PlannedAction::Create,
                            },
                        };
                        Ok::<_, ProvisionError>(PlannedChange {
                            resource,
                            kind,
                            action,
                        })
                    }
                })
                .buffered(self.parallelism)
                .collect()
                .await;

            waves.push(changes.into_iter().collect::<Result<Vec<_>, _>>()?);
        }

        Ok(Plan { waves })
    }

    /// Run `start` for every node once all of its prerequisites unblocked
    async fn run<F>(
        &self,
        graph: &ResourceGraph,
        direction: Direction,
        mut start: F,
    ) -> BTreeMap<NodeId, NodeOutcome>
    where
        F: FnMut(&Node, &HashMap<NodeId, ProvisionedResource>) -> BoxFuture<'static, NodeOutcome>,
    {
        let semaphore = Arc::new(Semaphore::new(self.parallelism));
        let mut outcomes: BTreeMap<NodeId, NodeOutcome> = BTreeMap::new();
        let mut outputs: HashMap<NodeId, ProvisionedResource> = HashMap::new();

        let followers: Vec<Vec<NodeId>> = graph
            .ids()
            .map(|id| match direction {
                Direction::Forward => graph.dependents(id),
                Direction::Reverse => graph.node(id).depends_on().iter().copied().collect(),
            })
            .collect();
        let mut waiting: Vec<usize> = graph
            .ids()
            .map(|id| match direction {
                Direction::Forward => graph.node(id).depends_on().len(),
                Direction::Reverse => graph.dependents(id).len(),
            })
            .collect();

        let mut in_flight = FuturesUnordered::new();
        let mut launch = |id: NodeId, outputs: &HashMap<NodeId, ProvisionedResource>| {
            let work = start(graph.node(id), outputs);
            let semaphore = semaphore.clone();
            async move {
                let _permit = semaphore.acquire_owned().await.ok();
                (id, work.await)
            }
        };

        for id in graph.ids() {
            if waiting[id.index()] == 0 {
                in_flight.push(launch(id, &outputs));
            }
        }

        while let Some((id, outcome)) = in_flight.next().await {
            let key = graph.node(id).key();
            match &outcome {
                NodeOutcome::Failed(err) if err.is_pending() => {
                    warn!(resource = %key, error = %err, "Resource still pending")
                }
                NodeOutcome::Failed(err) => error!(resource = %key, error = %err, "Resource failed"),
                NodeOutcome::Credentials(_) => info!(resource = %key, "Credentials retrieved"),
                NodeOutcome::Ready(r) => info!(resource = %key, state = %r.state, "Resource ready"),
                NodeOutcome::Deleted => info!(resource = %key, "Resource deleted"),
                NodeOutcome::Absent => info!(resource = %key, "Resource absent"),
                NodeOutcome::Skipped { .. } => {}
            }

            if let NodeOutcome::Ready(resource) = &outcome {
                outputs.insert(id, resource.clone());
            }

            if outcome.unblocks() {
                for &next in &followers[id.index()] {
                    waiting[next.index()] -= 1;
                    if waiting[next.index()] == 0 && !outcomes.contains_key(&next) {
                        in_flight.push(launch(next, &outputs));
                    }
                }
            } else {
                for blocked in downstream(&followers, id) {
                    if !outcomes.contains_key(&blocked) {
                        warn!(resource = %graph.node(blocked).key(), blocked_by = %key, "Skipping resource");
                        outcomes.insert(blocked, NodeOutcome::Skipped { blocked_by: id });
                    }
                }
            }

            outcomes.insert(id, outcome);
        }

        outcomes
    }

    /// A peering created before its reverse side reports `Initiated`; read
    /// completed peerings again so outputs show the settled state.
    async fn settle_peerings(&self, graph: &ResourceGraph, outcomes: &mut BTreeMap<NodeId, NodeOutcome>) {
        let peerings: Vec<(NodeId, _)> = outcomes
            .iter()
            .filter(|(id, outcome)| {
                graph.node(**id).key().kind == ResourceKind::VirtualNetworkPeering
                    && matches!(outcome, NodeOutcome::Ready(_))
            })
            .filter_map(|(id, _)| graph.node(*id).spec().resource_id().map(|rid| (*id, rid)))
            .collect();

        for (id, target) in peerings {
            match self.provider.read(&target).await {
                Ok(Some(current)) => {
                    outcomes.insert(id, NodeOutcome::Ready(current));
                }
                Ok(None) => {}
                Err(err) => warn!(resource = %target, error = %err, "Could not re-read peering"),
            }
        }
    }

    fn finish(
        &self,
        operation: Operation,
        started_at: DateTime<Utc>,
        outcomes: BTreeMap<NodeId, NodeOutcome>,
    ) -> RunReport {
        let report = RunReport {
            operation,
            started_at,
            finished_at: Utc::now(),
            outcomes,
        };

        let summary = report.summary();
        info!(
            operation = %operation,
            ready = summary.ready,
            failed = summary.failed,
            pending = summary.pending,
            skipped = summary.skipped,
            deleted = summary.deleted,
            duration_ms = (report.finished_at - report.started_at).num_milliseconds(),
            "Run finished"
        );
        report
    }
}

/// Every node reachable from `id` along `followers`
fn downstream(followers: &[Vec<NodeId>], id: NodeId) -> Vec<NodeId> {
    let mut seen = vec![false; followers.len()];
    let mut stack = followers[id.index()].clone();
    let mut found = Vec::new();

    while let Some(next) = stack.pop() {
        if seen[next.index()] {
            continue;
        }
        seen[next.index()] = true;
        found.push(next);
        stack.extend(followers[next.index()].iter().copied());
    }
    found
}

fn start_apply(
    provider: Arc<dyn ResourceProvider>,
    node: &Node,
    outputs: &HashMap<NodeId, ProvisionedResource>,
) -> BoxFuture<'static, NodeOutcome> {
    let key = node.key().to_string();

    if let ResourceSpec::ClusterCredentials(spec) = node.spec() {
        let cluster = spec.cluster.id().clone();
        let kind = spec.kind;
        return async move {
            let decoded = match provider.list_credentials(&cluster, kind).await {
                Ok(entries) => decode_kubeconfig(&key, &entries),
                Err(err) => Err(err),
            };
            match decoded {
                Ok(secret) => NodeOutcome::Credentials(secret),
                Err(err) => NodeOutcome::Failed(err),
            }
        }
        .boxed();
    }

    // Only outputs of this node's own dependencies are visible to it
    let resolver = Resolver::new(
        node.depends_on()
            .iter()
            .filter_map(|dep| outputs.get(dep).map(|r| (*dep, r.clone())))
            .collect(),
    );

    match node.spec().resolve(&resolver) {
        Ok(Some(desired)) => async move {
            match provider.apply(&desired).await {
                Ok(resource) => NodeOutcome::Ready(resource),
                Err(err) => NodeOutcome::Failed(err),
            }
        }
        .boxed(),
        Ok(None) => future::ready(NodeOutcome::Absent).boxed(),
        Err(err) => future::ready(NodeOutcome::Failed(err)).boxed(),
    }
}

fn start_refresh(
    provider: Arc<dyn ResourceProvider>,
    node: &Node,
    outputs: &HashMap<NodeId, ProvisionedResource>,
) -> BoxFuture<'static, NodeOutcome> {
    let key = node.key().to_string();

    if let ResourceSpec::ClusterCredentials(spec) = node.spec() {
        // No cluster, nothing to read
        if !outputs.contains_key(&spec.cluster.node()) {
            return future::ready(NodeOutcome::Absent).boxed();
        }
        let cluster = spec.cluster.id().clone();
        let kind = spec.kind;
        return async move {
            match provider.list_credentials(&cluster, kind).await {
                Ok(entries) => match decode_kubeconfig(&key, &entries) {
                    Ok(secret) => NodeOutcome::Credentials(secret),
                    Err(err) => NodeOutcome::Failed(err),
                },
                Err(err) => NodeOutcome::Failed(err),
            }
        }
        .boxed();
    }

    let Some(target) = node.spec().resource_id() else {
        return future::ready(NodeOutcome::Absent).boxed();
    };

    async move {
        match provider.read(&target).await {
            Ok(Some(resource)) if resource.state.is_ready() => NodeOutcome::Ready(resource),
            Ok(Some(resource)) if resource.state.is_terminal() => NodeOutcome::Failed(ProvisionError::Failed {
                resource: key,
                state: resource.state,
            }),
            Ok(Some(resource)) => NodeOutcome::Failed(ProvisionError::Pending {
                resource: key,
                state: resource.state,
                waited: std::time::Duration::ZERO,
            }),
            Ok(None) => NodeOutcome::Absent,
            Err(err) => NodeOutcome::Failed(err),
        }
    }
    .boxed()
}

fn start_destroy(provider: Arc<dyn ResourceProvider>, node: &Node) -> BoxFuture<'static, NodeOutcome> {
    // The implicit infrastructure group goes with its cluster
    let Some(target) = node.spec().resource_id() else {
        return future::ready(NodeOutcome::Absent).boxed();
    };

    async move {
        match provider.delete(&target).await {
            Ok(()) => NodeOutcome::Deleted,
            Err(err) => NodeOutcome::Failed(err),
        }
    }
    .boxed()
}

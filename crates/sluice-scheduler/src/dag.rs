//! DAG resolution for pipeline stages.

use dashmap::DashMap;
use petgraph::Direction;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use sluice_core::Error;
use sluice_core::ids::{DatasetId, PipelineId, StageId};
use sluice_core::pipeline::{Pipeline, PipelineDefinition, StageDefinition, StageInput};
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum DagError {
    #[error("Pipeline has no stages")]
    EmptyPipeline,
    #[error("Duplicate stage: {0}")]
    DuplicateStage(StageId),
    #[error("Stage '{stage}' references unknown stage '{target}'")]
    UnknownStage { stage: StageId, target: StageId },
    #[error("Stage '{stage}' references unknown dataset {dataset}")]
    UnknownDataset { stage: StageId, dataset: DatasetId },
    #[error("Cycle detected: {}", format_cycle(.0))]
    Cycle(Vec<StageId>),
}

fn format_cycle(cycle: &[StageId]) -> String {
    cycle
        .iter()
        .map(StageId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

impl From<DagError> for Error {
    fn from(err: DagError) -> Self {
        match err {
            DagError::Cycle(cycle) => {
                Error::Cycle(cycle.into_iter().map(|s| s.to_string()).collect())
            }
            DagError::UnknownStage { stage, target } => Error::DanglingReference {
                stage: stage.to_string(),
                target: format!("stage '{target}'"),
            },
            DagError::UnknownDataset { stage, dataset } => Error::DanglingReference {
                stage: stage.to_string(),
                target: format!("dataset {dataset}"),
            },
            other => Error::Validation(other.to_string()),
        }
    }
}

/// A resolved pipeline version.
///
/// Stages live in an arena in execution order; edges are index lists.
#[derive(Debug)]
pub struct ExecutionPlan {
    stages: Vec<StageDefinition>,
    upstream: Vec<Vec<usize>>,
    downstream: Vec<Vec<usize>>,
    index: HashMap<StageId, usize>,
}

impl ExecutionPlan {
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Stages in topological order.
    pub fn stages(&self) -> &[StageDefinition] {
        &self.stages
    }

    pub fn stage(&self, idx: usize) -> &StageDefinition {
        &self.stages[idx]
    }

    pub fn index_of(&self, id: &StageId) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn upstream(&self, idx: usize) -> &[usize] {
        &self.upstream[idx]
    }

    pub fn downstream(&self, idx: usize) -> &[usize] {
        &self.downstream[idx]
    }

    pub fn order(&self) -> impl Iterator<Item = &StageId> {
        self.stages.iter().map(|s| &s.id)
    }

    /// Every stage reachable downstream of `idx`.
    pub fn descendants(&self, idx: usize) -> BTreeSet<usize> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<usize> = self.downstream[idx].iter().copied().collect();
        while let Some(next) = queue.pop_front() {
            if seen.insert(next) {
                queue.extend(self.downstream[next].iter().copied());
            }
        }
        seen
    }
}

/// Validates stage graphs and caches resolved plans per pipeline version.
#[derive(Default)]
pub struct DagResolver {
    cache: DashMap<(PipelineId, u32), Arc<ExecutionPlan>>,
}

impl DagResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plan for a stored pipeline version, resolved once and cached.
    pub fn resolve(
        &self,
        pipeline: &Pipeline,
        known_datasets: &HashSet<DatasetId>,
    ) -> Result<Arc<ExecutionPlan>, DagError> {
        let key = (pipeline.id, pipeline.version);
        if let Some(plan) = self.cache.get(&key) {
            return Ok(plan.clone());
        }

        let plan = Arc::new(Self::plan(&pipeline.definition, known_datasets)?);
        debug!(
            pipeline_id = %pipeline.id,
            version = pipeline.version,
            stages = plan.len(),
            "Resolved execution plan"
        );
        self.cache.insert(key, plan.clone());
        Ok(plan)
    }

    pub fn cached_plans(&self) -> usize {
        self.cache.len()
    }

    /// Validate a definition and compute its execution order.
    ///
    /// Among stages whose dependencies are satisfied, the smallest stage id
    /// goes first, so identical definitions always produce identical plans.
    pub fn plan(
        definition: &PipelineDefinition,
        known_datasets: &HashSet<DatasetId>,
    ) -> Result<ExecutionPlan, DagError> {
        if definition.stages.is_empty() {
            return Err(DagError::EmptyPipeline);
        }

        let mut graph: DiGraph<StageId, ()> = DiGraph::new();
        let mut nodes: HashMap<&StageId, NodeIndex> = HashMap::new();
        for stage in &definition.stages {
            if nodes.contains_key(&stage.id) {
                return Err(DagError::DuplicateStage(stage.id.clone()));
            }
            nodes.insert(&stage.id, graph.add_node(stage.id.clone()));
        }

        for stage in &definition.stages {
            for input in &stage.inputs {
                if let StageInput::Dataset(dataset) = input
                    && !known_datasets.contains(dataset)
                {
                    return Err(DagError::UnknownDataset {
                        stage: stage.id.clone(),
                        dataset: *dataset,
                    });
                }
            }
            if !known_datasets.contains(&stage.output) {
                return Err(DagError::UnknownDataset {
                    stage: stage.id.clone(),
                    dataset: stage.output,
                });
            }

            let to = nodes[&stage.id];
            for dep in stage.upstream() {
                let from = nodes.get(dep).ok_or_else(|| DagError::UnknownStage {
                    stage: stage.id.clone(),
                    target: dep.clone(),
                })?;
                graph.update_edge(*from, to, ());
            }
        }

        let sorted =
            topological_order(&graph).ok_or_else(|| DagError::Cycle(find_cycle(&graph)))?;

        let position: HashMap<NodeIndex, usize> =
            sorted.iter().enumerate().map(|(i, n)| (*n, i)).collect();
        let mut stages = Vec::with_capacity(sorted.len());
        let mut upstream = Vec::with_capacity(sorted.len());
        let mut downstream = Vec::with_capacity(sorted.len());
        let mut index = HashMap::with_capacity(sorted.len());

        for (i, node) in sorted.iter().enumerate() {
            let id = &graph[*node];
            let stage = definition
                .stage(id)
                .cloned()
                .ok_or_else(|| DagError::UnknownStage {
                    stage: id.clone(),
                    target: id.clone(),
                })?;
            let mut ups: Vec<usize> = graph
                .neighbors_directed(*node, Direction::Incoming)
                .map(|n| position[&n])
                .collect();
            ups.sort_unstable();
            let mut downs: Vec<usize> = graph
                .neighbors_directed(*node, Direction::Outgoing)
                .map(|n| position[&n])
                .collect();
            downs.sort_unstable();

            index.insert(stage.id.clone(), i);
            stages.push(stage);
            upstream.push(ups);
            downstream.push(downs);
        }

        Ok(ExecutionPlan {
            stages,
            upstream,
            downstream,
            index,
        })
    }
}

/// Kahn's algorithm with a min-heap on stage id for the tie-break.
fn topological_order(graph: &DiGraph<StageId, ()>) -> Option<Vec<NodeIndex>> {
    let mut in_degree: HashMap<NodeIndex, usize> = graph
        .node_indices()
        .map(|n| (n, graph.neighbors_directed(n, Direction::Incoming).count()))
        .collect();

    let mut ready: BinaryHeap<Reverse<(StageId, NodeIndex)>> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(n, _)| Reverse((graph[*n].clone(), *n)))
        .collect();

    let mut order = Vec::with_capacity(graph.node_count());
    while let Some(Reverse((_, node))) = ready.pop() {
        order.push(node);
        for next in graph.neighbors_directed(node, Direction::Outgoing) {
            if let Some(degree) = in_degree.get_mut(&next) {
                *degree -= 1;
                if *degree == 0 {
                    ready.push(Reverse((graph[next].clone(), next)));
                }
            }
        }
    }

    (order.len() == graph.node_count()).then_some(order)
}

/// Name one cycle, starting and ending at its smallest stage id.
fn find_cycle(graph: &DiGraph<StageId, ()>) -> Vec<StageId> {
    let cyclic = tarjan_scc(graph)
        .into_iter()
        .filter(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
        .filter_map(|scc| {
            let start = *scc.iter().min_by_key(|n| &graph[**n])?;
            Some((scc, start))
        })
        .min_by(|(_, a), (_, b)| graph[*a].cmp(&graph[*b]));

    let Some((scc, start)) = cyclic else {
        return Vec::new();
    };
    let members: HashSet<NodeIndex> = scc.into_iter().collect();

    // Breadth-first search back to the start, staying inside the component.
    let mut parent: HashMap<NodeIndex, NodeIndex> = HashMap::new();
    let mut queue = VecDeque::from([start]);
    let mut closing = None;
    while let Some(node) = queue.pop_front() {
        let mut next: Vec<NodeIndex> = graph
            .neighbors_directed(node, Direction::Outgoing)
            .filter(|n| members.contains(n))
            .collect();
        next.sort_by(|a, b| graph[*a].cmp(&graph[*b]));
        for n in next {
            if n == start {
                closing = Some(node);
                break;
            }
            if let std::collections::hash_map::Entry::Vacant(e) = parent.entry(n) {
                e.insert(node);
                queue.push_back(n);
            }
        }
        if closing.is_some() {
            break;
        }
    }

    let mut path = vec![start];
    let mut cursor = closing;
    while let Some(node) = cursor {
        if node == start {
            break;
        }
        path.push(node);
        cursor = parent.get(&node).copied();
    }
    path.push(start);
    // path is start, closing, ..., start's successor, start; reverse the middle.
    let end = path.len() - 1;
    path[1..end].reverse();
    path.into_iter().map(|n| graph[n].clone()).collect()
}

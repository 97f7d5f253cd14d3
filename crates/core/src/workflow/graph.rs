use crate::contract::{AnyValue, Contract};
use crate::error::GraphError;
use crate::step::Step;
use crate::types::{StepId, StepResult, WorkflowId};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// Position of a step in the graph's step arena
pub(crate) type StepIndex = usize;

#[derive(Debug, Clone)]
pub(crate) enum StageKind {
    Single(StepIndex),
    Parallel(Vec<StepIndex>),
}

/// One position of the execution cursor
#[derive(Debug, Clone)]
pub(crate) struct Stage {
    pub id: String,
    pub kind: StageKind,
}

impl Stage {
    pub fn members(&self) -> &[StepIndex] {
        match &self.kind {
            StageKind::Single(idx) => std::slice::from_ref(idx),
            StageKind::Parallel(branches) => branches,
        }
    }
}

/// Where a step's input comes from, fixed at commit time
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum InputSource {
    Trigger,
    Step(StepIndex),
    Join(Vec<StepIndex>),
}

enum Pending {
    Single(Arc<dyn Step>),
    Parallel(Vec<Arc<dyn Step>>),
}

/// Composes steps into a workflow and freezes them with [`commit`](Self::commit).
///
/// ```rust,ignore
/// let mut builder = WorkflowBuilder::new("vacation");
/// builder.then(fetch)?.then(plan)?.parallel([indoor, outdoor])?.then(synthesize)?;
/// let graph = builder.commit()?;
/// ```
pub struct WorkflowBuilder {
    id: WorkflowId,
    input_contract: Arc<dyn Contract>,
    output_contract: Arc<dyn Contract>,
    stages: Vec<Pending>,
    committed: bool,
}

impl WorkflowBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: WorkflowId::new(id),
            input_contract: Arc::new(AnyValue),
            output_contract: Arc::new(AnyValue),
            stages: Vec::new(),
            committed: false,
        }
    }

    pub fn input_contract(&mut self, contract: impl Contract + 'static) -> &mut Self {
        self.input_contract = Arc::new(contract);
        self
    }

    pub fn output_contract(&mut self, contract: impl Contract + 'static) -> &mut Self {
        self.output_contract = Arc::new(contract);
        self
    }

    /// Append a step after the current cursor
    pub fn then(&mut self, step: impl Step + 'static) -> Result<&mut Self, GraphError> {
        self.then_dyn(Arc::new(step))
    }

    pub fn then_dyn(&mut self, step: Arc<dyn Step>) -> Result<&mut Self, GraphError> {
        self.ensure_open()?;
        self.stages.push(Pending::Single(step));
        Ok(self)
    }

    /// Fan the cursor out to `steps`; the next `then` joins them
    pub fn parallel<I, S>(&mut self, steps: I) -> Result<&mut Self, GraphError>
    where
        I: IntoIterator<Item = S>,
        S: Step + 'static,
    {
        self.parallel_dyn(
            steps
                .into_iter()
                .map(|s| Arc::new(s) as Arc<dyn Step>)
                .collect(),
        )
    }

    pub fn parallel_dyn(&mut self, steps: Vec<Arc<dyn Step>>) -> Result<&mut Self, GraphError> {
        self.ensure_open()?;
        self.stages.push(Pending::Parallel(steps));
        Ok(self)
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    fn ensure_open(&self) -> Result<(), GraphError> {
        if self.committed {
            return Err(GraphError::AlreadyCommitted(self.id.0.clone()));
        }
        Ok(())
    }

    /// Validate and freeze the composition.
    ///
    /// A second call is rejected and leaves the builder untouched.
    pub fn commit(&mut self) -> Result<WorkflowGraph, GraphError> {
        self.ensure_open()?;
        if self.stages.is_empty() {
            return Err(GraphError::EmptyWorkflow(self.id.0.clone()));
        }

        let mut steps: Vec<Arc<dyn Step>> = Vec::new();
        let mut index: HashMap<StepId, StepIndex> = HashMap::new();
        let mut stages = Vec::with_capacity(self.stages.len());
        let mut stage_of = Vec::new();

        for (position, pending) in self.stages.iter().enumerate() {
            let members: Vec<Arc<dyn Step>> = match pending {
                Pending::Single(step) => vec![step.clone()],
                Pending::Parallel(branches) if branches.is_empty() => {
                    return Err(GraphError::EmptyParallelGroup(position));
                }
                Pending::Parallel(branches) => branches.clone(),
            };

            let mut indices = Vec::with_capacity(members.len());
            for step in members {
                let id = step.id().clone();
                if index.contains_key(&id) {
                    return Err(GraphError::DuplicateStepId(id.0));
                }
                let idx = steps.len();
                index.insert(id, idx);
                steps.push(step);
                stage_of.push(position);
                indices.push(idx);
            }

            let stage = match pending {
                Pending::Single(_) => Stage {
                    id: steps[indices[0]].id().0.clone(),
                    kind: StageKind::Single(indices[0]),
                },
                Pending::Parallel(_) => Stage {
                    id: format!(
                        "parallel:{}",
                        indices
                            .iter()
                            .map(|i| steps[*i].id().0.as_str())
                            .collect::<Vec<_>>()
                            .join(",")
                    ),
                    kind: StageKind::Parallel(indices),
                },
            };
            stages.push(stage);
        }

        // Edges run from every member of a stage to every member of the next
        // one, so the graph is acyclic by construction
        let mut dag: DiGraph<StepIndex, ()> = DiGraph::new();
        let nodes: Vec<NodeIndex> = (0..steps.len()).map(|i| dag.add_node(i)).collect();
        for pair in stages.windows(2) {
            for from in pair[0].members() {
                for to in pair[1].members() {
                    dag.add_edge(nodes[*from], nodes[*to], ());
                }
            }
        }

        let inputs = (0..steps.len())
            .map(|idx| {
                let mut preds: Vec<StepIndex> = dag
                    .neighbors_directed(nodes[idx], petgraph::Direction::Incoming)
                    .map(|n| dag[n])
                    .collect();
                preds.sort_unstable();
                match preds.as_slice() {
                    [] => InputSource::Trigger,
                    [only] if matches!(stages[stage_of[*only]].kind, StageKind::Single(_)) => {
                        InputSource::Step(*only)
                    }
                    _ => InputSource::Join(preds),
                }
            })
            .collect();

        let definition_hash = definition_hash(&self.id, &stages, &steps);

        tracing::debug!(
            "Committed workflow {} with {} steps in {} stages",
            self.id,
            steps.len(),
            stages.len()
        );

        self.committed = true;

        Ok(WorkflowGraph {
            inner: Arc::new(GraphInner {
                id: self.id.clone(),
                input_contract: self.input_contract.clone(),
                output_contract: self.output_contract.clone(),
                steps,
                index,
                stages,
                inputs,
                dag,
                nodes,
                definition_hash,
            }),
        })
    }
}

fn definition_hash(id: &WorkflowId, stages: &[Stage], steps: &[Arc<dyn Step>]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(id.0.as_bytes());
    for stage in stages {
        let tag: &[u8] = match stage.kind {
            StageKind::Single(_) => b"|S:",
            StageKind::Parallel(_) => b"|P:",
        };
        hasher.update(tag);
        for idx in stage.members() {
            hasher.update(steps[*idx].id().0.as_bytes());
            hasher.update(b",");
        }
    }
    hex::encode(hasher.finalize())
}

struct GraphInner {
    id: WorkflowId,
    input_contract: Arc<dyn Contract>,
    output_contract: Arc<dyn Contract>,
    steps: Vec<Arc<dyn Step>>,
    index: HashMap<StepId, StepIndex>,
    stages: Vec<Stage>,
    inputs: Vec<InputSource>,
    dag: DiGraph<StepIndex, ()>,
    nodes: Vec<NodeIndex>,
    definition_hash: String,
}

/// A committed, immutable workflow; cheap to clone and share across runs
#[derive(Clone)]
pub struct WorkflowGraph {
    inner: Arc<GraphInner>,
}

impl WorkflowGraph {
    pub fn id(&self) -> &WorkflowId {
        &self.inner.id
    }

    /// Fingerprint of the graph shape recorded in every snapshot
    pub fn definition_hash(&self) -> &str {
        &self.inner.definition_hash
    }

    pub fn len(&self) -> usize {
        self.inner.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.steps.is_empty()
    }

    pub fn contains(&self, step_id: &StepId) -> bool {
        self.inner.index.contains_key(step_id)
    }

    /// Step ids in a dependency-respecting order
    pub fn execution_order(&self) -> Vec<StepId> {
        toposort(&self.inner.dag, None)
            .map(|order| {
                order
                    .into_iter()
                    .map(|n| self.inner.steps[self.inner.dag[n]].id().clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Steps whose results feed `step_id`
    pub fn dependencies(&self, step_id: &StepId) -> Option<Vec<StepId>> {
        let idx = *self.inner.index.get(step_id)?;
        let mut deps: Vec<StepId> = self
            .inner
            .dag
            .neighbors_directed(self.inner.nodes[idx], petgraph::Direction::Incoming)
            .map(|n| self.inner.steps[self.inner.dag[n]].id().clone())
            .collect();
        deps.sort();
        Some(deps)
    }

    /// Ids of the steps sharing a parallel group with `step_id`, itself included
    pub fn parallel_group(&self, step_id: &StepId) -> Option<Vec<StepId>> {
        let idx = *self.inner.index.get(step_id)?;
        self.inner.stages.iter().find_map(|stage| match &stage.kind {
            StageKind::Parallel(branches) if branches.contains(&idx) => Some(
                branches
                    .iter()
                    .map(|b| self.inner.steps[*b].id().clone())
                    .collect(),
            ),
            _ => None,
        })
    }

    pub(crate) fn input_contract(&self) -> &dyn Contract {
        self.inner.input_contract.as_ref()
    }

    pub(crate) fn output_contract(&self) -> &dyn Contract {
        self.inner.output_contract.as_ref()
    }

    pub(crate) fn stages(&self) -> &[Stage] {
        &self.inner.stages
    }

    pub(crate) fn step(&self, idx: StepIndex) -> &Arc<dyn Step> {
        &self.inner.steps[idx]
    }

    pub(crate) fn step_id(&self, idx: StepIndex) -> &StepId {
        self.inner.steps[idx].id()
    }

    pub(crate) fn index_of(&self, step_id: &StepId) -> Option<StepIndex> {
        self.inner.index.get(step_id).copied()
    }

    /// Build the input for `idx` from the trigger input and recorded results
    pub(crate) fn assemble_input(
        &self,
        idx: StepIndex,
        trigger_input: &Value,
        results: &BTreeMap<StepId, StepResult>,
    ) -> Result<Value, String> {
        match &self.inner.inputs[idx] {
            InputSource::Trigger => Ok(trigger_input.clone()),
            InputSource::Step(pred) => self.output_of(*pred, results),
            InputSource::Join(preds) => self.join_outputs(preds, results),
        }
    }

    /// Output of the last stage, shaped the way a following join would see it
    pub(crate) fn final_output(
        &self,
        results: &BTreeMap<StepId, StepResult>,
    ) -> Result<Value, String> {
        match self.inner.stages.last().map(|s| &s.kind) {
            Some(StageKind::Single(idx)) => self.output_of(*idx, results),
            Some(StageKind::Parallel(branches)) => self.join_outputs(branches, results),
            None => Err("workflow has no stages".to_string()),
        }
    }

    fn output_of(
        &self,
        idx: StepIndex,
        results: &BTreeMap<StepId, StepResult>,
    ) -> Result<Value, String> {
        let id = self.step_id(idx);
        results
            .get(id)
            .and_then(|r| r.output())
            .cloned()
            .ok_or_else(|| format!("no successful result recorded for step '{}'", id))
    }

    fn join_outputs(
        &self,
        branches: &[StepIndex],
        results: &BTreeMap<StepId, StepResult>,
    ) -> Result<Value, String> {
        let mut joined = Map::new();
        for idx in branches {
            joined.insert(self.step_id(*idx).0.clone(), self.output_of(*idx, results)?);
        }
        Ok(Value::Object(joined))
    }

    pub(crate) fn check_step_ids<'a>(
        &self,
        ids: impl IntoIterator<Item = &'a StepId>,
    ) -> Result<(), String> {
        let known: HashSet<&StepId> = self.inner.index.keys().collect();
        for id in ids {
            if !known.contains(id) {
                return Err(format!("step '{}' is not part of workflow {}", id, self.id()));
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for WorkflowGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowGraph")
            .field("id", &self.inner.id)
            .field("stages", &self.inner.stages)
            .field("definition_hash", &self.inner.definition_hash)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::{StepDefinition, StepOutput};
    use chrono::Utc;
    use serde_json::json;

    fn echo(id: &str) -> StepDefinition {
        StepDefinition::new(id, |ctx| async move { Ok(StepOutput::Complete(ctx.input().clone())) })
    }

    fn diamond() -> WorkflowGraph {
        let mut builder = WorkflowBuilder::new("diamond");
        builder
            .then(echo("a"))
            .unwrap()
            .parallel([echo("b"), echo("c")])
            .unwrap()
            .then(echo("d"))
            .unwrap();
        builder.commit().unwrap()
    }

    #[test]
    fn test_linear_order_and_dependencies() {
        let mut builder = WorkflowBuilder::new("linear");
        builder
            .then(echo("step1"))
            .unwrap()
            .then(echo("step2"))
            .unwrap()
            .then(echo("step3"))
            .unwrap();
        let graph = builder.commit().unwrap();

        let order = graph.execution_order();
        assert_eq!(order, vec![StepId::new("step1"), StepId::new("step2"), StepId::new("step3")]);
        assert_eq!(
            graph.dependencies(&StepId::new("step3")).unwrap(),
            vec![StepId::new("step2")]
        );
        assert!(graph.dependencies(&StepId::new("step1")).unwrap().is_empty());
    }

    #[test]
    fn test_parallel_group_membership() {
        let graph = diamond();

        assert_eq!(graph.len(), 4);
        assert_eq!(
            graph.dependencies(&StepId::new("d")).unwrap(),
            vec![StepId::new("b"), StepId::new("c")]
        );
        assert_eq!(
            graph.parallel_group(&StepId::new("c")).unwrap(),
            vec![StepId::new("b"), StepId::new("c")]
        );
        assert!(graph.parallel_group(&StepId::new("a")).is_none());

        let stages = graph.stages();
        assert_eq!(stages.len(), 3);
        assert_eq!(stages[1].id, "parallel:b,c");
    }

    #[test]
    fn test_join_input_is_branch_map() {
        let graph = diamond();
        let now = Utc::now();
        let mut results = BTreeMap::new();
        for (id, output) in [("a", json!(1)), ("b", json!("left")), ("c", json!("right"))] {
            results.insert(
                StepId::new(id),
                StepResult {
                    outcome: crate::types::StepOutcome::Success { output },
                    started_at: now,
                    ended_at: now,
                    resumed_with: None,
                },
            );
        }

        let trigger = json!({"seed": true});
        let a = graph.index_of(&StepId::new("a")).unwrap();
        let b = graph.index_of(&StepId::new("b")).unwrap();
        let d = graph.index_of(&StepId::new("d")).unwrap();

        assert_eq!(graph.assemble_input(a, &trigger, &results).unwrap(), trigger);
        assert_eq!(graph.assemble_input(b, &trigger, &results).unwrap(), json!(1));
        assert_eq!(
            graph.assemble_input(d, &trigger, &results).unwrap(),
            json!({"b": "left", "c": "right"})
        );

        results.remove(&StepId::new("c"));
        assert!(graph.assemble_input(d, &trigger, &results).is_err());
    }

    #[test]
    fn test_duplicate_step_rejected() {
        let mut builder = WorkflowBuilder::new("dup");
        builder
            .then(echo("same"))
            .unwrap()
            .parallel([echo("other"), echo("same")])
            .unwrap();

        let err = builder.commit().unwrap_err();
        assert_eq!(err, GraphError::DuplicateStepId("same".to_string()));
        assert!(!builder.is_committed());
    }

    #[test]
    fn test_empty_graph_and_group_rejected() {
        let mut builder = WorkflowBuilder::new("empty");
        assert_eq!(
            builder.commit().unwrap_err(),
            GraphError::EmptyWorkflow("empty".to_string())
        );

        let mut builder = WorkflowBuilder::new("hollow");
        builder
            .then(echo("a"))
            .unwrap()
            .parallel(Vec::<StepDefinition>::new())
            .unwrap();
        assert_eq!(builder.commit().unwrap_err(), GraphError::EmptyParallelGroup(1));
    }

    #[test]
    fn test_recommit_rejected_and_graph_unchanged() {
        let mut builder = WorkflowBuilder::new("once");
        builder.then(echo("a")).unwrap();
        let graph = builder.commit().unwrap();
        let hash = graph.definition_hash().to_string();

        assert_eq!(
            builder.commit().unwrap_err(),
            GraphError::AlreadyCommitted("once".to_string())
        );
        assert!(builder.then(echo("b")).is_err());
        assert!(builder.parallel([echo("c")]).is_err());

        assert_eq!(graph.len(), 1);
        assert_eq!(graph.definition_hash(), hash);
    }

    #[test]
    fn test_definition_hash_tracks_shape() {
        let sequential = {
            let mut b = WorkflowBuilder::new("wf");
            b.then(echo("x")).unwrap().then(echo("y")).unwrap();
            b.commit().unwrap()
        };
        let fanned = {
            let mut b = WorkflowBuilder::new("wf");
            b.parallel([echo("x"), echo("y")]).unwrap();
            b.commit().unwrap()
        };
        let again = {
            let mut b = WorkflowBuilder::new("wf");
            b.then(echo("x")).unwrap().then(echo("y")).unwrap();
            b.commit().unwrap()
        };

        assert_ne!(sequential.definition_hash(), fanned.definition_hash());
        assert_eq!(sequential.definition_hash(), again.definition_hash());
    }

    #[test]
    fn test_every_step_follows_its_dependencies() {
        let mut builder = WorkflowBuilder::new("wide");
        builder
            .parallel([echo("a1"), echo("a2")])
            .unwrap()
            .then(echo("b"))
            .unwrap()
            .parallel([echo("c1"), echo("c2"), echo("c3")])
            .unwrap();
        let graph = builder.commit().unwrap();

        let order = graph.execution_order();
        assert_eq!(order.len(), graph.len());
        for (position, step_id) in order.iter().enumerate() {
            for dependency in graph.dependencies(step_id).unwrap() {
                let before = order.iter().position(|id| *id == dependency).unwrap();
                assert!(before < position, "{} must run before {}", dependency, step_id);
            }
        }
    }
}

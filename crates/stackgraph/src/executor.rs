//! Execution engine - applies batches in order with bounded parallelism
//!
//! Batches run one after another; nodes inside a batch run concurrently on a
//! rayon pool of `jobs` threads. Configuration for a batch is resolved on the
//! calling thread before any node is dispatched, so workers only ever see
//! finished values.
//!
//! A stack's state artifact is written as soon as every node of the stack has
//! applied and before any node that may read it starts. If a node fails, the
//! nodes already running in its batch finish, no later batch starts, and
//! nothing is rolled back.

use crate::compiler::CompiledPlan;
use crate::context::{ConfirmCallback, ExecutionBackend, ProgressCallback};
use crate::error::Error;
use crate::planner::Batch;
use crate::remote_state::RemoteStateBridge;
use crate::resolver::{ResolveMode, Resolver};
use crate::stack::{NodeKey, Stack};
use crate::state::{NodeRecord, StackState, StateStore};
use crate::types::{Attributes, ExecuteOptions, ExecuteSummary, ExecutionFailure, NodeResult};
use crate::value::OutputValue;
use crate::variables::{self, REDACTED};
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

type Outcome<T = ExecuteSummary> = std::result::Result<T, ExecutionFailure>;

/// Collaborators used while executing a plan
pub struct Environment<'a> {
    pub backend: &'a dyn ExecutionBackend,
    pub store: &'a dyn StateStore,
    /// Must read from `store`, so deferred remote state sees fresh writes
    pub bridge: &'a RemoteStateBridge<'a>,
}

/// Filled in by workers as nodes finish
#[derive(Default)]
struct Completion {
    finished: Vec<(NodeKey, anyhow::Result<Attributes>)>,
}

/// One node ready to dispatch
struct Job<'p> {
    key: &'p NodeKey,
    kind: &'p str,
    config: serde_json::Value,
}

/// Apply `compiled` and persist every planned stack
///
/// Recorded nodes that are no longer declared are destroyed afterwards when
/// `opts.prune` is set.
pub fn apply<P, C>(
    compiled: &CompiledPlan,
    env: &Environment<'_>,
    opts: &ExecuteOptions,
    progress: &mut P,
    confirm: &mut C,
) -> Outcome
where
    P: ProgressCallback,
    C: ConfirmCallback,
{
    let mut run = Run::new(compiled, env, opts)?;
    let orphans = if opts.prune { run.orphans() } else { Vec::new() };
    let plan = compiled.plan();

    let no_outputs = compiled.stacks().iter().all(|s| s.outputs.is_empty());
    if plan.is_empty() && orphans.is_empty() && no_outputs {
        return Ok(run.summary);
    }

    let prompt = format!(
        "Apply {} nodes in {} batches{}?",
        plan.node_count(),
        plan.batches.len(),
        if orphans.is_empty() {
            String::new()
        } else {
            format!(" and prune {} removed nodes", orphans.len())
        }
    );
    if !run.confirm(confirm, &prompt)? {
        run.summary.not_started = plan.nodes().cloned().collect();
        return Ok(run.summary);
    }

    let total = plan.batches.len();
    for (index, batch) in plan.batches.iter().enumerate() {
        run.persist_completed(batch.level, progress)?;
        run.apply_batch(index, total, batch, progress)?;
    }
    run.persist_completed(usize::MAX, progress)?;

    if !orphans.is_empty() {
        run.prune(&orphans, progress)?;
    }

    log::info!(
        "applied {} nodes, persisted {} stacks",
        run.summary.applied.len(),
        run.summary.persisted.len()
    );
    Ok(run.summary)
}

/// Destroy every recorded node of the planned stacks and remove their state
///
/// Nodes are destroyed in reverse plan order; recorded nodes that are no
/// longer declared go first.
pub fn destroy<P, C>(
    compiled: &CompiledPlan,
    env: &Environment<'_>,
    opts: &ExecuteOptions,
    progress: &mut P,
    confirm: &mut C,
) -> Outcome
where
    P: ProgressCallback,
    C: ConfirmCallback,
{
    let mut run = Run::new(compiled, env, opts)?;

    let mut batches: Vec<Vec<(NodeKey, String)>> = Vec::new();
    let orphans = run.orphans();
    if !orphans.is_empty() {
        batches.push(orphans);
    }
    for batch in compiled.plan().destroy_order() {
        let recorded: Vec<(NodeKey, String)> = batch
            .nodes
            .iter()
            .filter_map(|key| run.recorded(key).map(|r| (key.clone(), r.kind.clone())))
            .collect();
        let unrecorded: Vec<NodeKey> = batch
            .nodes
            .iter()
            .filter(|k| run.recorded(k).is_none())
            .cloned()
            .collect();
        run.summary.skipped.extend(unrecorded);
        if !recorded.is_empty() {
            batches.push(recorded);
        }
    }

    let count: usize = batches.iter().map(Vec::len).sum();
    if count == 0 {
        run.remove_states()?;
        return Ok(run.summary);
    }
    let prompt = format!("Destroy {count} nodes in {} batches?", batches.len());
    if !run.confirm(confirm, &prompt)? {
        run.summary.not_started = batches.into_iter().flatten().map(|(k, _)| k).collect();
        return Ok(run.summary);
    }

    let total = batches.len();
    for index in 0..total {
        run.destroy_batch(index, &batches, progress)?;
    }
    run.remove_states()?;

    log::info!("destroyed {} nodes", run.summary.destroyed.len());
    Ok(run.summary)
}

struct Run<'r> {
    compiled: &'r CompiledPlan,
    env: &'r Environment<'r>,
    pool: rayon::ThreadPool,
    secrets: Vec<serde_json::Value>,
    /// Last state read or written per planned stack
    states: BTreeMap<String, Option<StackState>>,
    /// Attributes of applied nodes, merged over their resolved configuration
    attributes: BTreeMap<NodeKey, Attributes>,
    persisted: BTreeSet<String>,
    summary: ExecuteSummary,
}

impl<'r> Run<'r> {
    fn new(
        compiled: &'r CompiledPlan,
        env: &'r Environment<'r>,
        opts: &ExecuteOptions,
    ) -> Outcome<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(opts.jobs.max(1))
            .build()
            .map_err(|e| {
                let error = Error::Internal(format!("failed to create thread pool: {e}"));
                failure(error, ExecuteSummary::default())
            })?;

        let mut states = BTreeMap::new();
        for stack in compiled.stacks() {
            let state = env
                .store
                .read(&stack.name)
                .map_err(|e| failure(e, ExecuteSummary::default()))?;
            states.insert(stack.name.clone(), state);
        }

        Ok(Self {
            compiled,
            env,
            pool,
            secrets: compiled.variables().sensitive_values(),
            states,
            attributes: BTreeMap::new(),
            persisted: BTreeSet::new(),
            summary: ExecuteSummary::default(),
        })
    }

    fn confirm<C: ConfirmCallback>(&mut self, confirm: &mut C, prompt: &str) -> Outcome<bool> {
        confirm
            .confirm(prompt)
            .map_err(|e| self.fail(Error::Internal(format!("confirmation failed: {e:#}"))))
    }

    fn fail(&mut self, error: Error) -> ExecutionFailure {
        failure(error, std::mem::take(&mut self.summary))
    }

    fn recorded(&self, key: &NodeKey) -> Option<&NodeRecord> {
        self.states.get(&key.stack)?.as_ref()?.node(&key.node)
    }

    /// Recorded nodes no longer declared, in reverse recorded order
    fn orphans(&self) -> Vec<(NodeKey, String)> {
        let mut orphans = Vec::new();
        for stack in self.compiled.stacks().iter().rev() {
            let Some(Some(state)) = self.states.get(&stack.name) else {
                continue;
            };
            for record in state.nodes.iter().rev() {
                if stack.node(&record.id).is_none() {
                    orphans.push((stack.key(&record.id), record.kind.clone()));
                }
            }
        }
        orphans
    }

    fn apply_batch<P: ProgressCallback>(
        &mut self,
        index: usize,
        total: usize,
        batch: &Batch,
        progress: &mut P,
    ) -> Outcome<()> {
        let mut first_error: Option<Error> = None;
        let mut jobs = Vec::with_capacity(batch.nodes.len());

        for key in &batch.nodes {
            match self.resolve(key) {
                Ok(job) => jobs.push(job),
                Err(e) => {
                    log::warn!("could not resolve configuration of {key}");
                    first_error.get_or_insert(Error::Execution {
                        node: key.clone(),
                        batch: index,
                        message: e.to_string(),
                    });
                    self.summary.add_result(key, &NodeResult::Failed { error: e.to_string() });
                }
            }
        }

        progress.on_batch_start(index, total, &batch.nodes);
        log::debug!("dispatching batch {index} ({} nodes)", jobs.len());

        let completion = Mutex::new(Completion::default());
        let backend = self.env.backend;
        self.pool.install(|| {
            jobs.par_iter().for_each(|job| {
                let result = backend.apply(job.key, job.kind, &job.config);
                completion
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .finished
                    .push((job.key.clone(), result));
            });
        });
        let mut finished = completion
            .into_inner()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .finished;
        finished.sort_by_key(|(key, _)| batch.nodes.iter().position(|k| k == key));

        let configs: BTreeMap<&NodeKey, &serde_json::Value> =
            jobs.iter().map(|j| (j.key, &j.config)).collect();
        for (key, result) in finished {
            let outcome = match result {
                Ok(exported) => {
                    let mut attributes: Attributes = configs
                        .get(&key)
                        .and_then(|c| c.as_object())
                        .map(|c| c.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                        .unwrap_or_default();
                    attributes.extend(exported);
                    self.attributes.insert(key.clone(), attributes);
                    log::info!("applied {key}");
                    NodeResult::Applied
                }
                Err(e) => {
                    let message = self.scrub(&format!("{e:#}"));
                    log::warn!("{key} failed");
                    first_error.get_or_insert(Error::Execution {
                        node: key.clone(),
                        batch: index,
                        message: message.clone(),
                    });
                    NodeResult::Failed { error: message }
                }
            };
            self.summary.add_result(&key, &outcome);
            progress.on_node_complete(&key, &outcome);
        }
        progress.on_batch_complete(index);

        let Some(error) = first_error else {
            self.summary.batches_completed += 1;
            return Ok(());
        };

        self.summary.not_started = self
            .compiled
            .plan()
            .batches
            .iter()
            .skip(index + 1)
            .flat_map(|b| b.nodes.iter().cloned())
            .collect();
        if let Err(e) = self.persist_finished(progress) {
            log::error!("could not persist finished stacks: {e}");
        }
        self.persist_partial(progress);
        Err(self.fail(error))
    }

    fn resolve<'p>(&self, key: &'p NodeKey) -> crate::error::Result<Job<'p>>
    where
        'r: 'p,
    {
        let stack = self.stack(&key.stack)?;
        let node = stack
            .node(&key.node)
            .ok_or_else(|| Error::Internal(format!("{key} is not declared")))?;
        let config = self.resolver(stack).resolve(&key.to_string(), &node.config)?;
        Ok(Job {
            key,
            kind: &node.kind,
            config,
        })
    }

    fn resolver<'s>(&'s self, stack: &'s Stack) -> Resolver<'s> {
        Resolver::new(
            stack,
            self.compiled.variables(),
            self.env.bridge,
            &self.attributes,
            self.compiled.deferred_sources(&stack.name),
            ResolveMode::Apply,
        )
    }

    fn stack(&self, name: &str) -> crate::error::Result<&'r Stack> {
        let compiled = self.compiled;
        compiled
            .stack(name)
            .ok_or_else(|| Error::Internal(format!("stack '{name}' is not part of the plan")))
    }

    /// Persist every stack whose boundary lies below `level`, lowest boundary first
    fn persist_completed<P: ProgressCallback>(
        &mut self,
        level: usize,
        progress: &mut P,
    ) -> Outcome<()> {
        let checkpoints = &self.compiled.plan().checkpoints;
        let mut ready: Vec<(usize, String)> = self
            .compiled
            .stacks()
            .iter()
            .filter(|s| !self.persisted.contains(&s.name))
            .filter_map(|s| checkpoints.get(&s.name).map(|&c| (c, s.name.clone())))
            .filter(|(c, _)| *c < level)
            .collect();
        ready.sort_by_key(|(c, _)| *c);

        for (_, name) in ready {
            if let Err(e) = self.persist(&name, true) {
                return Err(self.fail(e));
            }
            progress.on_stack_persisted(&name);
        }
        Ok(())
    }

    /// Persist, outputs included, every stack whose nodes all applied
    ///
    /// Runs before a failed batch stops execution, so a stack that finished
    /// in that batch or earlier still publishes its outputs.
    fn persist_finished<P: ProgressCallback>(
        &mut self,
        progress: &mut P,
    ) -> crate::error::Result<()> {
        let checkpoints = &self.compiled.plan().checkpoints;
        let mut finished: Vec<(usize, String)> = self
            .compiled
            .stacks()
            .iter()
            .filter(|s| !self.persisted.contains(&s.name))
            .filter(|s| {
                s.nodes
                    .iter()
                    .all(|n| self.attributes.contains_key(&s.key(&n.id)))
            })
            .map(|s| (checkpoints.get(&s.name).copied().unwrap_or(0), s.name.clone()))
            .collect();
        finished.sort_by_key(|(c, _)| *c);

        for (_, name) in finished {
            self.persist(&name, true)?;
            progress.on_stack_persisted(&name);
        }
        Ok(())
    }

    /// Record applied nodes of unfinished stacks, keeping previous outputs
    fn persist_partial<P: ProgressCallback>(&mut self, progress: &mut P) {
        let touched: Vec<String> = self
            .compiled
            .stacks()
            .iter()
            .filter(|s| !self.persisted.contains(&s.name))
            .filter(|s| self.attributes.keys().any(|k| k.stack == s.name))
            .map(|s| s.name.clone())
            .collect();

        for name in touched {
            match self.persist(&name, false) {
                Ok(()) => progress.on_stack_persisted(&name),
                Err(e) => log::error!("could not record partial state of '{name}': {e}"),
            }
        }
    }

    fn persist(&mut self, name: &str, complete: bool) -> crate::error::Result<()> {
        let stack = self.stack(name)?;
        let compiled = self.compiled;
        let bound = compiled.variables();
        let previous = self.states.get(name).and_then(Option::as_ref);
        let mut state = StackState::next(name, previous);
        if let Some(previous) = previous {
            state.nodes.clone_from(&previous.nodes);
            if !complete {
                state.outputs.clone_from(&previous.outputs);
                state.sensitive_outputs.clone_from(&previous.sensitive_outputs);
            }
        }

        for node in &stack.nodes {
            let key = stack.key(&node.id);
            if let Some(attributes) = self.attributes.get(&key) {
                let mut attributes = attributes.clone();
                if let Some(config) = node.config.as_map() {
                    for (field, value) in config {
                        if let Some(attribute) = attributes.get_mut(field) {
                            variables::redact_sensitive(value, attribute, name, bound);
                        }
                    }
                }
                for value in attributes.values_mut() {
                    variables::scrub_json(value, &self.secrets);
                }
                state.upsert_node(NodeRecord {
                    id: node.id.clone(),
                    kind: node.kind.clone(),
                    attributes,
                });
            }
        }

        if complete {
            let resolver = self.resolver(stack);
            for output in &stack.outputs {
                let invalid = |message: String| Error::InvalidOutput {
                    stack: name.to_string(),
                    name: output.name.clone(),
                    message,
                };
                let owner = format!("{name}.output.{}", output.name);
                let mut resolved = resolver
                    .resolve(&owner, &output.value)
                    .map_err(|e| invalid(e.to_string()))?;
                variables::redact_sensitive(&output.value, &mut resolved, name, bound);
                variables::scrub_json(&mut resolved, &self.secrets);
                let value = OutputValue::from_json(&resolved)
                    .ok_or_else(|| invalid("must be a string or a list of strings".into()))?;
                if output.sensitive {
                    state.sensitive_outputs.insert(output.name.clone());
                }
                state.outputs.insert(output.name.clone(), value);
            }
        }

        self.env.store.write(&state)?;
        log::info!("persisted state of '{name}' (serial {})", state.serial);
        self.states.insert(name.to_string(), Some(state));
        self.persisted.insert(name.to_string());
        self.summary.persisted.push(name.to_string());
        Ok(())
    }

    /// Destroy orphans one at a time, removing each from its stack's state
    fn prune<P: ProgressCallback>(
        &mut self,
        orphans: &[(NodeKey, String)],
        progress: &mut P,
    ) -> Outcome<()> {
        let index = self.compiled.plan().batches.len();
        let keys: Vec<NodeKey> = orphans.iter().map(|(k, _)| k.clone()).collect();
        progress.on_batch_start(index, index + 1, &keys);

        for (key, kind) in orphans {
            if let Err(e) = self.env.backend.destroy(key, kind) {
                let message = self.scrub(&format!("{e:#}"));
                let result = NodeResult::Failed { error: message.clone() };
                self.summary.add_result(key, &result);
                progress.on_node_complete(key, &result);
                return Err(self.fail(Error::Execution {
                    node: key.clone(),
                    batch: index,
                    message,
                }));
            }
            log::info!("pruned {key}");

            if let Some(Some(state)) = self.states.get_mut(&key.stack) {
                state.remove_node(&key.node);
                state.bump();
                if let Err(e) = self.env.store.write(state) {
                    return Err(self.fail(e));
                }
            }
            self.summary.add_result(key, &NodeResult::Destroyed);
            progress.on_node_complete(key, &NodeResult::Destroyed);
        }

        progress.on_batch_complete(index);
        self.summary.batches_completed += 1;
        Ok(())
    }

    fn destroy_batch<P: ProgressCallback>(
        &mut self,
        index: usize,
        batches: &[Vec<(NodeKey, String)>],
        progress: &mut P,
    ) -> Outcome<()> {
        let batch = &batches[index];
        let keys: Vec<NodeKey> = batch.iter().map(|(k, _)| k.clone()).collect();
        progress.on_batch_start(index, batches.len(), &keys);

        let completion = Mutex::new(Completion::default());
        let backend = self.env.backend;
        self.pool.install(|| {
            batch.par_iter().for_each(|(key, kind)| {
                let result = backend.destroy(key, kind).map(|()| Attributes::new());
                completion
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .finished
                    .push((key.clone(), result));
            });
        });
        let mut finished = completion
            .into_inner()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .finished;
        finished.sort_by_key(|(key, _)| keys.iter().position(|k| k == key));

        let mut first_error = None;
        for (key, result) in finished {
            let outcome = match result {
                Ok(_) => {
                    if let Some(Some(state)) = self.states.get_mut(&key.stack) {
                        state.remove_node(&key.node);
                    }
                    log::info!("destroyed {key}");
                    NodeResult::Destroyed
                }
                Err(e) => {
                    let message = self.scrub(&format!("{e:#}"));
                    log::warn!("{key} failed to destroy");
                    first_error.get_or_insert(Error::Execution {
                        node: key.clone(),
                        batch: index,
                        message: message.clone(),
                    });
                    NodeResult::Failed { error: message }
                }
            };
            self.summary.add_result(&key, &outcome);
            progress.on_node_complete(&key, &outcome);
        }
        progress.on_batch_complete(index);

        let Some(error) = first_error else {
            self.summary.batches_completed += 1;
            return Ok(());
        };

        self.summary.not_started = batches
            .iter()
            .skip(index + 1)
            .flat_map(|b| b.iter().map(|(k, _)| k.clone()))
            .collect();
        // Keep records of whatever still exists
        let names: Vec<String> = self.states.keys().cloned().collect();
        for name in names {
            if let Some(Some(state)) = self.states.get_mut(&name) {
                state.bump();
                if let Err(e) = self.env.store.write(state) {
                    log::error!("could not record remaining state of '{name}': {e}");
                }
            }
        }
        Err(self.fail(error))
    }

    fn remove_states(&mut self) -> Outcome<()> {
        let compiled = self.compiled;
        for stack in compiled.stacks() {
            if let Err(e) = self.env.store.remove(&stack.name) {
                return Err(self.fail(e));
            }
            log::info!("removed state of '{}'", stack.name);
        }
        Ok(())
    }

    fn scrub(&self, message: &str) -> String {
        self.secrets.iter().fold(message.to_string(), |acc, secret| {
            let text = match secret {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            acc.replace(&text, REDACTED)
        })
    }
}

fn failure(error: Error, summary: ExecuteSummary) -> ExecutionFailure {
    ExecutionFailure { error, summary }
}

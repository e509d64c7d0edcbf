//! Reverse-closure plan construction (§4.3).
//!
//! The planner is a pure function of `(goals, initial_attrs, catalog)`; it
//! performs no I/O and never panics on malformed input, returning
//! [`PlanningError`] instead.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;
use thiserror::Error;

use crate::model::attribute::AttributeEdges;
use crate::model::plan::{Excluded, ExecutionPlan};
use crate::model::step::{Name, Role, Step, StepId};

#[derive(Debug, Error, PartialEq)]
pub enum PlanningError {
    #[error("cycle detected in plan closure at step {0}")]
    CycleDetected(StepId),

    #[error("unknown step referenced: {0}")]
    UnknownStep(StepId),

    #[error("required inputs missing at launch: {0:?}")]
    RequiredInputsMissing(Vec<Name>),

    #[error("plan closure of {0} steps exceeds the configured limit of {1}")]
    PlanTooLarge(usize, usize),
}

/// Bounds on plan construction (§B "Configuration"); `plan` itself stays a
/// pure, unbounded function, matching the teacher's separation between a
/// pure closure computation and the config a caller applies around it.
#[derive(Debug, Clone)]
pub struct PlannerConfig {
    /// Refuses closures larger than this (§4.3's cycle/missing-input
    /// checks bound correctness, not size; a config-level guard bounds
    /// the blast radius of a pathological catalog).
    pub max_plan_steps: usize,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self { max_plan_steps: 512 }
    }
}

impl PlannerConfig {
    /// Reads `ARGYLL_MAX_PLAN_STEPS`, falling back to [`Default`] when
    /// unset or unparseable.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(max) = crate::executor::parse_env_var("ARGYLL_MAX_PLAN_STEPS") {
            config.max_plan_steps = max;
        }
        config
    }
}

/// As [`plan`], additionally refusing closures larger than
/// `config.max_plan_steps`.
pub fn plan_bounded(
    goals: &[StepId],
    initial_attrs: &BTreeMap<Name, Value>,
    catalog: &BTreeMap<StepId, Step>,
    config: &PlannerConfig,
) -> Result<ExecutionPlan, PlanningError> {
    let built = plan(goals, initial_attrs, catalog)?;
    if built.steps.len() > config.max_plan_steps {
        return Err(PlanningError::PlanTooLarge(built.steps.len(), config.max_plan_steps));
    }
    Ok(built)
}

/// Providers of `name`, sorted for deterministic iteration.
fn providers_of<'a>(
    index: &'a BTreeMap<Name, Vec<StepId>>,
    name: &str,
) -> &'a [StepId] {
    index.get(name).map(Vec::as_slice).unwrap_or(&[])
}

/// Builds `Providers: Name -> [StepID]` from the catalog's declared
/// outputs (§4.3 step 1).
fn build_provider_index(catalog: &BTreeMap<StepId, Step>) -> BTreeMap<Name, Vec<StepId>> {
    let mut index: BTreeMap<Name, Vec<StepId>> = BTreeMap::new();
    for step in catalog.values() {
        for output in step.outputs() {
            index.entry(output.clone()).or_default().push(step.id.clone());
        }
    }
    for providers in index.values_mut() {
        providers.sort();
        providers.dedup();
    }
    index
}

#[derive(Debug, Default)]
struct ClosureState {
    included: BTreeSet<StepId>,
    satisfied: BTreeMap<StepId, Vec<Name>>,
    missing: BTreeMap<StepId, Vec<Name>>,
}

/// Reverse-closure walk from the goal set. Returns the step ids included
/// in the plan plus the exclusion bookkeeping, or a `PlanningError` if the
/// walk finds a cycle or references an unknown step.
fn close_over_goals(
    goals: &[StepId],
    initial_attrs: &BTreeMap<Name, Value>,
    catalog: &BTreeMap<StepId, Step>,
    providers: &BTreeMap<Name, Vec<StepId>>,
) -> Result<ClosureState, PlanningError> {
    let mut state = ClosureState::default();
    // DFS with an explicit stack of frames carrying the ancestry path, so
    // a back-edge to a step still on the current path is a real cycle
    // rather than a step finished on an unrelated earlier branch.
    let mut stack: Vec<(StepId, BTreeSet<StepId>)> = goals
        .iter()
        .cloned()
        .map(|g| (g, BTreeSet::new()))
        .collect();

    while let Some((step_id, ancestry)) = stack.pop() {
        if state.included.contains(&step_id) || state.satisfied.contains_key(&step_id) {
            continue;
        }
        let step = catalog
            .get(&step_id)
            .ok_or_else(|| PlanningError::UnknownStep(step_id.clone()))?;

        if goals.contains(&step_id) {
            let outputs = step.outputs();
            let unsatisfied = outputs.iter().any(|name| !initial_attrs.contains_key(*name));
            if !outputs.is_empty() && !unsatisfied {
                let mut satisfied_names: Vec<Name> = outputs.into_iter().cloned().collect();
                satisfied_names.sort();
                state.satisfied.insert(step_id.clone(), satisfied_names);
                continue;
            }
        }

        state.included.insert(step_id.clone());
        let mut child_ancestry = ancestry.clone();
        child_ancestry.insert(step_id.clone());

        let mut next: Vec<StepId> = Vec::new();
        for name in step.required_inputs() {
            if initial_attrs.contains_key(name) {
                // Already resolvable from the initial attribute set: its
                // catalog providers are candidates that turn out to be
                // unneeded, not part of the closure.
                for p in providers_of(providers, name) {
                    if !state.included.contains(p) {
                        state
                            .satisfied
                            .entry(p.clone())
                            .or_default()
                            .push(name.clone());
                    }
                }
                continue;
            }
            let provs = providers_of(providers, name);
            if provs.is_empty() {
                state
                    .missing
                    .entry(step_id.clone())
                    .or_default()
                    .push(name.clone());
                continue;
            }
            for p in provs {
                if ancestry.contains(p) {
                    return Err(PlanningError::CycleDetected(p.clone()));
                }
                next.push(p.clone());
            }
        }
        for name in step.optional_inputs() {
            if initial_attrs.contains_key(name) {
                continue;
            }
            for p in providers_of(providers, name) {
                if !ancestry.contains(p) {
                    next.push(p.clone());
                }
            }
        }

        next.sort();
        next.dedup();
        for n in next {
            stack.push((n, child_ancestry.clone()));
        }
    }

    for entry in state.missing.values_mut() {
        entry.sort();
        entry.dedup();
    }
    for entry in state.satisfied.values_mut() {
        entry.sort();
        entry.dedup();
    }
    // A step walked into and then fully included is not actually excluded,
    // even if it was also seen as a would-be satisfied producer elsewhere.
    for included_id in &state.included {
        state.satisfied.remove(included_id);
    }

    Ok(state)
}

/// Builds the `(Providers, Consumers)` attribute edge table for included
/// steps only (§4.3 step 6).
fn build_attribute_edges(
    included: &BTreeSet<StepId>,
    catalog: &BTreeMap<StepId, Step>,
) -> BTreeMap<Name, AttributeEdges> {
    let mut edges: BTreeMap<Name, AttributeEdges> = BTreeMap::new();
    let mut step_ids: Vec<&StepId> = included.iter().collect();
    step_ids.sort();

    for step_id in &step_ids {
        let step = &catalog[*step_id];
        for output in step.outputs() {
            edges.entry(output.clone()).or_default().providers.push((*step_id).clone());
        }
        for name in step
            .required_inputs()
            .into_iter()
            .chain(step.optional_inputs())
        {
            edges.entry(name.clone()).or_default().consumers.push((*step_id).clone());
        }
    }

    for edge in edges.values_mut() {
        edge.providers.sort();
        edge.providers.dedup();
        edge.consumers.sort();
        edge.consumers.dedup();
    }
    edges
}

/// Builds the immutable `ExecutionPlan` for `goals` given `initial_attrs`
/// and the registered `catalog` (§4.3).
pub fn plan(
    goals: &[StepId],
    initial_attrs: &BTreeMap<Name, Value>,
    catalog: &BTreeMap<StepId, Step>,
) -> Result<ExecutionPlan, PlanningError> {
    for g in goals {
        if !catalog.contains_key(g) {
            return Err(PlanningError::UnknownStep(g.clone()));
        }
    }

    let providers = build_provider_index(catalog);
    let closure = close_over_goals(goals, initial_attrs, catalog, &providers)?;

    let included_steps: BTreeMap<StepId, Step> = closure
        .included
        .iter()
        .map(|id| (id.clone(), catalog[id].clone()))
        .collect();

    let mut required: BTreeSet<Name> = BTreeSet::new();
    for step in included_steps.values() {
        for name in step.required_inputs() {
            if initial_attrs.contains_key(name) {
                continue;
            }
            let produced_internally = included_steps
                .values()
                .any(|s| s.outputs().iter().any(|o| *o == name));
            if !produced_internally {
                required.insert(name.clone());
            }
        }
    }

    if !closure.missing.is_empty() {
        let mut names: Vec<Name> = closure.missing.values().flatten().cloned().collect();
        names.sort();
        names.dedup();
        if !names.is_empty() {
            return Err(PlanningError::RequiredInputsMissing(names));
        }
    }

    let required: Vec<Name> = required.into_iter().collect();
    if !required.is_empty() {
        let unresolved: Vec<Name> = required
            .iter()
            .filter(|n| !initial_attrs.contains_key(*n))
            .cloned()
            .collect();
        if !unresolved.is_empty() {
            return Err(PlanningError::RequiredInputsMissing(unresolved));
        }
    }

    let attributes = build_attribute_edges(&closure.included, catalog);

    let excluded = if closure.satisfied.is_empty() && closure.missing.is_empty() {
        None
    } else {
        Some(Excluded {
            satisfied: closure.satisfied,
            missing: closure.missing,
        })
    };

    let mut goals_sorted = goals.to_vec();
    goals_sorted.sort();

    Ok(ExecutionPlan {
        goals: goals_sorted,
        required,
        steps: included_steps,
        attributes,
        excluded,
    })
}

//! Executes a compiled [`Program`] against pluggable decision procedures and capability invokers.
//!
//! The runtime is a plain step loop: start at the entry routine, merge each routine's updates
//! into shared state under the schema's merge policies, and follow the returned target until
//! `TERMINAL` is reached.
use crate::error::RuntimeError;
use crate::program::{Program, Target};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, info};

mod engine;
pub mod message;
pub mod procedure;
pub mod state;
pub mod template;

pub use engine::DecisionPhase;
pub use message::{CapabilityRequest, Message};
pub use procedure::{
    CapabilityInvoker, DecisionProcedure, OfflineInvoker, ProcedureCall, RouteChoice, RouteOption,
};
pub use state::{SharedState, StateUpdates};

use engine::RoutineEngine;

/// One executed routine.
#[derive(Debug, Clone, PartialEq)]
pub struct RunStep {
    pub routine: String,
    pub node_id: String,
    pub kind: &'static str,
    pub next: Target,
    pub note: Option<String>,
}

/// The ordered record of a run.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RunTrace {
    pub steps: Vec<RunStep>,
}

impl RunTrace {
    /// Symbols of the executed routines, in order.
    pub fn path(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.routine.as_str()).collect()
    }

    pub fn visits(&self, routine: &str) -> usize {
        self.steps.iter().filter(|s| s.routine == routine).count()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub state: BTreeMap<String, Value>,
    pub trace: RunTrace,
}

pub struct RuntimeBuilder<'p, P, I> {
    program: &'p Program,
    procedure: P,
    invoker: I,
    step_limit: Option<usize>,
}

impl<'p, P: DecisionProcedure, I: CapabilityInvoker> RuntimeBuilder<'p, P, I> {
    /// Caps the number of routines one run may execute. `0` removes the cap.
    ///
    /// Runs are unbounded by default; the per-node iteration caps already guarantee termination.
    pub fn with_step_limit(mut self, limit: usize) -> Self {
        self.step_limit = (limit > 0).then_some(limit);
        self
    }

    pub fn build(self) -> Runtime<'p, P, I> {
        Runtime {
            program: self.program,
            procedure: self.procedure,
            invoker: self.invoker,
            step_limit: self.step_limit,
        }
    }
}

/// Drives one program; reusable across runs.
pub struct Runtime<'p, P, I> {
    program: &'p Program,
    procedure: P,
    invoker: I,
    step_limit: Option<usize>,
}

impl<'p, P: DecisionProcedure, I: CapabilityInvoker> Runtime<'p, P, I> {
    pub fn builder(program: &'p Program, procedure: P, invoker: I) -> RuntimeBuilder<'p, P, I> {
        RuntimeBuilder {
            program,
            procedure,
            invoker,
            step_limit: None,
        }
    }

    pub fn procedure(&self) -> &P {
        &self.procedure
    }

    pub fn invoker(&self) -> &I {
        &self.invoker
    }

    /// Runs the program from its entry routine until `TERMINAL`.
    ///
    /// `initial` is merged over the schema's initial values before the entry routine runs.
    pub fn run(&mut self, initial: BTreeMap<String, Value>) -> Result<RunOutcome, RuntimeError> {
        let program = self.program;
        let mut state = SharedState::from_schema(&program.state);
        state.apply(&program.state, initial.into_iter().collect())?;

        let mut engine = RoutineEngine::new(program, &mut self.procedure, &mut self.invoker);
        let mut trace = RunTrace::default();
        let mut current = program.entry.clone();
        info!(program = %program.name, entry = %current, "run started");

        loop {
            if let Some(limit) = self.step_limit.filter(|limit| trace.steps.len() >= *limit) {
                return Err(RuntimeError::StepLimitExceeded(limit));
            }
            let routine = program
                .routine(&current)
                .ok_or_else(|| RuntimeError::UnknownRoutine(current.clone()))?;
            let outcome = engine.execute(routine, &state)?;
            debug!(routine = %routine.symbol, next = %outcome.next, updates = outcome.updates.len(), "routine finished");
            state.apply(&program.state, outcome.updates)?;
            trace.steps.push(RunStep {
                routine: routine.symbol.clone(),
                node_id: routine.node_id.clone(),
                kind: routine.body.kind_name(),
                next: outcome.next.clone(),
                note: outcome.note,
            });
            match outcome.next {
                Target::Terminal => break,
                Target::Routine(symbol) => current = symbol,
            }
        }

        info!(program = %program.name, steps = trace.steps.len(), "run finished");
        Ok(RunOutcome {
            state: state.into_values(),
            trace,
        })
    }
}

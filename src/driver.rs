//! Pipeline driver: validates the configured step set, brings it
//! up on a dedicated worker thread, runs iterations until cancellation, and
//! tears it down.
//!
//! `StepSet` holds a closed sum of step roles as typed, optional fields
//! rather than a homogeneous `Vec` dispatched on index: the input/deserialize
//! and serialize/output pairing invariant is visible in the type, and
//! `validate()` only needs to check it, not re-derive it from a flat list.

use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, error, info};
use pyo3::prelude::*;

use crate::cancel::CancelToken;
use crate::errors::{ConfigError, PipelineError, StartError};
use crate::steps::deserialize::DeserializeStep;
use crate::steps::input::InputStep;
use crate::steps::output::OutputStep;
use crate::steps::script::ScriptStep;
use crate::steps::serialize::SerializeStep;

const STARTED_TIMEOUT: Duration = Duration::from_secs(5);

/// The fixed, ordered set of steps a driver owns. Input and
/// deserialize are both present or both absent; so are serialize and output.
/// `validate()` is the only place this invariant is checked — steps are
/// owned exclusively by their driver afterward, no sharing.
pub struct StepSet {
    pub name: String,
    pub input: Option<InputStep>,
    pub deserialize: Option<DeserializeStep>,
    pub scripts: Vec<ScriptStep>,
    pub serialize: Option<SerializeStep>,
    pub output: Option<OutputStep>,
}

impl StepSet {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::NameNotAssigned);
        }
        if self.scripts.is_empty() {
            return Err(ConfigError::NoScripts);
        }
        if self.input.is_some() != self.deserialize.is_some() {
            return Err(ConfigError::InputDeserializePairingMismatch);
        }
        if self.serialize.is_some() != self.output.is_some() {
            return Err(ConfigError::SerializeOutputPairingMismatch);
        }
        Ok(())
    }
}

/// The driver's lifecycle state per spec §3. Transitions are linear;
/// cancellation from any non-terminal state routes through `Ending` to
/// `Terminated`. Tracked on the worker thread purely for logging — nothing
/// outside the worker queries it, so a plain field (not an `Arc`) suffices.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DriverState {
    Constructed,
    Validated,
    Awakening,
    Iterating,
    Ending,
    Terminated,
    Failed,
}

/// One step in the driver's fixed awaken/end order.
/// Recorded as each step successfully awakens, so a failure partway through
/// only tears down the steps that actually acquired resources.
enum StepRole {
    Input,
    Deserialize,
    Script(usize),
    Serialize,
    Output,
}

/// Outcome published on the caller's exit signal.
/// Cancellation is "not an error" — it surfaces as `Success`.
pub enum PipelineOutcome {
    Success,
    Failed(PipelineError),
}

/// One-shot result slot the driver publishes to exactly once.
#[derive(Clone)]
struct ExitSignal {
    inner: Arc<(Mutex<Option<PipelineOutcome>>, Condvar)>,
}

impl ExitSignal {
    fn new() -> ExitSignal {
        ExitSignal {
            inner: Arc::new((Mutex::new(None), Condvar::new())),
        }
    }

    fn publish(&self, outcome: PipelineOutcome) {
        let (lock, cvar) = &*self.inner;
        let mut slot = lock.lock().unwrap();
        if slot.is_none() {
            *slot = Some(outcome);
        }
        cvar.notify_all();
    }

    fn wait(&self) -> PipelineOutcome {
        let (lock, cvar) = &*self.inner;
        let mut slot = lock.lock().unwrap();
        while slot.is_none() {
            slot = cvar.wait(slot).unwrap();
        }
        slot.take().unwrap()
    }
}

/// Returned by `Driver::start` once the worker has published *started*.
/// The caller blocks on `wait()` for the final outcome.
pub struct ExitWaiter {
    exit: ExitSignal,
    handle: Option<thread::JoinHandle<()>>,
}

impl ExitWaiter {
    pub fn wait(mut self) -> PipelineOutcome {
        let outcome = self.exit.wait();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        outcome
    }
}

/// The worker thread that owns a `StepSet`'s lifecycle.
pub struct Driver {
    steps: StepSet,
    state: DriverState,
}

impl Driver {
    pub fn new(steps: StepSet) -> Driver {
        Driver {
            steps,
            state: DriverState::Constructed,
        }
    }

    /// Validates on the caller's thread, launches the worker thread, and
    /// blocks up to 5s for it to publish *started*. `cancel` is the caller-supplied cancellation signal; the
    /// returned `ExitWaiter` carries the driver's eventual outcome.
    pub fn start(mut self, cancel: CancelToken) -> Result<ExitWaiter, StartError> {
        self.steps.validate()?;
        self.state = DriverState::Validated;

        let started = CancelToken::new();
        let exit = ExitSignal::new();
        let started_for_worker = started.clone();
        let exit_for_worker = exit.clone();
        let cancel_for_worker = cancel.clone();

        let handle = thread::Builder::new()
            .name("pipeline-driver".into())
            .spawn(move || {
                self.run_worker(cancel_for_worker, started_for_worker, exit_for_worker);
            })
            .expect("failed to spawn the pipeline driver's worker thread");

        if !started.wait_timeout(STARTED_TIMEOUT) {
            cancel.fire();
            return Err(StartError::WorkerStartTimeout(STARTED_TIMEOUT));
        }

        Ok(ExitWaiter {
            exit,
            handle: Some(handle),
        })
    }

    fn step_order(&self) -> Vec<StepRole> {
        let mut order = Vec::with_capacity(2 + self.steps.scripts.len() + 2);
        if self.steps.input.is_some() {
            order.push(StepRole::Input);
        }
        if self.steps.deserialize.is_some() {
            order.push(StepRole::Deserialize);
        }
        for i in 0..self.steps.scripts.len() {
            order.push(StepRole::Script(i));
        }
        if self.steps.serialize.is_some() {
            order.push(StepRole::Serialize);
        }
        if self.steps.output.is_some() {
            order.push(StepRole::Output);
        }
        order
    }

    fn assign_cancel_tokens(&mut self, cancel: &CancelToken) {
        if let Some(input) = &mut self.steps.input {
            input.set_cancel_token(cancel.clone());
        }
        for script in &mut self.steps.scripts {
            script.set_cancel_token(cancel.clone());
        }
        if let Some(output) = &mut self.steps.output {
            output.set_cancel_token(cancel.clone());
        }
    }

    fn awaken_one(&mut self, role: &StepRole) -> Result<(), PipelineError> {
        match role {
            StepRole::Input => self
                .steps
                .input
                .as_mut()
                .expect("Input role recorded without an input step")
                .awaken()
                .map_err(PipelineError::from),
            StepRole::Deserialize => self
                .steps
                .deserialize
                .as_mut()
                .expect("Deserialize role recorded without a deserialize step")
                .awaken()
                .map_err(PipelineError::from),
            StepRole::Script(i) => self.steps.scripts[*i].awaken().map_err(PipelineError::from),
            StepRole::Serialize => self
                .steps
                .serialize
                .as_mut()
                .expect("Serialize role recorded without a serialize step")
                .awaken()
                .map_err(PipelineError::from),
            StepRole::Output => self
                .steps
                .output
                .as_mut()
                .expect("Output role recorded without an output step")
                .awaken()
                .map_err(PipelineError::from),
        }
    }

    /// Calls `end()` on every awakened step in reverse order, swallowing and
    /// logging each step's own error.
    fn end_awakened(&mut self, awakened: &[StepRole]) {
        for role in awakened.iter().rev() {
            match role {
                StepRole::Input => {
                    if let Some(input) = &mut self.steps.input {
                        input.end();
                    }
                }
                StepRole::Deserialize => {
                    if let Some(step) = &mut self.steps.deserialize {
                        step.end();
                    }
                }
                StepRole::Script(i) => self.steps.scripts[*i].end(),
                StepRole::Serialize => {
                    if let Some(step) = &mut self.steps.serialize {
                        step.end();
                    }
                }
                StepRole::Output => {
                    if let Some(output) = &mut self.steps.output {
                        output.end();
                    }
                }
            }
        }
    }

    /// One iteration: `input.receive -> deserialize -> scripts in
    /// order -> serialize -> output.send`, with a cooperative cancellation
    /// check after every stage. Absent steps behave as documented no-ops.
    fn run_iteration(&mut self, cancel: &CancelToken) -> Result<(), PipelineError> {
        let bytes_by_source = match &self.steps.input {
            Some(input) => match input.receive() {
                Ok(bytes) => Some(bytes),
                Err(_) if cancel.is_fired() => return Err(PipelineError::Cancelled),
                Err(e) => return Err(PipelineError::Transport(e)),
            },
            None => None,
        };
        if cancel.is_fired() {
            return Err(PipelineError::Cancelled);
        }

        let mut value: Option<Py<PyAny>> = match (&self.steps.deserialize, bytes_by_source) {
            (Some(step), Some(bytes)) => Some(step.deserialize(bytes)?),
            _ => None,
        };
        if cancel.is_fired() {
            return Err(PipelineError::Cancelled);
        }

        for script in &self.steps.scripts {
            value = Some(script.invoke(value)?);
            if cancel.is_fired() {
                return Err(PipelineError::Cancelled);
            }
        }

        let out_bytes = match (&self.steps.serialize, value) {
            (Some(step), Some(v)) => Some(step.serialize(v)?),
            _ => None,
        };
        if cancel.is_fired() {
            return Err(PipelineError::Cancelled);
        }

        if let Some(output) = &self.steps.output {
            output.send(out_bytes).map_err(PipelineError::Transport)?;
        }
        Ok(())
    }

    /// The worker loop: signal started, assign the cancellation
    /// token, awaken every step in order, iterate until cancelled, end every
    /// awakened step best-effort, and publish the outcome.
    fn run_worker(mut self, cancel: CancelToken, started: CancelToken, exit: ExitSignal) {
        started.fire();
        self.assign_cancel_tokens(&cancel);

        self.state = DriverState::Awakening;
        debug!("Pipeline '{}' entering {:?}", self.steps.name, self.state);
        let order = self.step_order();
        let mut awakened = Vec::with_capacity(order.len());
        let mut awaken_failure = None;
        for role in order {
            match self.awaken_one(&role) {
                Ok(()) => awakened.push(role),
                Err(e) => {
                    awaken_failure = Some(e);
                    break;
                }
            }
        }

        if let Some(e) = awaken_failure {
            // A failure before any step's awaken() succeeded skips ending
            // entirely.
            if !awakened.is_empty() {
                self.state = DriverState::Ending;
                self.end_awakened(&awakened);
            }
            self.state = DriverState::Failed;
            error!(
                "Pipeline '{}' failed during awaken: {}",
                self.steps.name,
                e
            );
            exit.publish(PipelineOutcome::Failed(e));
            return;
        }

        self.state = DriverState::Iterating;
        debug!("Pipeline '{}' entering {:?}", self.steps.name, self.state);
        let mut iteration_failure = None;
        while !cancel.is_fired() {
            if let Err(e) = self.run_iteration(&cancel) {
                if !e.is_cancelled() {
                    iteration_failure = Some(e);
                }
                break;
            }
        }

        self.state = DriverState::Ending;
        self.end_awakened(&awakened);

        self.state = if iteration_failure.is_some() {
            DriverState::Failed
        } else {
            DriverState::Terminated
        };
        match iteration_failure {
            Some(e) => {
                error!(
                    "Pipeline '{}' failed: {} (root cause: {})",
                    self.steps.name,
                    e,
                    e.root_cause()
                );
                exit.publish(PipelineOutcome::Failed(e));
            }
            None => {
                info!("Pipeline '{}' exited cleanly", self.steps.name);
                exit.publish(PipelineOutcome::Success);
            }
        }
    }
}

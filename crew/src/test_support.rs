//! Test-only fakes: a scripted backend, a recording sleeper, and pool builders.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::core::roles::{ActionGate, Role, WorkerPool, default_capabilities};
use crate::core::types::{ActionRequest, Artifact, RoleKind};
use crate::io::backend::{BackendError, BackendRequest, ExecutionBackend};
use crate::retry::{CancelToken, Sleeper};

/// Pool with every role, placeholder instructions and default capabilities.
pub fn sample_pool() -> WorkerPool {
    let roles = RoleKind::ALL
        .into_iter()
        .map(|kind| Role::new(kind, format!("{kind} instructions"), default_capabilities(kind)))
        .collect();
    WorkerPool::new(roles).expect("sample pool is valid")
}

/// One scripted backend call.
#[derive(Debug, Clone)]
pub enum ScriptedStep {
    Fail(BackendError),
    Succeed(Artifact),
    /// Authorize and "execute" each action in order, then succeed.
    Act {
        actions: Vec<ActionRequest>,
        artifact: Artifact,
    },
}

/// Backend that replays scripted steps; the last step repeats once the script runs out.
#[derive(Debug)]
pub struct ScriptedBackend {
    steps: Mutex<VecDeque<ScriptedStep>>,
    calls: AtomicU32,
    executed_actions: AtomicU32,
    requests: Mutex<Vec<BackendRequest>>,
}

impl ScriptedBackend {
    pub fn new(steps: Vec<ScriptedStep>) -> Self {
        assert!(!steps.is_empty(), "scripted backend needs at least one step");
        Self {
            steps: Mutex::new(steps.into()),
            calls: AtomicU32::new(0),
            executed_actions: AtomicU32::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn succeeding(artifact: Artifact) -> Self {
        Self::new(vec![ScriptedStep::Succeed(artifact)])
    }

    pub fn always(error: BackendError) -> Self {
        Self::new(vec![ScriptedStep::Fail(error)])
    }

    /// Fail `failures` times with `error`, then succeed with `artifact`.
    pub fn fails_then_succeeds(failures: usize, error: BackendError, artifact: Artifact) -> Self {
        let mut steps = vec![ScriptedStep::Fail(error); failures];
        steps.push(ScriptedStep::Succeed(artifact));
        Self::new(steps)
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Actions that passed the gate and were "executed".
    pub fn executed_actions(&self) -> u32 {
        self.executed_actions.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<BackendRequest> {
        lock(&self.requests).clone()
    }

    fn next_step(&self) -> ScriptedStep {
        let mut steps = lock(&self.steps);
        if steps.len() > 1 {
            steps.pop_front().expect("non-empty script")
        } else {
            steps.front().cloned().expect("non-empty script")
        }
    }
}

impl ExecutionBackend for ScriptedBackend {
    fn run(
        &self,
        request: &BackendRequest,
        gate: &ActionGate<'_>,
    ) -> Result<Artifact, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.requests).push(request.clone());
        match self.next_step() {
            ScriptedStep::Fail(error) => Err(error),
            ScriptedStep::Succeed(artifact) => Ok(artifact),
            ScriptedStep::Act { actions, artifact } => {
                for action in &actions {
                    gate.authorize(action)?;
                    self.executed_actions.fetch_add(1, Ordering::SeqCst);
                }
                Ok(artifact)
            }
        }
    }
}

/// Sleeper that records requested delays and returns immediately.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    sleeps: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn sleeps(&self) -> Vec<Duration> {
        lock(&self.sleeps).clone()
    }

    pub fn total(&self) -> Duration {
        lock(&self.sleeps).iter().sum()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> bool {
        lock(&self.sleeps).push(duration);
        !cancel.is_cancelled()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

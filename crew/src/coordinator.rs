//! Task coordinator: cache lookup, then retried delegation to the backend.
//!
//! Per call to [`TaskCoordinator::run_task`]:
//!
//! ```text
//! CHECK_CACHE --hit--> DONE(cached)
//!      |
//!     miss
//!      v
//! EXECUTING --success--> cache + DONE(result)
//!      |--exhausted/cancelled--> DONE(failure), nothing cached
//!      '--capability violation--> Err, nothing cached
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument, warn};

use crate::core::cache::ResultCache;
use crate::core::roles::{CapabilityViolation, WorkerPool};
use crate::core::types::{Artifact, PlannerSettings};
use crate::io::backend::{BackendError, BackendRequest, ExecutionBackend};
use crate::retry::{CancelToken, RetryController, RetryError, RetryPolicy, Sleeper, ThreadSleeper};

/// Knobs fixed at coordinator construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorSettings {
    pub retry: RetryPolicy,
    /// Deadline for one backend call.
    pub timeout: Duration,
    pub planner: PlannerSettings,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(30),
            planner: PlannerSettings::default(),
        }
    }
}

/// Terminal state of one `run_task` call.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// Served from the cache; the backend was not called.
    Cached(Arc<Artifact>),
    Completed {
        artifact: Arc<Artifact>,
        attempts: u32,
    },
    /// Every attempt failed.
    Failed { attempts: u32, last_error: String },
    Cancelled { attempts: u32 },
}

impl TaskOutcome {
    pub fn artifact(&self) -> Option<&Arc<Artifact>> {
        match self {
            TaskOutcome::Cached(artifact) | TaskOutcome::Completed { artifact, .. } => {
                Some(artifact)
            }
            TaskOutcome::Failed { .. } | TaskOutcome::Cancelled { .. } => None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.artifact().is_some()
    }

    /// Attempts spent on the backend; zero for cache hits.
    pub fn attempts(&self) -> u32 {
        match self {
            TaskOutcome::Cached(_) => 0,
            TaskOutcome::Completed { attempts, .. }
            | TaskOutcome::Failed { attempts, .. }
            | TaskOutcome::Cancelled { attempts } => *attempts,
        }
    }
}

/// Failures `run_task` reports instead of folding them into a [`TaskOutcome`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    CapabilityViolation(CapabilityViolation),
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::CapabilityViolation(violation) => {
                write!(f, "capability violation: {violation}")
            }
        }
    }
}

impl std::error::Error for DispatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DispatchError::CapabilityViolation(violation) => Some(violation),
        }
    }
}

impl From<CapabilityViolation> for DispatchError {
    fn from(violation: CapabilityViolation) -> Self {
        DispatchError::CapabilityViolation(violation)
    }
}

/// Owns the worker pool, planner settings, a private result cache and the
/// backend, and drives one task at a time per call.
///
/// `run_task` takes `&self`; the cache is the only shared mutable state, so a
/// coordinator with a `Sync` backend may be shared across threads.
pub struct TaskCoordinator<B, S = ThreadSleeper> {
    pool: WorkerPool,
    planner: PlannerSettings,
    timeout: Duration,
    cache: ResultCache,
    retry: RetryController<S>,
    backend: B,
}

impl<B: ExecutionBackend> TaskCoordinator<B, ThreadSleeper> {
    pub fn new(pool: WorkerPool, backend: B, settings: CoordinatorSettings) -> Self {
        Self::with_sleeper(pool, backend, settings, ThreadSleeper::default())
    }
}

impl<B: ExecutionBackend, S: Sleeper> TaskCoordinator<B, S> {
    pub fn with_sleeper(
        pool: WorkerPool,
        backend: B,
        settings: CoordinatorSettings,
        sleeper: S,
    ) -> Self {
        Self {
            pool,
            planner: settings.planner,
            timeout: settings.timeout,
            cache: ResultCache::new(),
            retry: RetryController::with_sleeper(settings.retry, sleeper),
            backend,
        }
    }

    /// Replace the empty cache created by the constructors.
    pub fn with_cache(self, cache: ResultCache) -> Self {
        Self { cache, ..self }
    }

    pub fn with_cancel_token(self, cancel: CancelToken) -> Self {
        Self {
            retry: self.retry.with_cancel_token(cancel),
            ..self
        }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.retry.cancel_token().clone()
    }

    /// Run one task, serving repeated queries from the cache.
    ///
    /// Exhaustion and cancellation are reported through [`TaskOutcome`]; only a
    /// capability violation is returned as `Err`.
    #[instrument(skip_all, fields(query = %query))]
    pub fn run_task(&self, query: &str, description: &str) -> Result<TaskOutcome, DispatchError> {
        if let Some(hit) = self.cache.get(query) {
            info!("returning cached result");
            return Ok(TaskOutcome::Cached(hit));
        }

        let request = self.backend_request(query, description);
        let gate = self.pool.gate();
        let mut attempts = 0u32;
        let result = self.retry.execute(|| {
            attempts += 1;
            self.backend.run(&request, &gate)
        });

        match result {
            Ok(artifact) => {
                let artifact = Arc::new(artifact);
                self.cache.put(query, Arc::clone(&artifact));
                info!(attempts, "task completed");
                Ok(TaskOutcome::Completed { artifact, attempts })
            }
            Err(RetryError::Exhausted { attempts, last }) => {
                warn!(attempts, error = %last, "task failed, retries exhausted");
                Ok(TaskOutcome::Failed {
                    attempts,
                    last_error: last.to_string(),
                })
            }
            Err(RetryError::Cancelled { attempts }) => {
                info!(attempts, "task cancelled");
                Ok(TaskOutcome::Cancelled { attempts })
            }
            Err(RetryError::Fatal { attempt, error }) => match error {
                BackendError::CapabilityViolation(violation) => {
                    warn!(attempt, %violation, "task aborted on capability violation");
                    Err(violation.into())
                }
                other => Ok(TaskOutcome::Failed {
                    attempts: attempt,
                    last_error: other.to_string(),
                }),
            },
        }
    }

    fn backend_request(&self, query: &str, description: &str) -> BackendRequest {
        BackendRequest {
            query: query.to_string(),
            description: description.to_string(),
            planner: self.planner,
            timeout: self.timeout,
            workers: self.pool.roles().to_vec(),
        }
    }
}

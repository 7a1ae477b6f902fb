//! Resilient task dispatch for a coordinator and its capability-scoped workers.
//!
//! A [`coordinator::TaskCoordinator`] answers each task from its result cache or
//! delegates it to an execution backend under bounded, exponentially backed-off
//! retries. Every worker action the backend performs must clear the capability
//! gate of the worker pool first. The crate keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (cache, backoff arithmetic, roles and
//!   the capability gate). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (config file, child processes, the
//!   command backend, instruction templates).
//!
//! Orchestration modules ([`retry`], [`coordinator`]) compose core logic with I/O
//! behind traits so tests can substitute scripted fakes.

pub mod coordinator;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod retry;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

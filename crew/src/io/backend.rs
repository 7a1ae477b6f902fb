//! Execution backend abstraction.
//!
//! The [`ExecutionBackend`] trait decouples the coordinator from whatever plans
//! a task and runs worker actions. [`CommandBackend`] spawns an external program;
//! tests use scripted backends that fail on demand without spawning anything.

use std::fmt;
use std::path::PathBuf;
use std::process::Command;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use jsonschema::{Draft, Validator};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::roles::{ActionGate, CapabilityViolation, Role};
use crate::core::types::{ActionRequest, Artifact, PlannerSettings};
use crate::io::config::BackendConfig;
use crate::io::process::run_with_deadline;
use crate::retry::Retryable;

const BACKEND_OUTPUT_SCHEMA: &str = include_str!("../../schemas/backend_output.schema.json");

static OUTPUT_VALIDATOR: LazyLock<Result<Validator, String>> = LazyLock::new(|| {
    let schema: Value = serde_json::from_str(BACKEND_OUTPUT_SCHEMA)
        .map_err(|err| format!("parse backend output schema: {err}"))?;
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .map_err(|err| format!("compile backend output schema: {err}"))
});

/// Everything a backend needs to carry out one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendRequest {
    pub query: String,
    pub description: String,
    pub planner: PlannerSettings,
    /// Deadline for a single call; backends report overruns as [`BackendError::Timeout`].
    #[serde(rename = "timeout_secs", serialize_with = "serialize_secs")]
    pub timeout: Duration,
    pub workers: Vec<Role>,
}

fn serialize_secs<S: serde::Serializer>(
    timeout: &Duration,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(timeout.as_secs_f64())
}

/// Failure of one backend call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The call outlived its deadline.
    Timeout(Duration),
    /// Any other transient failure.
    Failed(String),
    /// The backend attempted an action a worker was not granted.
    CapabilityViolation(CapabilityViolation),
}

impl BackendError {
    pub fn failed(message: impl fmt::Display) -> Self {
        BackendError::Failed(message.to_string())
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Timeout(after) => write!(f, "backend timed out after {after:?}"),
            BackendError::Failed(message) => f.write_str(message),
            BackendError::CapabilityViolation(violation) => violation.fmt(f),
        }
    }
}

impl std::error::Error for BackendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BackendError::CapabilityViolation(violation) => Some(violation),
            _ => None,
        }
    }
}

impl From<CapabilityViolation> for BackendError {
    fn from(violation: CapabilityViolation) -> Self {
        BackendError::CapabilityViolation(violation)
    }
}

impl Retryable for BackendError {
    fn is_timeout(&self) -> bool {
        matches!(self, BackendError::Timeout(_))
    }

    fn is_fatal(&self) -> bool {
        matches!(self, BackendError::CapabilityViolation(_))
    }
}

/// Abstraction over planning/execution backends.
///
/// Only backends that run actions in-process can stop an unauthorized action
/// before it executes. Backends that delegate to another process, such as
/// [`CommandBackend`], can only audit the actions it reports afterwards; a
/// violation then discards the artifact but cannot undo the action.
pub trait ExecutionBackend {
    /// Carry out `request`. Every worker action must pass `gate` before it runs.
    fn run(
        &self,
        request: &BackendRequest,
        gate: &ActionGate<'_>,
    ) -> Result<Artifact, BackendError>;
}

impl<B: ExecutionBackend + ?Sized> ExecutionBackend for &B {
    fn run(
        &self,
        request: &BackendRequest,
        gate: &ActionGate<'_>,
    ) -> Result<Artifact, BackendError> {
        (**self).run(request, gate)
    }
}

/// Backend output as written to stdout by the external program.
#[derive(Debug, Deserialize)]
struct BackendResponse {
    artifact: Artifact,
    #[serde(default)]
    actions: Vec<ActionRequest>,
}

/// Backend that spawns an external program per call.
///
/// The request is written to stdin as JSON; the program answers on stdout with
/// `{"artifact": ..., "actions": [...]}`. The program runs its own actions, so
/// the gate can only audit the reported ones afterwards: any unauthorized action
/// discards the artifact and fails the call.
#[derive(Debug, Clone)]
pub struct CommandBackend {
    program: String,
    args: Vec<String>,
    workdir: Option<PathBuf>,
    env: Vec<(String, String)>,
    output_limit_bytes: usize,
}

impl CommandBackend {
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = String>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().collect(),
            workdir: None,
            env: Vec::new(),
            output_limit_bytes: BackendConfig::default().output_limit_bytes,
        }
    }

    /// Build from config. `env` holds the variables resolved at startup.
    pub fn from_config(config: &BackendConfig, env: Vec<(String, String)>) -> Result<Self> {
        let (program, args) = config
            .command
            .split_first()
            .ok_or_else(|| anyhow!("backend.command must be a non-empty array"))?;
        let mut backend = Self::new(program.clone(), args.iter().cloned())
            .with_env(env)
            .with_output_limit(config.output_limit_bytes);
        if let Some(dir) = &config.workdir {
            backend = backend.with_workdir(dir.clone());
        }
        Ok(backend)
    }

    pub fn with_workdir(self, workdir: PathBuf) -> Self {
        Self {
            workdir: Some(workdir),
            ..self
        }
    }

    pub fn with_env(self, env: Vec<(String, String)>) -> Self {
        Self { env, ..self }
    }

    pub fn with_output_limit(self, output_limit_bytes: usize) -> Self {
        Self {
            output_limit_bytes,
            ..self
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd.envs(self.env.iter().map(|(k, v)| (k, v)));
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

impl ExecutionBackend for CommandBackend {
    #[instrument(skip_all, fields(program = %self.program, timeout_secs = request.timeout.as_secs()))]
    fn run(
        &self,
        request: &BackendRequest,
        gate: &ActionGate<'_>,
    ) -> Result<Artifact, BackendError> {
        info!(workers = request.workers.len(), "starting backend");
        let payload = serde_json::to_vec(request)
            .map_err(|err| BackendError::failed(format!("serialize backend request: {err}")))?;

        let output = run_with_deadline(
            self.command(),
            Some(payload),
            request.timeout,
            self.output_limit_bytes,
        )
        .with_context(|| format!("run backend {}", self.program))
        .map_err(|err| BackendError::failed(format!("{err:#}")))?;

        if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs_f64(), "backend timed out");
            return Err(BackendError::Timeout(request.timeout));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "backend failed");
            return Err(BackendError::Failed(format!(
                "backend exited with status {:?}: {}",
                output.status.code(),
                output.stderr_tail(500)
            )));
        }
        if output.stdout_truncated > 0 {
            return Err(BackendError::Failed(format!(
                "backend output exceeded {} bytes",
                self.output_limit_bytes
            )));
        }

        let response = parse_response(&output.stdout)?;
        for action in &response.actions {
            if let Err(violation) = gate.authorize(action) {
                warn!(%violation, "backend reported an unauthorized action");
                return Err(violation.into());
            }
        }

        debug!(actions = response.actions.len(), "backend completed successfully");
        Ok(response.artifact)
    }
}

fn parse_response(stdout: &[u8]) -> Result<BackendResponse, BackendError> {
    let value: Value = serde_json::from_slice(stdout)
        .map_err(|err| BackendError::failed(format!("parse backend output: {err}")))?;
    validate_output(&value)?;
    serde_json::from_value(value)
        .map_err(|err| BackendError::failed(format!("decode backend output: {err}")))
}

/// Validate backend output against the embedded JSON Schema (Draft 2020-12).
fn validate_output(instance: &Value) -> Result<(), BackendError> {
    let validator = OUTPUT_VALIDATOR.as_ref().map_err(BackendError::failed)?;
    let messages: Vec<String> = validator
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(BackendError::Failed(format!(
            "backend output failed schema validation:\n- {}",
            messages.join("\n- ")
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::roles::{WorkerPool, default_capabilities};
    use crate::core::types::RoleKind;
    use serde_json::json;

    fn pool() -> WorkerPool {
        let roles = RoleKind::ALL
            .into_iter()
            .map(|kind| Role::new(kind, "do work", default_capabilities(kind)))
            .collect();
        WorkerPool::new(roles).expect("pool")
    }

    fn request(pool: &WorkerPool, timeout: Duration) -> BackendRequest {
        BackendRequest {
            query: "Write a research proposal".to_string(),
            description: "GenAI use cases".to_string(),
            planner: PlannerSettings::default(),
            timeout,
            workers: pool.roles().to_vec(),
        }
    }

    fn sh(script: &str) -> CommandBackend {
        CommandBackend::new("sh", ["-c".to_string(), script.to_string()])
    }

    #[test]
    fn request_serializes_workers_and_timeout() {
        let pool = pool();
        let value = serde_json::to_value(request(&pool, Duration::from_secs(30))).expect("json");

        assert_eq!(value["timeout_secs"], json!(30.0));
        assert_eq!(value["planner"], json!({"human_intervene": false}));
        assert_eq!(
            value["workers"][3],
            json!({
                "role": "reviewer",
                "instructions": "do work",
                "capabilities": ["web_page_context", "write_file"]
            })
        );
    }

    #[test]
    fn parse_response_rejects_missing_artifact() {
        let err = parse_response(br#"{"actions": []}"#).unwrap_err();
        assert!(err.to_string().contains("schema validation"));
    }

    #[test]
    fn parse_response_rejects_unknown_action_kind() {
        let raw = br#"{"artifact": "x", "actions": [{"role": "writer", "action": {"kind": "launch"}}]}"#;
        assert!(matches!(parse_response(raw), Err(BackendError::Failed(_))));
    }

    #[test]
    fn backend_error_classification() {
        assert!(BackendError::Timeout(Duration::from_secs(1)).is_timeout());
        assert!(!BackendError::failed("boom").is_fatal());
        let violation = CapabilityViolation {
            role: RoleKind::Writer,
            action: crate::core::types::Action::WriteFile {
                path: "x".to_string(),
            },
            declared: None,
        };
        assert!(BackendError::from(violation).is_fatal());
    }

    #[cfg(unix)]
    mod process {
        use super::*;

        #[test]
        fn returns_artifact_from_stdout() {
            let pool = pool();
            let backend = sh(r#"cat >/dev/null; printf '{"artifact": "proposal"}'"#);

            let artifact = backend
                .run(&request(&pool, Duration::from_secs(5)), &pool.gate())
                .expect("run");
            assert_eq!(artifact, Artifact::text("proposal"));
        }

        #[test]
        fn backend_receives_request_on_stdin() {
            let pool = pool();
            let backend = sh(r#"printf '{"artifact": %s}' "$(cat)""#);

            let artifact = backend
                .run(&request(&pool, Duration::from_secs(5)), &pool.gate())
                .expect("run");
            assert_eq!(
                artifact.as_value()["query"],
                json!("Write a research proposal")
            );
        }

        #[test]
        fn forwards_configured_env() {
            let pool = pool();
            let backend = sh(r#"cat >/dev/null; printf '{"artifact": "%s"}' "$CREW_TEST_TOKEN""#)
                .with_env(vec![("CREW_TEST_TOKEN".to_string(), "t0k".to_string())]);

            let artifact = backend
                .run(&request(&pool, Duration::from_secs(5)), &pool.gate())
                .expect("run");
            assert_eq!(artifact, Artifact::text("t0k"));
        }

        #[test]
        fn non_zero_exit_is_transient_failure() {
            let pool = pool();
            let backend = sh("cat >/dev/null; echo rate limited >&2; exit 1");

            let err = backend
                .run(&request(&pool, Duration::from_secs(5)), &pool.gate())
                .unwrap_err();
            assert!(matches!(&err, BackendError::Failed(msg) if msg.contains("rate limited")));
            assert!(!err.is_fatal());
        }

        #[test]
        fn deadline_overrun_is_timeout() {
            let pool = pool();
            let backend = sh("exec sleep 5");

            let err = backend
                .run(&request(&pool, Duration::from_millis(200)), &pool.gate())
                .unwrap_err();
            assert_eq!(err, BackendError::Timeout(Duration::from_millis(200)));
        }

        #[test]
        fn deadline_holds_for_script_backends() {
            let pool = pool();
            let backend = sh(r#"cat >/dev/null; sleep 3; printf '{"artifact": "late"}'"#);
            let start = std::time::Instant::now();

            let err = backend
                .run(&request(&pool, Duration::from_millis(200)), &pool.gate())
                .unwrap_err();
            assert_eq!(err, BackendError::Timeout(Duration::from_millis(200)));
            assert!(start.elapsed() < Duration::from_millis(1500));
        }

        #[test]
        fn invalid_json_is_transient_failure() {
            let pool = pool();
            let backend = sh("cat >/dev/null; echo not json");

            let err = backend
                .run(&request(&pool, Duration::from_secs(5)), &pool.gate())
                .unwrap_err();
            assert!(err.to_string().contains("parse backend output"));
        }

        #[test]
        fn unauthorized_reported_action_is_violation() {
            let pool = pool();
            let backend = sh(
                r#"cat >/dev/null; printf '{"artifact": "x", "actions": [{"role": "writer", "action": {"kind": "write_file", "path": "out.pdf"}}]}'"#,
            );

            let err = backend
                .run(&request(&pool, Duration::from_secs(5)), &pool.gate())
                .unwrap_err();
            match err {
                BackendError::CapabilityViolation(violation) => {
                    assert_eq!(violation.role, RoleKind::Writer);
                }
                other => panic!("expected violation, got {other}"),
            }
        }

        #[test]
        fn audit_runs_after_the_child_acted() {
            let temp = tempfile::tempdir().expect("tempdir");
            let pool = pool();
            let backend = sh(
                r#"cat >/dev/null; touch out.pdf; printf '{"artifact": "x", "actions": [{"role": "writer", "action": {"kind": "write_file", "path": "out.pdf"}}]}'"#,
            )
            .with_workdir(temp.path().to_path_buf());

            let err = backend
                .run(&request(&pool, Duration::from_secs(5)), &pool.gate())
                .unwrap_err();
            assert!(matches!(err, BackendError::CapabilityViolation(_)));
            assert!(temp.path().join("out.pdf").exists());
        }

        #[test]
        fn authorized_reported_actions_pass_audit() {
            let pool = pool();
            let backend = sh(
                r#"cat >/dev/null; printf '{"artifact": "x", "actions": [{"role": "reviewer", "action": {"kind": "write_file", "path": "out.pdf"}}]}'"#,
            );

            let artifact = backend
                .run(&request(&pool, Duration::from_secs(5)), &pool.gate())
                .expect("run");
            assert_eq!(artifact, Artifact::text("x"));
        }

        #[test]
        fn missing_program_is_transient_failure() {
            let pool = pool();
            let backend = CommandBackend::new("crew-definitely-missing-backend", Vec::new());

            let err = backend
                .run(&request(&pool, Duration::from_secs(5)), &pool.gate())
                .unwrap_err();
            assert!(err.to_string().contains("spawn command"));
        }
    }
}

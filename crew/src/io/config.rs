//! Crew configuration stored in `crew.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::coordinator::CoordinatorSettings;
use crate::core::invariants::validate_pool_invariants;
use crate::core::roles::{Role, WorkerPool, default_capabilities};
use crate::core::types::{Capability, PlannerSettings, RoleKind};
use crate::io::prompt::{TemplateVars, render_instructions};
use crate::retry::RetryPolicy;

/// Default config file name, resolved against the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "crew.toml";

static ENV_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid env name regex"));

/// Crew configuration (TOML).
///
/// Intended to be edited by humans. Missing fields default to the values of
/// the stock research-and-writing crew.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CrewConfig {
    /// Per-attempt deadline for one backend call, in seconds.
    pub timeout_secs: u64,

    pub retry: RetryConfig,

    pub planner: PlannerSettings,

    pub backend: BackendConfig,

    pub workers: Vec<WorkerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per task, including the first.
    pub max_attempts: u32,
    /// Delay after failed attempt `n` is `backoff_base^n` units.
    pub backoff_base: u32,
    /// Length of one backoff unit in milliseconds.
    pub backoff_unit_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BackendConfig {
    /// Program and arguments of the execution backend (e.g. `["crew-backend", "--json"]`).
    pub command: Vec<String>,

    /// Working directory for the backend; holds any context it persists between runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workdir: Option<PathBuf>,

    /// Environment variables read once at startup and forwarded to the backend.
    pub pass_env: Vec<String>,

    /// Keep at most this many bytes of backend stdout/stderr.
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerConfig {
    pub role: RoleKind,
    /// Instruction template; may reference `--var` values such as `{{ subject }}`.
    #[serde(default)]
    pub instructions: String,
    pub capabilities: Vec<Capability>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base: 2,
            backoff_unit_ms: 1_000,
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            command: vec!["crew-backend".to_string()],
            workdir: None,
            pass_env: vec!["OPENAI_API_KEY".to_string(), "TAVILY_API_KEY".to_string()],
            output_limit_bytes: 1_000_000,
        }
    }
}

impl Default for CrewConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            retry: RetryConfig::default(),
            planner: PlannerSettings::default(),
            backend: BackendConfig::default(),
            workers: RoleKind::ALL.into_iter().map(default_worker).collect(),
        }
    }
}

fn default_worker(role: RoleKind) -> WorkerConfig {
    let instructions = match role {
        RoleKind::Admin => "",
        RoleKind::Researcher => {
            "Research the industry of {{ subject }}. Identify the key offerings and \
             strategic focus areas of {{ subject }}. Only the top 5 results."
        }
        RoleKind::Writer => {
            "Analyze trends and standards in the sector of {{ subject }} related to AI, ML, \
             and automation. Propose relevant use cases for AI and ML in {{ subject }}. \
             Only the top 5 results."
        }
        RoleKind::Reviewer => "Review the content in a presentation-friendly format.",
    };
    WorkerConfig {
        role,
        instructions: instructions.to_string(),
        capabilities: default_capabilities(role),
    }
}

impl CrewConfig {
    pub fn validate(&self) -> Result<()> {
        if self.timeout_secs == 0 {
            return Err(anyhow!("timeout_secs must be > 0"));
        }
        if self.retry.max_attempts == 0 {
            return Err(anyhow!("retry.max_attempts must be > 0"));
        }
        if self.retry.backoff_base == 0 {
            return Err(anyhow!("retry.backoff_base must be > 0"));
        }
        if self.backend.output_limit_bytes == 0 {
            return Err(anyhow!("backend.output_limit_bytes must be > 0"));
        }
        if self.backend.command.is_empty() || self.backend.command[0].trim().is_empty() {
            return Err(anyhow!("backend.command must be a non-empty array"));
        }
        if let Some(name) = self
            .backend
            .pass_env
            .iter()
            .find(|name| !ENV_NAME_RE.is_match(name))
        {
            return Err(anyhow!(
                "backend.pass_env entry '{name}' is not a valid environment variable name"
            ));
        }
        let errors = validate_pool_invariants(&self.raw_roles());
        if !errors.is_empty() {
            return Err(anyhow!("invalid workers:\n- {}", errors.join("\n- ")));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry.max_attempts, self.retry.backoff_base)
            .with_unit(Duration::from_millis(self.retry.backoff_unit_ms))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            retry: self.retry_policy(),
            timeout: self.timeout(),
            planner: self.planner,
        }
    }

    /// Build the worker pool, rendering each instruction template against `vars`.
    pub fn worker_pool(&self, vars: &TemplateVars) -> Result<WorkerPool> {
        let roles = self
            .workers
            .iter()
            .map(|worker| {
                let instructions = render_instructions(&worker.instructions, vars)
                    .with_context(|| format!("instructions for {}", worker.role))?;
                Ok(Role::new(
                    worker.role,
                    instructions,
                    worker.capabilities.iter().copied(),
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        WorkerPool::new(roles)
    }

    /// Roles with unrendered instructions, for invariant checks and listings.
    pub fn raw_roles(&self) -> Vec<Role> {
        self.workers
            .iter()
            .map(|worker| {
                Role::new(
                    worker.role,
                    worker.instructions.clone(),
                    worker.capabilities.iter().copied(),
                )
            })
            .collect()
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `CrewConfig::default()`.
pub fn load_config(path: &Path) -> Result<CrewConfig> {
    if !path.exists() {
        let cfg = CrewConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: CrewConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &CrewConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

//! Worker roles, the worker pool, and the capability gate at the dispatch boundary.
//!
//! Roles are fixed when the pool is built. Whatever executes on behalf of a
//! worker must pass each action through [`ActionGate::authorize`] first; the gate
//! rejects any action whose capability the acting role did not declare.

use std::fmt;

use anyhow::{Result, bail};
use serde::Serialize;

use crate::core::invariants::validate_pool_invariants;
use crate::core::types::{Action, ActionRequest, Capability, RoleKind};

/// Immutable worker identity: role, instruction text, ordered capability set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Role {
    #[serde(rename = "role")]
    kind: RoleKind,
    instructions: String,
    capabilities: Vec<Capability>,
}

impl Role {
    pub fn new(
        kind: RoleKind,
        instructions: impl Into<String>,
        capabilities: impl IntoIterator<Item = Capability>,
    ) -> Self {
        Self {
            kind,
            instructions: instructions.into(),
            capabilities: capabilities.into_iter().collect(),
        }
    }

    pub fn kind(&self) -> RoleKind {
        self.kind
    }

    pub fn instructions(&self) -> &str {
        &self.instructions
    }

    pub fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    pub fn allows(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// Capabilities granted to each role in the default research-and-writing crew.
pub fn default_capabilities(kind: RoleKind) -> Vec<Capability> {
    match kind {
        RoleKind::Admin => vec![Capability::WebSearchQa],
        RoleKind::Researcher | RoleKind::Writer => {
            vec![Capability::WebSearchQa, Capability::WebPageContext]
        }
        RoleKind::Reviewer => vec![Capability::WebPageContext, Capability::WriteFile],
    }
}

/// Fixed set of workers owned by a coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPool {
    roles: Vec<Role>,
}

impl WorkerPool {
    /// Build a pool, rejecting duplicate roles and malformed capability sets.
    pub fn new(roles: Vec<Role>) -> Result<Self> {
        let errors = validate_pool_invariants(&roles);
        if !errors.is_empty() {
            bail!("invalid worker pool:\n- {}", errors.join("\n- "));
        }
        Ok(Self { roles })
    }

    pub fn role(&self, kind: RoleKind) -> Option<&Role> {
        self.roles.iter().find(|role| role.kind == kind)
    }

    /// Workers in construction order.
    pub fn roles(&self) -> &[Role] {
        &self.roles
    }

    pub fn gate(&self) -> ActionGate<'_> {
        ActionGate { pool: self }
    }
}

/// An action was attempted outside the acting worker's declared capability set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityViolation {
    pub role: RoleKind,
    pub action: Action,
    /// Capabilities the role declared; `None` when the pool has no such worker.
    pub declared: Option<Vec<Capability>>,
}

impl fmt::Display for CapabilityViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let needed = self.action.capability();
        match &self.declared {
            Some(declared) => {
                let names: Vec<&str> = declared.iter().map(|cap| cap.as_str()).collect();
                write!(
                    f,
                    "worker '{}' attempted '{needed}' outside its capability set [{}]",
                    self.role,
                    names.join(", ")
                )
            }
            None => write!(
                f,
                "no worker with role '{}' may attempt '{needed}'",
                self.role
            ),
        }
    }
}

impl std::error::Error for CapabilityViolation {}

/// Authorization check between the coordinator and whatever executes actions.
#[derive(Debug, Clone, Copy)]
pub struct ActionGate<'a> {
    pool: &'a WorkerPool,
}

impl ActionGate<'_> {
    /// Allow `request` only if its role exists and declared the needed capability.
    pub fn authorize(&self, request: &ActionRequest) -> Result<(), CapabilityViolation> {
        let needed = request.action.capability();
        match self.pool.role(request.role) {
            Some(role) if role.allows(needed) => Ok(()),
            Some(role) => Err(CapabilityViolation {
                role: request.role,
                action: request.action.clone(),
                declared: Some(role.capabilities.clone()),
            }),
            None => Err(CapabilityViolation {
                role: request.role,
                action: request.action.clone(),
                declared: None,
            }),
        }
    }
}

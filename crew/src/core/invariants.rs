//! Worker pool invariants checked at construction time.

use std::collections::HashSet;

use crate::core::roles::Role;

/// Check invariants a worker pool must satisfy:
/// - At most one worker per role
/// - Every worker declares at least one capability
/// - No capability is listed twice for the same worker
pub fn validate_pool_invariants(roles: &[Role]) -> Vec<String> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();

    for role in roles {
        let kind = role.kind();
        if !seen.insert(kind) {
            errors.push(format!("duplicate worker for role '{kind}'"));
        }

        if role.capabilities().is_empty() {
            errors.push(format!("{kind}: capability set must not be empty"));
        }

        let mut caps = HashSet::new();
        for cap in role.capabilities() {
            if !caps.insert(*cap) {
                errors.push(format!("{kind}: capability '{cap}' listed more than once"));
            }
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Capability, RoleKind};

    #[test]
    fn valid_pool_has_no_errors() {
        let roles = vec![
            Role::new(RoleKind::Admin, "", [Capability::WebSearchQa]),
            Role::new(RoleKind::Writer, "write", [Capability::WebSearchQa]),
        ];
        assert!(validate_pool_invariants(&roles).is_empty());
    }

    #[test]
    fn reports_every_violation() {
        let roles = vec![
            Role::new(RoleKind::Writer, "a", [Capability::WriteFile]),
            Role::new(
                RoleKind::Writer,
                "b",
                [Capability::NewsSearch, Capability::NewsSearch],
            ),
            Role::new(RoleKind::Reviewer, "c", []),
        ];

        let errors = validate_pool_invariants(&roles);
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().any(|err| err.contains("duplicate worker")));
        assert!(errors.iter().any(|err| err.contains("listed more than once")));
        assert!(errors.iter().any(|err| err.contains("must not be empty")));
    }
}

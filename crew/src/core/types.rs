//! Shared types for the dispatch core.
//!
//! These types define the contracts between the coordinator, its workers and the
//! execution backend. They carry no I/O and serialize to stable snake_case names.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Worker identity within a crew.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleKind {
    Admin,
    Researcher,
    Writer,
    Reviewer,
}

impl RoleKind {
    pub const ALL: [RoleKind; 4] = [
        RoleKind::Admin,
        RoleKind::Researcher,
        RoleKind::Writer,
        RoleKind::Reviewer,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RoleKind::Admin => "admin",
            RoleKind::Researcher => "researcher",
            RoleKind::Writer => "writer",
            RoleKind::Reviewer => "reviewer",
        }
    }
}

impl fmt::Display for RoleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier of an externally implemented action a worker may be granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Question-answering web search.
    WebSearchQa,
    NewsSearch,
    /// Fetch the readable content of a web page.
    WebPageContext,
    WriteFile,
}

impl Capability {
    pub fn as_str(self) -> &'static str {
        match self {
            Capability::WebSearchQa => "web_search_qa",
            Capability::NewsSearch => "news_search",
            Capability::WebPageContext => "web_page_context",
            Capability::WriteFile => "write_file",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A concrete action a worker wants to run, tagged by `kind` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    WebSearchQa { query: String },
    NewsSearch { query: String },
    WebPageContext { url: String },
    WriteFile { path: String },
}

impl Action {
    /// Capability the action requires.
    pub fn capability(&self) -> Capability {
        match self {
            Action::WebSearchQa { .. } => Capability::WebSearchQa,
            Action::NewsSearch { .. } => Capability::NewsSearch,
            Action::WebPageContext { .. } => Capability::WebPageContext,
            Action::WriteFile { .. } => Capability::WriteFile,
        }
    }
}

/// An action attributed to the worker that would execute it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub role: RoleKind,
    pub action: Action,
}

impl ActionRequest {
    pub fn new(role: RoleKind, action: Action) -> Self {
        Self { role, action }
    }
}

/// Opaque result produced by the execution backend.
///
/// The coordinator never inspects the payload; it only caches and returns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Artifact(Value);

impl Artifact {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self(Value::String(text.into()))
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Value::String(text) => f.write_str(text),
            other => {
                let pretty = serde_json::to_string_pretty(other).map_err(|_| fmt::Error)?;
                f.write_str(&pretty)
            }
        }
    }
}

/// Planning knobs handed through to the backend unchanged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerSettings {
    /// Pause for human confirmation between planned subtasks.
    pub human_intervene: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn action_serializes_with_kind_tag() {
        let request = ActionRequest::new(
            RoleKind::Reviewer,
            Action::WriteFile {
                path: "proposal.pdf".to_string(),
            },
        );
        let value = serde_json::to_value(&request).expect("serialize");
        assert_eq!(
            value,
            json!({"role": "reviewer", "action": {"kind": "write_file", "path": "proposal.pdf"}})
        );
    }

    #[test]
    fn action_maps_to_required_capability() {
        let action = Action::WebPageContext {
            url: "https://example.com".to_string(),
        };
        assert_eq!(action.capability(), Capability::WebPageContext);
        assert_eq!(action.capability().as_str(), "web_page_context");
    }

    #[test]
    fn artifact_displays_text_verbatim_and_json_pretty() {
        assert_eq!(Artifact::text("done").to_string(), "done");
        let structured = Artifact::new(json!({"title": "x"}));
        assert_eq!(structured.to_string(), "{\n  \"title\": \"x\"\n}");
    }
}

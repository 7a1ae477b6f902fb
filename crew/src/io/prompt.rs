//! Rendering of worker instruction templates.
//!
//! Instructions in `crew.toml` may reference variables such as `{{ subject }}`.
//! They are rendered once, when the worker pool is built; unknown variables are
//! an error rather than silently empty.

use std::collections::BTreeMap;

use anyhow::{Context, Result, bail};
use minijinja::{Environment, UndefinedBehavior};

/// Variables available to instruction templates.
pub type TemplateVars = BTreeMap<String, String>;

/// Render one instruction template against `vars`.
pub fn render_instructions(template: &str, vars: &TemplateVars) -> Result<String> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.add_template("instructions", template)
        .context("parse instruction template")?;
    let rendered = env
        .get_template("instructions")?
        .render(vars)
        .context("render instruction template")?;
    Ok(rendered.trim().to_string())
}

/// Parse a `key=value` pair as given on the command line.
pub fn parse_var(raw: &str) -> Result<(String, String)> {
    let Some((key, value)) = raw.split_once('=') else {
        bail!("expected key=value, got '{raw}'");
    };
    let key = key.trim();
    if key.is_empty() {
        bail!("variable name must not be empty in '{raw}'");
    }
    Ok((key.to_string(), value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> TemplateVars {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn renders_variables() {
        let rendered = render_instructions(
            "Research the industry of {{ subject }}.",
            &vars(&[("subject", "Acme")]),
        )
        .expect("render");
        assert_eq!(rendered, "Research the industry of Acme.");
    }

    #[test]
    fn plain_text_passes_through() {
        let rendered = render_instructions("  Review the content.\n", &TemplateVars::new())
            .expect("render");
        assert_eq!(rendered, "Review the content.");
    }

    #[test]
    fn missing_variable_is_an_error() {
        let err = render_instructions("About {{ subject }}", &TemplateVars::new()).unwrap_err();
        assert!(format!("{err:#}").contains("render instruction template"));
    }

    #[test]
    fn parse_var_splits_on_first_equals() {
        assert_eq!(
            parse_var("subject=A=B").expect("parse"),
            ("subject".to_string(), "A=B".to_string())
        );
        assert!(parse_var("subject").is_err());
        assert!(parse_var("=x").is_err());
    }
}

//! `{name}` placeholder substitution for step arguments and output paths.

use crate::errors::PrintlineError;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;

/// Variables available to step templates.
pub type TemplateVars = BTreeMap<String, String>;

#[allow(clippy::expect_used)]
static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder pattern is valid"));

/// Returns the placeholder names referenced by a template, in order of
/// first appearance.
#[must_use]
pub fn placeholders(template: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for caps in PLACEHOLDER.captures_iter(template) {
        let name = &caps[1];
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
    }
    names
}

/// Substitutes every `{name}` in `template` from `vars`.
///
/// Braces that do not enclose an identifier are left untouched, so JSON
/// payloads pass through unchanged.
///
/// # Errors
///
/// Returns `PrintlineError::Validation` naming the first unresolved
/// placeholder.
pub fn render(template: &str, vars: &TemplateVars) -> Result<String, PrintlineError> {
    if let Some(missing) = placeholders(template)
        .into_iter()
        .find(|name| !vars.contains_key(name))
    {
        return Err(PrintlineError::Validation(format!(
            "template '{template}' references unknown variable '{missing}'"
        )));
    }

    let rendered = PLACEHOLDER.replace_all(template, |caps: &regex::Captures<'_>| {
        vars.get(&caps[1]).cloned().unwrap_or_default()
    });
    Ok(rendered.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> TemplateVars {
        TemplateVars::from([
            ("project_name".to_string(), "owl".to_string()),
            ("models_dir".to_string(), "/data/models".to_string()),
        ])
    }

    #[test]
    fn test_render_substitutes() {
        let out = render("{models_dir}/{project_name}_decimated.stl", &vars()).unwrap();
        assert_eq!(out, "/data/models/owl_decimated.stl");
    }

    #[test]
    fn test_render_missing_variable() {
        let err = render("{models_dir}/{ratio}", &vars()).unwrap_err();
        assert!(err.to_string().contains("'ratio'"));
    }

    #[test]
    fn test_json_braces_pass_through() {
        let payload = r#"{"print":{"command":"project_file","subtask_name":"{project_name}"}}"#;
        let out = render(payload, &vars()).unwrap();
        assert_eq!(
            out,
            r#"{"print":{"command":"project_file","subtask_name":"owl"}}"#
        );
    }

    #[test]
    fn test_placeholders_deduplicated() {
        let names = placeholders("{a}-{b}-{a}");
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }
}

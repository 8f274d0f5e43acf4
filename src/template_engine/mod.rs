use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::error::{AppError, AppResult};

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{\{\.([A-Za-z_][A-Za-z0-9_]*)\}\}").unwrap());

/// Returns every distinct placeholder name referenced in `text`.
fn placeholders_in(text: &str) -> Vec<String> {
    let mut names: Vec<String> = PLACEHOLDER
        .captures_iter(text)
        .map(|c| c[1].to_string())
        .collect();
    names.sort();
    names.dedup();
    names
}

/// Validates that every `{{.Name}}` placeholder in subject/body appears in
/// `variables`. Called at template creation time.
pub fn validate(subject: Option<&str>, body: &str, variables: &[String]) -> AppResult<()> {
    let declared: std::collections::HashSet<&str> = variables.iter().map(|s| s.as_str()).collect();

    let mut found = placeholders_in(body);
    if let Some(s) = subject {
        found.extend(placeholders_in(s));
    }
    found.sort();
    found.dedup();

    let missing: Vec<&String> = found.iter().filter(|n| !declared.contains(n.as_str())).collect();
    if !missing.is_empty() {
        return Err(AppError::Validation(format!(
            "template placeholders not declared in variables: {}",
            missing
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        )));
    }

    Ok(())
}

/// Substitutes `{{.Name}}` placeholders from `data`. Rendering never fails:
/// an absent key renders as the literal `<no value>` so the receiver still
/// sees the artifact. Pure and deterministic for the same inputs.
pub fn render(text: &str, data: &HashMap<String, Value>) -> String {
    PLACEHOLDER
        .replace_all(text, |caps: &regex::Captures| {
            let name = &caps[1];
            match data.get(name) {
                Some(Value::String(s)) => s.clone(),
                Some(v) => v.to_string(),
                None => "<no value>".to_string(),
            }
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn validate_accepts_declared_placeholders() {
        assert!(validate(None, "Hello {{.name}}!", &["name".to_string()]).is_ok());
    }

    #[test]
    fn validate_rejects_undeclared_placeholder() {
        let err = validate(None, "Hello {{.name}}!", &[]).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn validate_checks_subject_too() {
        let err = validate(Some("Hi {{.x}}"), "body", &[]).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn render_substitutes_string_value() {
        let mut data = HashMap::new();
        data.insert("name".to_string(), json!("Ada"));
        assert_eq!(render("Hello {{.name}}!", &data), "Hello Ada!");
    }

    #[test]
    fn render_missing_key_yields_no_value_marker() {
        let data = HashMap::new();
        assert_eq!(render("Hello {{.name}}!", &data), "Hello <no value>!");
    }

    #[test]
    fn render_is_idempotent_once_no_placeholders_remain() {
        let mut data = HashMap::new();
        data.insert("name".to_string(), json!("Ada"));
        let once = render("Hello {{.name}}!", &data);
        let twice = render(&once, &data);
        assert_eq!(once, twice);
    }

    #[test]
    fn render_non_string_value_uses_json_form() {
        let mut data = HashMap::new();
        data.insert("count".to_string(), json!(3));
        assert_eq!(render("You have {{.count}} items", &data), "You have 3 items");
    }
}

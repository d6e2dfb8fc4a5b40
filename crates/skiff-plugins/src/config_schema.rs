//! Plugin configuration against its JSON schema
//!
//! One traversal of the schema finds secret fields (`format: password` or
//! `x-secret: true`); reads redact them and writes merge them back from the
//! stored config when the new value is blank.

use crate::{Category, PluginError, PluginResult};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeSet;

pub const MISSING_REQUIRED_CONFIG: &str = "missing_required_config";
pub const INVALID_PLUGIN_CONFIG: &str = "invalid_plugin_config";

/// Structured configuration failure surfaced to admins
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("{message}")]
pub struct ConfigValidationError {
    pub code: String,
    pub message: String,
    pub missing_fields: Vec<String>,
    pub redirect_path: String,
}

impl ConfigValidationError {
    pub fn missing(category: Category, mut fields: Vec<String>) -> Self {
        fields.sort();
        fields.dedup();
        Self {
            code: MISSING_REQUIRED_CONFIG.to_string(),
            message: format!("missing required config: {}", fields.join(", ")),
            missing_fields: fields,
            redirect_path: redirect_path_for(category).to_string(),
        }
    }

    pub fn invalid(category: Category, message: impl Into<String>) -> Self {
        Self {
            code: INVALID_PLUGIN_CONFIG.to_string(),
            message: message.into(),
            missing_fields: Vec::new(),
            redirect_path: redirect_path_for(category).to_string(),
        }
    }

    /// Build from a plugin's ValidateConfig error text
    pub fn from_plugin_error(category: Category, error: &str) -> Self {
        let fields = parse_missing_fields_from_error(error);
        if fields.is_empty() {
            Self::invalid(category, error.trim())
        } else {
            Self::missing(category, fields)
        }
    }
}

/// Where the admin UI sends operators to fix a category's configuration
pub fn redirect_path_for(category: Category) -> &'static str {
    match category {
        Category::Automation => "/admin/catalog",
        _ => "",
    }
}

/// Find a [`ConfigValidationError`] anywhere in an error's source chain
pub fn as_config_validation_error<'a>(
    err: &'a (dyn std::error::Error + 'static),
) -> Option<&'a ConfigValidationError> {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(found) = e.downcast_ref::<ConfigValidationError>() {
            return Some(found);
        }
        current = e.source();
    }
    None
}

/// Parse a schema document; an empty document is an empty schema
pub fn parse_schema(json_schema: &str) -> PluginResult<Value> {
    if json_schema.trim().is_empty() {
        return Ok(Value::Object(Map::new()));
    }
    serde_json::from_str(json_schema)
        .map_err(|e| PluginError::InvalidInput(format!("plugin returned invalid schema: {e}")))
}

/// Parse stored or submitted config; empty input is `{}`
pub fn parse_config(config_json: &str) -> PluginResult<Value> {
    if config_json.trim().is_empty() {
        return Ok(Value::Object(Map::new()));
    }
    let value: Value = serde_json::from_str(config_json)
        .map_err(|e| PluginError::InvalidInput(format!("config is not valid JSON: {e}")))?;
    if !value.is_object() {
        return Err(PluginError::InvalidInput(
            "config must be a JSON object".to_string(),
        ));
    }
    Ok(value)
}

fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(_) => false,
    }
}

/// Dotted paths of required fields that are absent, null or blank strings
pub fn missing_required_config_fields(schema: &Value, config: &Value) -> Vec<String> {
    let mut out = BTreeSet::new();
    walk_required(schema, Some(config), "", &mut out);
    out.into_iter().collect()
}

fn walk_required(schema: &Value, config: Option<&Value>, prefix: &str, out: &mut BTreeSet<String>) {
    let properties = schema.get("properties").and_then(Value::as_object);
    let object = config.and_then(Value::as_object);

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for name in required.iter().filter_map(Value::as_str) {
            if is_blank(object.and_then(|o| o.get(name))) {
                out.insert(join_path(prefix, name));
            }
        }
    }

    let (Some(properties), Some(object)) = (properties, object) else {
        return;
    };
    for (name, child) in properties {
        if let Some(value) = object.get(name).filter(|v| v.is_object()) {
            walk_required(child, Some(value), &join_path(prefix, name), out);
        }
    }
}

fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

/// Field names from a plugin error such as `"base_url/api_key required"`
pub fn parse_missing_fields_from_error(message: &str) -> Vec<String> {
    let Some(idx) = message.find("required") else {
        return Vec::new();
    };
    let head = message[..idx].replace(" and ", ",");
    let fields: BTreeSet<String> = head
        .split([',', ';', '|', '/'])
        .map(str::trim)
        .filter(|t| {
            !t.is_empty()
                && t
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        })
        .map(str::to_string)
        .collect();
    fields.into_iter().collect()
}

fn is_secret(node: &Value) -> bool {
    let password = node
        .get("format")
        .and_then(Value::as_str)
        .is_some_and(|f| f.trim().eq_ignore_ascii_case("password"));
    let flagged = node.get("x-secret").and_then(Value::as_bool) == Some(true);
    password || flagged
}

/// Paths of every secret field declared inside the schema's properties
pub fn secret_paths(schema: &Value) -> Vec<Vec<String>> {
    let mut out = Vec::new();
    let mut prefix = Vec::new();
    collect_secret_paths(schema, &mut prefix, &mut out);
    out
}

fn collect_secret_paths(node: &Value, prefix: &mut Vec<String>, out: &mut Vec<Vec<String>>) {
    let Some(properties) = node.get("properties").and_then(Value::as_object) else {
        return;
    };
    for (name, child) in properties {
        prefix.push(name.clone());
        if is_secret(child) {
            out.push(prefix.clone());
        } else {
            collect_secret_paths(child, prefix, out);
        }
        prefix.pop();
    }
}

fn get_path<'a>(value: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter().try_fold(value, |v, key| v.get(key))
}

fn set_path(value: &mut Value, path: &[String], new: Value) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let mut current = value;
    for key in parents {
        let Some(object) = current.as_object_mut() else {
            return;
        };
        current = object
            .entry(key.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if let Some(object) = current.as_object_mut() {
        object.insert(last.clone(), new);
    }
}

/// Copy of `config` with every present secret replaced by `""`
pub fn redact_secrets(schema: &Value, config: &Value) -> Value {
    let mut out = config.clone();
    for path in secret_paths(schema) {
        if get_path(&out, &path).is_some() {
            set_path(&mut out, &path, Value::String(String::new()));
        }
    }
    out
}

/// `new` with blank secrets filled from `old`
pub fn merge_secrets(schema: &Value, old: &Value, new: &Value) -> Value {
    let mut merged = new.clone();
    for path in secret_paths(schema) {
        if !is_blank(get_path(new, &path)) {
            continue;
        }
        if let Some(previous) = get_path(old, &path).filter(|v| !is_blank(Some(*v))) {
            set_path(&mut merged, &path, previous.clone());
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Value {
        json!({
            "type": "object",
            "required": ["base_url", "api_key"],
            "properties": {
                "base_url": {"type": "string"},
                "api_key": {"type": "string", "format": "password"},
                "webhook": {
                    "type": "object",
                    "required": ["url"],
                    "properties": {
                        "url": {"type": "string"},
                        "token": {"type": "string", "x-secret": true}
                    }
                }
            }
        })
    }

    #[test]
    fn blank_required_field_is_missing() {
        let missing =
            missing_required_config_fields(&schema(), &json!({"base_url": "https://x", "api_key": ""}));
        assert_eq!(missing, vec!["api_key"]);

        let missing = missing_required_config_fields(
            &schema(),
            &json!({"base_url": " ", "api_key": null, "webhook": {"url": ""}}),
        );
        assert_eq!(missing, vec!["api_key", "base_url", "webhook.url"]);

        assert!(
            missing_required_config_fields(&schema(), &json!({"base_url": "u", "api_key": "k"}))
                .is_empty()
        );
    }

    #[test]
    fn missing_fields_parse_from_plugin_text() {
        assert_eq!(
            parse_missing_fields_from_error("base_url/api_key required"),
            vec!["api_key", "base_url"]
        );
        assert_eq!(
            parse_missing_fields_from_error("app_id, secret and region required"),
            vec!["app_id", "region", "secret"]
        );
        assert_eq!(
            parse_missing_fields_from_error("a|b;a required"),
            vec!["a", "b"]
        );
        assert!(parse_missing_fields_from_error("connection refused").is_empty());
        assert!(parse_missing_fields_from_error("bad value! required").is_empty());
    }

    #[test]
    fn secret_paths_follow_nested_properties() {
        let paths = secret_paths(&schema());
        assert!(paths.contains(&vec!["api_key".to_string()]));
        assert!(paths.contains(&vec!["webhook".to_string(), "token".to_string()]));
        assert_eq!(paths.len(), 2);

        // A secret flag on the root itself is not a field.
        assert!(secret_paths(&json!({"format": "password"})).is_empty());
    }

    #[test]
    fn merge_keeps_old_secret_and_redact_blanks_it() {
        let old = json!({"base_url": "u", "api_key": "s"});
        let new = json!({"base_url": "u2", "api_key": ""});
        let merged = merge_secrets(&schema(), &old, &new);
        assert_eq!(merged, json!({"base_url": "u2", "api_key": "s"}));
        assert_eq!(
            redact_secrets(&schema(), &merged),
            json!({"base_url": "u2", "api_key": ""})
        );

        let omitted = merge_secrets(&schema(), &old, &json!({"base_url": "u3"}));
        assert_eq!(omitted, json!({"base_url": "u3", "api_key": "s"}));

        let rotated = merge_secrets(&schema(), &old, &json!({"base_url": "u", "api_key": "n"}));
        assert_eq!(rotated["api_key"], "n");
    }

    #[test]
    fn redaction_skips_absent_secrets() {
        let redacted = redact_secrets(&schema(), &json!({"base_url": "u"}));
        assert_eq!(redacted, json!({"base_url": "u"}));
    }

    #[test]
    fn validation_error_is_found_through_wrapping_only() {
        let cve = ConfigValidationError::missing(Category::Automation, vec!["api_key".into()]);
        assert_eq!(cve.redirect_path, "/admin/catalog");
        let wrapped = PluginError::from(cve.clone());
        assert_eq!(as_config_validation_error(&wrapped), Some(&cve));

        let lookalike = PluginError::InvalidInput(cve.message.clone());
        assert!(as_config_validation_error(&lookalike).is_none());
    }

    #[test]
    fn plugin_error_text_picks_code() {
        let missing = ConfigValidationError::from_plugin_error(Category::Sms, "sign_name required");
        assert_eq!(missing.code, MISSING_REQUIRED_CONFIG);
        assert_eq!(missing.missing_fields, vec!["sign_name"]);
        assert_eq!(missing.redirect_path, "");

        let invalid = ConfigValidationError::from_plugin_error(Category::Sms, "region unknown");
        assert_eq!(invalid.code, INVALID_PLUGIN_CONFIG);
    }
}

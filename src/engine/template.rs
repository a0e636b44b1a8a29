//! Minimal parameter substitution: the `{{$json.<dot.path>}}` rule and
//! nothing more. Not a general expression evaluator.

use regex::Regex;
use serde_json::Value;

/// Resolve a node's parameter map against its parent's output. String
/// values get `{{$json.*}}` placeholders replaced; everything else passes
/// through unchanged. A missing path substitutes the empty string.
pub fn resolve_parameters(parameters: &Value, parent_output: Option<&Value>) -> Value {
    match parameters {
        Value::String(s) => Value::String(substitute(s, parent_output)),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_parameters(v, parent_output)))
                .collect(),
        ),
        Value::Array(arr) => Value::Array(
            arr.iter()
                .map(|v| resolve_parameters(v, parent_output))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn substitute(template: &str, parent_output: Option<&Value>) -> String {
    let re = Regex::new(r"\{\{\$json\.([^}]+)\}\}").unwrap();

    re.replace_all(template, |caps: &regex::Captures| {
        let path = &caps[1];
        parent_output
            .and_then(|output| walk_path(output, path))
            .map(render)
            .unwrap_or_default()
    })
    .into_owned()
}

fn walk_path<'a>(json: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = json;
    for part in path.split('.') {
        current = current.get(part)?;
    }
    Some(current)
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn substitutes_nested_path() {
        let output = json!({"user": {"name": "Ann"}});
        let params = json!({"text": "Hello {{$json.user.name}}"});
        let resolved = resolve_parameters(&params, Some(&output));
        assert_eq!(resolved["text"], "Hello Ann");
    }

    #[test]
    fn missing_path_becomes_empty_string() {
        let output = json!({"user": {"name": "Ann"}});
        let params = json!({"text": "Hello {{$json.user.age}}"});
        let resolved = resolve_parameters(&params, Some(&output));
        assert_eq!(resolved["text"], "Hello ");
    }

    #[test]
    fn no_parent_output_substitutes_empty() {
        let params = json!({"text": "Hi {{$json.name}}!"});
        let resolved = resolve_parameters(&params, None);
        assert_eq!(resolved["text"], "Hi !");
    }

    #[test]
    fn non_string_values_pass_through() {
        let output = json!({"n": 1});
        let params = json!({"count": 3, "flag": true, "nested": {"url": "{{$json.n}}"}});
        let resolved = resolve_parameters(&params, Some(&output));
        assert_eq!(resolved["count"], 3);
        assert_eq!(resolved["flag"], true);
        assert_eq!(resolved["nested"]["url"], "1");
    }

    #[test]
    fn renders_numbers_and_bools_inline() {
        let output = json!({"price": 9.5, "ok": true});
        let params = json!("{{$json.price}} / {{$json.ok}}");
        let resolved = resolve_parameters(&params, Some(&output));
        assert_eq!(resolved, "9.5 / true");
    }

    #[test]
    fn strings_without_placeholders_are_untouched() {
        let params = json!({"subject": "plain text"});
        let resolved = resolve_parameters(&params, Some(&json!({})));
        assert_eq!(resolved["subject"], "plain text");
    }
}

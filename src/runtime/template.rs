use serde_json::Value;
use std::collections::BTreeMap;

/// Expands `{field}` placeholders against state. Unknown placeholders are left as written,
/// and `{{` / `}}` produce literal braces.
pub fn render_template(template: &str, state: &BTreeMap<String, Value>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut name = String::new();
                let mut closed = false;
                for next in chars.by_ref() {
                    if next == '}' {
                        closed = true;
                        break;
                    }
                    name.push(next);
                }
                match state.get(name.trim()) {
                    Some(value) if closed && is_placeholder(&name) => out.push_str(&display_value(value)),
                    _ => {
                        out.push('{');
                        out.push_str(&name);
                        if closed {
                            out.push('}');
                        }
                    }
                }
            }
            _ => out.push(c),
        }
    }
    out
}

fn is_placeholder(name: &str) -> bool {
    let name = name.trim();
    !name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_')
}

/// Strings render raw; everything else renders as JSON.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// The user turn of a node: the rendered prompt followed by one `## Input:` section per input key.
pub fn compose_user_turn(
    template: Option<&str>,
    input_keys: &[String],
    state: &BTreeMap<String, Value>,
) -> Option<String> {
    let mut turn = template
        .map(|t| render_template(t, state))
        .unwrap_or_default();
    for key in input_keys {
        let value = state.get(key).map(display_value).unwrap_or_default();
        if !turn.is_empty() {
            turn.push_str("\n\n");
        }
        turn.push_str(&format!("## Input: {}\n{}", key, value));
    }
    (!turn.trim().is_empty()).then_some(turn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state() -> BTreeMap<String, Value> {
        let mut state = BTreeMap::new();
        state.insert("topic".to_string(), json!("rust"));
        state.insert("count".to_string(), json!(3));
        state.insert("plan".to_string(), json!({"steps": ["a"]}));
        state
    }

    #[test]
    fn test_placeholders_expand_against_state() {
        assert_eq!(
            render_template("Research {topic} ({count} so far)", &state()),
            "Research rust (3 so far)"
        );
        assert_eq!(
            render_template("Plan: {plan}", &state()),
            "Plan: {\"steps\":[\"a\"]}"
        );
    }

    #[test]
    fn test_unknown_placeholders_and_escapes_survive() {
        assert_eq!(
            render_template("{missing} and {{literal}} and {topic", &state()),
            "{missing} and {literal} and {topic"
        );
        assert_eq!(render_template("json: {\"a\": 1}", &state()), "json: {\"a\": 1}");
    }

    #[test]
    fn test_input_sections_are_appended() {
        let turn = compose_user_turn(Some("Go."), &["topic".to_string()], &state());
        assert_eq!(turn.as_deref(), Some("Go.\n\n## Input: topic\nrust"));
        assert_eq!(compose_user_turn(None, &[], &state()), None);
    }
}

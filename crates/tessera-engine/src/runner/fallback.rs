use serde_json::Value;

use tessera_core::messages::ToolCall;

const NAME_KEYS: [&str; 3] = ["name", "tool", "function"];
const ARG_KEYS: [&str; 3] = ["arguments", "parameters", "args"];

/// Recover a tool call written as plain text: a fenced ```json block, or a bare
/// JSON object naming the tool and its arguments.
pub fn parse_tool_call(text: &str) -> Option<ToolCall> {
    fenced_blocks(text)
        .into_iter()
        .chain(std::iter::once(text.trim()))
        .chain(outer_object(text))
        .find_map(|candidate| {
            let value: Value = serde_json::from_str(candidate).ok()?;
            call_from_value(&value)
        })
}

fn fenced_blocks(text: &str) -> Vec<&str> {
    let mut blocks = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find("```") {
        let after = &rest[open + 3..];
        // skip the info string ("json", "JSON", or nothing)
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
        let info = after[..body_start].trim();
        let body = &after[body_start..];
        let Some(close) = body.find("```") else {
            break;
        };
        if info.is_empty() || info.eq_ignore_ascii_case("json") {
            blocks.push(body[..close].trim());
        }
        rest = &body[close + 3..];
    }
    blocks
}

fn outer_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

fn call_from_value(value: &Value) -> Option<ToolCall> {
    let obj = value.as_object()?;

    let mut name = NAME_KEYS
        .iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_str))
        .map(str::to_string);
    let mut args = ARG_KEYS.iter().find_map(|k| obj.get(*k));

    // {"function": {"name": ..., "arguments": ...}}
    if name.is_none() {
        if let Some(inner) = obj.get("function").and_then(Value::as_object) {
            name = inner.get("name").and_then(Value::as_str).map(str::to_string);
            args = args.or_else(|| ARG_KEYS.iter().find_map(|k| inner.get(*k)));
        }
    }

    let name = name.filter(|n| !n.trim().is_empty())?;
    let arguments = match args {
        None | Some(Value::Null) => "{}".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    };
    Some(ToolCall::new(name, arguments))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(call: &ToolCall) -> Value {
        serde_json::from_str(&call.arguments).unwrap()
    }

    #[test]
    fn fenced_json_block() {
        let text = "I'm done.\n```json\n{\"name\": \"submit_result\", \"arguments\": {\"summary\": \"ok\"}}\n```\n";
        let call = parse_tool_call(text).unwrap();
        assert_eq!(call.name, "submit_result");
        assert_eq!(args(&call)["summary"], "ok");
    }

    #[test]
    fn bare_object_with_alternate_keys() {
        let call = parse_tool_call(r#"{"tool": "run_lint", "parameters": {"fix": true}}"#).unwrap();
        assert_eq!(call.name, "run_lint");
        assert_eq!(args(&call)["fix"], true);

        let call = parse_tool_call(r#"{"function": "run_lint", "args": {}}"#).unwrap();
        assert_eq!(call.name, "run_lint");
    }

    #[test]
    fn object_embedded_in_prose() {
        let text = r#"Calling now: {"name": "submit_result", "arguments": {"summary": "x"}} thanks"#;
        assert_eq!(parse_tool_call(text).unwrap().name, "submit_result");
    }

    #[test]
    fn nested_function_object_and_string_arguments() {
        let text = r#"{"function": {"name": "run_lint", "arguments": "{\"path\": \"a.py\"}"}}"#;
        let call = parse_tool_call(text).unwrap();
        assert_eq!(call.name, "run_lint");
        assert_eq!(args(&call)["path"], "a.py");
    }

    #[test]
    fn missing_arguments_default_to_empty_object() {
        let call = parse_tool_call(r#"{"name": "submit_result"}"#).unwrap();
        assert_eq!(call.arguments, "{}");
    }

    #[test]
    fn no_call_in_plain_text() {
        assert!(parse_tool_call("All good, nothing to change.").is_none());
        assert!(parse_tool_call(r#"{"summary": "no tool name here"}"#).is_none());
        assert!(parse_tool_call("```python\nprint('hi')\n```").is_none());
    }

    #[test]
    fn skips_non_json_fences() {
        let text = "```rust\nfn main() {}\n```\n```json\n{\"name\": \"a\"}\n```";
        assert_eq!(parse_tool_call(text).unwrap().name, "a");
    }
}

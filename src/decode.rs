use clap::ValueEnum;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::ParseError,
    function_call::FunctionCall,
    parse_ast::{decode_function_list_elements, strip_code_fence},
    parse_xml::{XmlDialect, XmlStrictness, decode_xml_calls, render_xml_calls},
};

/// Surface syntax a model uses to express function calls.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum SyntaxKind {
    #[default]
    PythonCall,
    Json,
    VerboseXml,
    ConciseXml,
}

/// Strict decode: the error carries the reason, for the scorer's diagnostics.
pub fn decode_function_calls(
    raw: &str,
    syntax: SyntaxKind,
    strictness: XmlStrictness,
) -> Result<Vec<FunctionCall>, ParseError> {
    match syntax {
        SyntaxKind::PythonCall => decode_function_list_elements(raw)?.into_iter().collect(),
        SyntaxKind::Json => decode_json_calls(raw),
        SyntaxKind::VerboseXml => decode_xml_calls(raw, XmlDialect::Verbose, strictness),
        SyntaxKind::ConciseXml => decode_xml_calls(raw, XmlDialect::Concise, strictness),
    }
}

/// Never fails: malformed output yields an empty list and a log line.
/// Python-call elements outside the accepted grammar are dropped one by one.
pub fn parse(raw: &str, syntax: SyntaxKind) -> Vec<FunctionCall> {
    let result = match syntax {
        SyntaxKind::PythonCall => decode_function_list_elements(raw).map(|elements| {
            elements
                .into_iter()
                .filter_map(|element| match element {
                    Ok(call) => Some(call),
                    Err(e) => {
                        tracing::warn!(error = %e, "dropping undecodable call element");
                        None
                    }
                })
                .collect()
        }),
        other => decode_function_calls(raw, other, XmlStrictness::Lenient),
    };
    match result {
        Ok(calls) => calls,
        Err(e) => {
            tracing::warn!(error = %e, raw = raw, "failed to decode model output");
            Vec::new()
        }
    }
}

/// Decodes and renders each call back to a Python call string for execution.
pub fn decode_execute(
    raw: &str,
    syntax: SyntaxKind,
    strictness: XmlStrictness,
) -> Result<Vec<String>, ParseError> {
    Ok(decode_function_calls(raw, syntax, strictness)?
        .iter()
        .map(FunctionCall::to_python_call_string)
        .collect())
}

#[derive(Deserialize)]
struct JsonCall {
    #[serde(alias = "name")]
    function: String,
    #[serde(alias = "arguments", default)]
    parameters: Value,
}

pub fn decode_json_calls(raw: &str) -> Result<Vec<FunctionCall>, ParseError> {
    let text = strip_code_fence(raw);
    let value: Value =
        serde_json::from_str(text).map_err(|e| ParseError::MalformedJson(e.to_string()))?;
    let items = match value {
        Value::Array(items) => items,
        single @ Value::Object(_) => vec![single],
        other => {
            return Err(ParseError::WrongFormat(format!(
                "expected an array of function calls, got {}",
                other
            )));
        }
    };
    let mut calls = Vec::with_capacity(items.len());
    for item in items {
        let call: JsonCall =
            serde_json::from_value(item).map_err(|e| ParseError::MalformedJson(e.to_string()))?;
        let arguments = match call.parameters {
            Value::Object(map) => map.into_iter().collect::<IndexMap<_, _>>(),
            Value::Null => IndexMap::new(),
            // some providers send the argument object as a JSON string
            Value::String(encoded) => match serde_json::from_str::<Value>(&encoded) {
                Ok(Value::Object(map)) => map.into_iter().collect(),
                _ => {
                    return Err(ParseError::WrongFormat(format!(
                        "parameters of {} are not an object",
                        call.function
                    )));
                }
            },
            _ => {
                return Err(ParseError::WrongFormat(format!(
                    "parameters of {} are not an object",
                    call.function
                )));
            }
        };
        calls.push(FunctionCall::new(call.function, arguments));
    }
    Ok(calls)
}

pub fn render_calls(calls: &[FunctionCall], syntax: SyntaxKind) -> String {
    match syntax {
        SyntaxKind::PythonCall => {
            let rendered: Vec<String> = calls.iter().map(FunctionCall::to_python_call_string).collect();
            format!("[{}]", rendered.join(", "))
        }
        SyntaxKind::Json => {
            let items: Vec<Value> = calls
                .iter()
                .map(|c| {
                    serde_json::json!({
                        "function": c.name,
                        "parameters": c.arguments,
                    })
                })
                .collect();
            Value::Array(items).to_string()
        }
        SyntaxKind::VerboseXml => render_xml_calls(calls, XmlDialect::Verbose),
        SyntaxKind::ConciseXml => render_xml_calls(calls, XmlDialect::Concise),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function_call::calls_to_value;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn sample_calls() -> Vec<FunctionCall> {
        serde_json::from_value(json!([
            {"ls": {"a": true}},
            {"mv": {"source": "final_report.pdf", "destination": "temp", "retries": 2}},
            {"post_tweet": {"content": "it's done", "tags": ["#a", "#b"], "mentions": []}},
            {"set_budget": {"limit": 1500.5, "meta": {"currency": "USD", "strict": null}}}
        ]))
        .unwrap()
    }

    #[test]
    fn test_round_trip_all_syntaxes() {
        let calls = sample_calls();
        for syntax in [
            SyntaxKind::PythonCall,
            SyntaxKind::Json,
            SyntaxKind::VerboseXml,
            SyntaxKind::ConciseXml,
        ] {
            let text = render_calls(&calls, syntax);
            let decoded = decode_function_calls(&text, syntax, XmlStrictness::Strict).unwrap();
            assert_eq!(calls_to_value(&decoded), calls_to_value(&calls), "syntax {syntax:?}");
        }
    }

    #[test]
    fn test_json_decode_variants() {
        let raw = r#"```json
[{"function": "add", "parameters": {"a": 1, "b": 2}}, {"name": "noop", "arguments": "{\"x\": 1}"}]
```"#;
        assert_eq!(
            calls_to_value(&decode_json_calls(raw).unwrap()),
            json!([{"add": {"a": 1, "b": 2}}, {"noop": {"x": 1}}])
        );
        assert!(decode_json_calls("[{\"parameters\": {}}]").is_err());
        assert!(decode_json_calls("42").is_err());
    }

    #[test]
    fn test_parse_never_fails() {
        assert!(parse("I am not sure what to do.", SyntaxKind::PythonCall).is_empty());
        assert!(parse("{not json", SyntaxKind::Json).is_empty());
        assert!(parse("<functions><oops", SyntaxKind::VerboseXml).is_empty());
        let partial = parse("[ok(a=1), 3 * 4]", SyntaxKind::PythonCall);
        assert_eq!(calls_to_value(&partial), json!([{"ok": {"a": 1}}]));
    }

    #[test]
    fn test_decode_execute_renders_python_strings() {
        let strings =
            decode_execute("[cd(folder='temp'), ls()]", SyntaxKind::PythonCall, XmlStrictness::Lenient)
                .unwrap();
        assert_eq!(strings, vec!["cd(folder='temp')".to_string(), "ls()".to_string()]);
    }
}

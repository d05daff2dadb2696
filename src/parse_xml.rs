use clap::ValueEnum;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{error::ParseError, function_call::FunctionCall, parse_ast::literal_eval};

/// How malformed `<function>`/`<param>` elements are treated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum XmlStrictness {
    /// Skip elements without a name and keep decoding the rest.
    #[default]
    Lenient,
    /// Any element without a name aborts the whole decode.
    Strict,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum XmlDialect {
    /// `<param name=".." value=".." type=".."/>` under `<params>`.
    Verbose,
    /// `<param name=".." type="..">value</param>` directly under `<function>`.
    Concise,
}

/// Shared coercion for string-typed parameter values: trim, booleans,
/// JSON, then Python literal, else the trimmed string.
pub fn auto_cast(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return value;
    }
    if let Ok(value) = literal_eval(trimmed) {
        return value;
    }
    Value::String(trimmed.to_string())
}

/// Cuts any prose around the `<functions>` block.
fn functions_block(raw: &str) -> &str {
    let Some(start) = raw.find("<functions") else {
        return raw.trim();
    };
    let end = raw
        .rfind("</functions>")
        .map(|i| i + "</functions>".len())
        .unwrap_or(raw.len());
    if end <= start {
        return raw[start..].trim();
    }
    &raw[start..end]
}

pub fn decode_xml_calls(
    raw: &str,
    dialect: XmlDialect,
    strictness: XmlStrictness,
) -> Result<Vec<FunctionCall>, ParseError> {
    let block = functions_block(raw);
    let document =
        roxmltree::Document::parse(block).map_err(|e| ParseError::MalformedXml(e.to_string()))?;
    let root = document.root_element();
    let function_nodes: Vec<roxmltree::Node> = match root.tag_name().name() {
        "functions" => root
            .children()
            .filter(|n| n.is_element() && n.tag_name().name() == "function")
            .collect(),
        "function" => vec![root],
        other => {
            return Err(ParseError::MalformedXml(format!(
                "unexpected root element <{}>",
                other
            )));
        }
    };

    let mut calls = Vec::new();
    for function_node in function_nodes {
        let Some(name) = function_node.attribute("name") else {
            match strictness {
                XmlStrictness::Strict => return Err(ParseError::MissingFunctionName),
                XmlStrictness::Lenient => {
                    tracing::debug!("skipping <function> without a name");
                    continue;
                }
            }
        };
        let param_nodes: Vec<roxmltree::Node> = match dialect {
            XmlDialect::Verbose => function_node
                .children()
                .filter(|n| n.is_element() && n.tag_name().name() == "params")
                .flat_map(|params| params.children())
                .filter(|n| n.is_element() && n.tag_name().name() == "param")
                .collect(),
            XmlDialect::Concise => function_node
                .children()
                .filter(|n| n.is_element() && n.tag_name().name() == "param")
                .collect(),
        };
        let mut arguments = IndexMap::new();
        for param in param_nodes {
            let Some(param_name) = param.attribute("name") else {
                match strictness {
                    XmlStrictness::Strict => {
                        return Err(ParseError::MalformedXml(format!(
                            "<param> without a name in function {}",
                            name
                        )));
                    }
                    XmlStrictness::Lenient => continue,
                }
            };
            // the `type` attribute is documentation only
            let raw_value = match dialect {
                XmlDialect::Verbose => param
                    .attribute("value")
                    .or_else(|| param.text())
                    .unwrap_or_default(),
                XmlDialect::Concise => param.text().unwrap_or_default(),
            };
            arguments.insert(param_name.to_string(), auto_cast(raw_value));
        }
        calls.push(FunctionCall::new(name, arguments));
    }
    Ok(calls)
}

fn xml_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "dict",
    }
}

/// Text that `auto_cast` turns back into the same value.
fn xml_value_text(value: &Value) -> String {
    match value {
        Value::String(s) if auto_cast(s) == *value => s.clone(),
        Value::String(_) => crate::function_call::python_repr(value),
        other => other.to_string(),
    }
}

fn escape_xml(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

pub fn render_xml_calls(calls: &[FunctionCall], dialect: XmlDialect) -> String {
    let mut out = String::from("<functions>");
    for call in calls {
        out.push_str(&format!("<function name=\"{}\">", escape_xml(&call.name)));
        if dialect == XmlDialect::Verbose {
            out.push_str("<params>");
        }
        for (name, value) in &call.arguments {
            let text = escape_xml(&xml_value_text(value));
            match dialect {
                XmlDialect::Verbose => out.push_str(&format!(
                    "<param name=\"{}\" value=\"{}\" type=\"{}\"/>",
                    escape_xml(name),
                    text,
                    xml_type_name(value)
                )),
                XmlDialect::Concise => out.push_str(&format!(
                    "<param name=\"{}\" type=\"{}\">{}</param>",
                    escape_xml(name),
                    xml_type_name(value),
                    text
                )),
            }
        }
        if dialect == XmlDialect::Verbose {
            out.push_str("</params>");
        }
        out.push_str("</function>");
    }
    out.push_str("</functions>");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function_call::calls_to_value;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_verbose_xml_add() {
        let raw = r#"<functions><function name="add"><params><param name="a" value="2" type="integer"/><param name="b" value="3" type="integer"/></params></function></functions>"#;
        let calls = decode_xml_calls(raw, XmlDialect::Verbose, XmlStrictness::Lenient).unwrap();
        assert_eq!(calls_to_value(&calls), json!([{"add": {"a": 2, "b": 3}}]));
    }

    #[test]
    fn test_concise_xml_reads_element_text() {
        let raw = r#"Sure, here you go:
<functions>
  <function name="search"><param name="query" type="string"> rust async </param><param name="limit" type="string">5</param></function>
  <function name="flag"><param name="on" type="boolean">TRUE</param></function>
</functions>"#;
        let calls = decode_xml_calls(raw, XmlDialect::Concise, XmlStrictness::Lenient).unwrap();
        assert_eq!(
            calls_to_value(&calls),
            json!([{"search": {"query": "rust async", "limit": 5}}, {"flag": {"on": true}}])
        );
    }

    #[test]
    fn test_type_attribute_does_not_gate_coercion() {
        let raw = r#"<functions><function name="f"><params><param name="x" value="[1, 2]" type="string"/></params></function></functions>"#;
        let calls = decode_xml_calls(raw, XmlDialect::Verbose, XmlStrictness::Lenient).unwrap();
        assert_eq!(calls[0].arguments["x"], json!([1, 2]));
    }

    #[test]
    fn test_nameless_function_strictness() {
        let raw = r#"<functions><function><params/></function><function name="ok"><params/></function></functions>"#;
        let lenient = decode_xml_calls(raw, XmlDialect::Verbose, XmlStrictness::Lenient).unwrap();
        assert_eq!(lenient.len(), 1);
        assert_eq!(lenient[0].name, "ok");
        let strict = decode_xml_calls(raw, XmlDialect::Verbose, XmlStrictness::Strict);
        assert_eq!(strict, Err(ParseError::MissingFunctionName));
    }

    #[test]
    fn test_malformed_xml() {
        let err = decode_xml_calls("<functions><function name=", XmlDialect::Verbose, XmlStrictness::Lenient)
            .unwrap_err();
        assert!(matches!(err, ParseError::MalformedXml(_)));
    }

    #[test]
    fn test_auto_cast_order() {
        assert_eq!(auto_cast("  True "), json!(true));
        assert_eq!(auto_cast("false"), json!(false));
        assert_eq!(auto_cast("7"), json!(7));
        assert_eq!(auto_cast("7.5"), json!(7.5));
        assert_eq!(auto_cast("{\"k\": [1]}"), json!({"k": [1]}));
        assert_eq!(auto_cast("('a', 'b')"), json!(["a", "b"]));
        assert_eq!(auto_cast("'quoted'"), json!("quoted"));
        assert_eq!(auto_cast("None"), Value::Null);
        assert_eq!(auto_cast(" plain text "), json!("plain text"));
    }

    #[test]
    fn test_auto_cast_is_idempotent_through_python_str() {
        use crate::function_call::python_repr;
        for raw in ["True", "12", "-3.25", "[1, 'a']", "{'x': {'y': None}}", "hello world"] {
            let once = auto_cast(raw);
            let text = match &once {
                Value::String(s) => s.clone(),
                other => python_repr(other),
            };
            assert_eq!(auto_cast(&text), once, "input {raw}");
        }
    }

    #[test]
    fn test_render_then_decode_both_dialects() {
        let calls: Vec<FunctionCall> = serde_json::from_value(json!([
            {"move": {"source": "a & b.txt", "count": 3, "ratio": 0.5, "tags": ["x"], "quiet": false}},
            {"echo": {"text": "42"}}
        ]))
        .unwrap();
        for dialect in [XmlDialect::Verbose, XmlDialect::Concise] {
            let text = render_xml_calls(&calls, dialect);
            let decoded = decode_xml_calls(&text, dialect, XmlStrictness::Strict).unwrap();
            assert_eq!(decoded, calls);
        }
    }
}

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Canonical function call decoded from model output or ground truth.
/// On the wire it is the single-key mapping `{name: {param: value}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    try_from = "IndexMap<String, IndexMap<String, Value>>",
    into = "IndexMap<String, IndexMap<String, Value>>"
)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: IndexMap<String, Value>,
}

impl FunctionCall {
    pub fn new(name: impl Into<String>, arguments: IndexMap<String, Value>) -> Self {
        FunctionCall {
            name: name.into(),
            arguments,
        }
    }

    /// Renders the call in Python call syntax, e.g. `add(a=2, b='x')`.
    pub fn to_python_call_string(&self) -> String {
        let args: Vec<String> = self
            .arguments
            .iter()
            .map(|(k, v)| format!("{}={}", k, python_repr(v)))
            .collect();
        format!("{}({})", self.name, args.join(", "))
    }

    pub fn to_value(&self) -> Value {
        let mut inner = serde_json::Map::new();
        for (k, v) in &self.arguments {
            inner.insert(k.clone(), v.clone());
        }
        let mut outer = serde_json::Map::new();
        outer.insert(self.name.clone(), Value::Object(inner));
        Value::Object(outer)
    }
}

impl TryFrom<IndexMap<String, IndexMap<String, Value>>> for FunctionCall {
    type Error = String;

    fn try_from(map: IndexMap<String, IndexMap<String, Value>>) -> Result<Self, Self::Error> {
        if map.len() != 1 {
            return Err(format!(
                "a function call must have exactly one name key, found {}",
                map.len()
            ));
        }
        let Some((name, arguments)) = map.into_iter().next() else {
            return Err("empty function call".to_string());
        };
        Ok(FunctionCall { name, arguments })
    }
}

impl From<FunctionCall> for IndexMap<String, IndexMap<String, Value>> {
    fn from(call: FunctionCall) -> Self {
        let mut map = IndexMap::new();
        map.insert(call.name, call.arguments);
        map
    }
}

pub fn calls_to_value(calls: &[FunctionCall]) -> Value {
    Value::Array(calls.iter().map(FunctionCall::to_value).collect())
}

/// A list of single-key mappings whose value is itself a mapping.
pub fn is_function_calling_format_output(decoded: &Value) -> bool {
    let Value::Array(items) = decoded else {
        return false;
    };
    items.iter().all(|item| match item {
        Value::Object(map) => map.len() == 1 && map.values().all(Value::is_object),
        _ => false,
    })
}

/// `[]`, `[{}]` and anything not in function-calling format all count as
/// "no function call attempted".
pub fn is_empty_output(decoded: &Value) -> bool {
    if !is_function_calling_format_output(decoded) {
        return true;
    }
    match decoded {
        Value::Array(items) if items.is_empty() => true,
        Value::Array(items) if items.len() == 1 => {
            matches!(&items[0], Value::Object(m) if m.is_empty())
        }
        _ => false,
    }
}

/// Python literal representation of a JSON value.
pub fn python_repr(value: &Value) -> String {
    match value {
        Value::Null => "None".to_string(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::Number(n) => {
            if n.is_f64() {
                let f = n.as_f64().unwrap_or_default();
                format!("{:?}", f)
            } else {
                n.to_string()
            }
        }
        Value::String(s) => python_str_repr(s),
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(python_repr).collect();
            format!("[{}]", inner.join(", "))
        }
        Value::Object(map) => {
            let inner: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("{}: {}", python_str_repr(k), python_repr(v)))
                .collect();
            format!("{{{}}}", inner.join(", "))
        }
    }
}

fn python_str_repr(s: &str) -> String {
    let quote = if s.contains('\'') && !s.contains('"') { '"' } else { '\'' };
    let mut out = String::with_capacity(s.len() + 2);
    out.push(quote);
    for ch in s.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_function_call_serializes_as_single_key_mapping() {
        let call: FunctionCall =
            serde_json::from_value(json!({"add": {"a": 2, "b": 3}})).unwrap();
        assert_eq!(call.name, "add");
        assert_eq!(call.arguments["b"], json!(3));
        assert_eq!(serde_json::to_value(&call).unwrap(), json!({"add": {"a": 2, "b": 3}}));
    }

    #[test]
    fn test_two_keys_is_rejected() {
        let result: Result<FunctionCall, _> =
            serde_json::from_value(json!({"add": {}, "sub": {}}));
        assert!(result.is_err());
    }

    #[test]
    fn test_python_call_string() {
        let call: FunctionCall = serde_json::from_value(json!({
            "cd": {"folder": "it's", "depth": 1.0, "force": true, "tags": ["a", null]}
        }))
        .unwrap();
        assert_eq!(
            call.to_python_call_string(),
            "cd(folder=\"it's\", depth=1.0, force=True, tags=['a', None])"
        );
    }

    #[test]
    fn test_empty_output_detection() {
        assert!(is_empty_output(&json!([])));
        assert!(is_empty_output(&json!([{}])));
        assert!(is_empty_output(&json!("I cannot help with that")));
        assert!(is_empty_output(&json!([{"f": 1}])));
        assert!(!is_empty_output(&json!([{"f": {}}])));
        assert!(!is_empty_output(&json!([{"f": {"x": 1}}])));
    }
}

use std::sync::LazyLock;

use indexmap::IndexMap;
use regex::Regex;
use rustpython_parser::{Mode, ast};
use serde_json::Value;

use crate::{error::ParseError, function_call::FunctionCall};

static CODE_FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^\s*```[a-zA-Z]*\s*(.*?)\s*```\s*$").expect("static regex")
});

/// Which node types are accepted when resolving a value.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ValueGrammar {
    /// Argument values inside a model's call list: names, nested calls and
    /// lambdas are allowed.
    CallArgument,
    /// Equivalent of a literal evaluation: constants and containers only.
    Literal,
}

/// Removes a surrounding markdown code fence and stray backticks.
pub fn strip_code_fence(raw: &str) -> &str {
    let trimmed = match CODE_FENCE.captures(raw).and_then(|c| c.get(1)) {
        Some(inner) => inner.as_str(),
        None => raw,
    };
    trimmed.trim_matches(|c: char| c == '`' || c == '\n' || c == ' ')
}

pub fn parse_from_string_to_ast(function_calls: &str) -> Result<Vec<ast::Expr>, ParseError> {
    let parsed = rustpython_parser::parse(function_calls, Mode::Expression, "<model_output>")
        .map_err(|e| ParseError::InvalidSyntax(e.to_string()))?;
    let ast::Mod::Expression(expr) = parsed else {
        return Err(ParseError::InvalidSyntax("expected an expression".to_string()));
    };
    match *expr.body {
        ast::Expr::List(list_expr) => Ok(list_expr.elts),
        ast::Expr::Tuple(tuple_expr) => Ok(tuple_expr.elts),
        other @ ast::Expr::Call(_) => Ok(vec![other]),
        other => Err(ParseError::WrongFormat(format!(
            "expected a list of function calls, got {}",
            node_kind(&other)
        ))),
    }
}

/// Wraps the text in `[...]` when the model omitted the brackets.
pub fn normalize_call_list(raw: &str) -> String {
    let mut text = strip_code_fence(raw).to_string();
    if !text.starts_with('[') {
        text.insert(0, '[');
    }
    if !text.ends_with(']') {
        text.push(']');
    }
    text
}

/// Decodes every element separately. The outer error is a syntax error for the
/// whole text; an inner error only affects that element.
pub fn decode_function_list_elements(
    raw: &str,
) -> Result<Vec<Result<FunctionCall, ParseError>>, ParseError> {
    let source = normalize_call_list(raw);
    let elements = parse_from_string_to_ast(&source)?;
    Ok(elements
        .iter()
        .map(|expr| match expr {
            ast::Expr::Call(call) => resolve_call(call, &source),
            other => Err(ParseError::UnsupportedNode(format!(
                "expected a function call, got {}",
                node_kind(other)
            ))),
        })
        .collect())
}

pub fn decode_function_list(raw: &str) -> Result<Vec<FunctionCall>, ParseError> {
    decode_function_list_elements(raw)?.into_iter().collect()
}

fn resolve_call(call: &ast::ExprCall, source: &str) -> Result<FunctionCall, ParseError> {
    let name = resolve_func_name(&call.func)?;
    if !call.args.is_empty() {
        return Err(ParseError::UnsupportedNode(format!(
            "positional arguments are not supported in call to {}",
            name
        )));
    }
    let mut arguments = IndexMap::new();
    for keyword in &call.keywords {
        let Some(arg_name) = &keyword.arg else {
            return Err(ParseError::UnsupportedNode(format!(
                "**kwargs expansion in call to {}",
                name
            )));
        };
        let value = ast_expr_to_structured(&keyword.value, source, ValueGrammar::CallArgument)?;
        arguments.insert(arg_name.as_str().to_string(), value);
    }
    Ok(FunctionCall { name, arguments })
}

/// `a.b.c` resolves to the dot-joined name.
fn resolve_func_name(func: &ast::Expr) -> Result<String, ParseError> {
    match func {
        ast::Expr::Name(name_expr) => Ok(name_expr.id.as_str().to_string()),
        ast::Expr::Attribute(attr) => {
            let prefix = resolve_func_name(&attr.value)?;
            Ok(format!("{}.{}", prefix, attr.attr.as_str()))
        }
        other => Err(ParseError::UnsupportedNode(format!(
            "unsupported function expression type: {}",
            node_kind(other)
        ))),
    }
}

fn source_text(source: &str, start: usize, end: usize) -> String {
    source.get(start..end).unwrap_or_default().to_string()
}

pub fn ast_expr_to_structured(
    expr: &ast::Expr,
    source: &str,
    grammar: ValueGrammar,
) -> Result<Value, ParseError> {
    match expr {
        ast::Expr::Constant(c) => constant_to_value(&c.value),
        ast::Expr::UnaryOp(u) => match &u.op {
            ast::UnaryOp::USub => {
                let operand = ast_expr_to_structured(&u.operand, source, grammar)?;
                negate_json_value(&operand)
            }
            ast::UnaryOp::UAdd => ast_expr_to_structured(&u.operand, source, grammar),
            other => Err(ParseError::UnsupportedNode(format!(
                "unsupported unary operator: {:?}",
                other
            ))),
        },
        ast::Expr::List(l) => elements_to_array(&l.elts, source, grammar),
        ast::Expr::Tuple(t) => elements_to_array(&t.elts, source, grammar),
        ast::Expr::Set(s) => elements_to_array(&s.elts, source, grammar),
        ast::Expr::Dict(d) => {
            let mut map = serde_json::Map::new();
            for (key_opt, value) in d.keys.iter().zip(d.values.iter()) {
                let Some(key) = key_opt else {
                    return Err(ParseError::UnsupportedNode("dict unpacking".to_string()));
                };
                let key_str = match ast_expr_to_structured(key, source, grammar)? {
                    Value::String(s) => s,
                    Value::Null => "None".to_string(),
                    other => other.to_string(),
                };
                let val = ast_expr_to_structured(value, source, grammar)?;
                map.insert(key_str, val);
            }
            Ok(Value::Object(map))
        }
        _ if grammar == ValueGrammar::Literal => Err(ParseError::UnsupportedNode(format!(
            "{} is not a literal",
            node_kind(expr)
        ))),
        ast::Expr::Name(n) => match n.id.as_str() {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            "null" => Ok(Value::Null),
            // bare identifiers are kept as their name
            other => Ok(Value::String(other.to_string())),
        },
        ast::Expr::Call(c) => {
            if c.keywords.is_empty() {
                Ok(Value::String(source_text(
                    source,
                    usize::from(c.range.start()),
                    usize::from(c.range.end()),
                )))
            } else {
                Ok(resolve_call(c, source)?.to_value())
            }
        }
        ast::Expr::Lambda(l) => ast_expr_to_structured(&l.body, source, grammar),
        ast::Expr::Attribute(a) => Ok(Value::String(source_text(
            source,
            usize::from(a.range.start()),
            usize::from(a.range.end()),
        ))),
        ast::Expr::Subscript(s) => Ok(Value::String(source_text(
            source,
            usize::from(s.range.start()),
            usize::from(s.range.end()),
        ))),
        other => Err(ParseError::UnsupportedNode(format!(
            "unsupported AST type: {}",
            node_kind(other)
        ))),
    }
}

fn elements_to_array(
    elts: &[ast::Expr],
    source: &str,
    grammar: ValueGrammar,
) -> Result<Value, ParseError> {
    let items: Result<Vec<Value>, ParseError> = elts
        .iter()
        .map(|e| ast_expr_to_structured(e, source, grammar))
        .collect();
    Ok(Value::Array(items?))
}

fn constant_to_value(constant: &ast::Constant) -> Result<Value, ParseError> {
    match constant {
        ast::Constant::Str(s) => Ok(Value::String(s.to_string())),
        ast::Constant::Int(i) => {
            let text = i.to_string();
            // big ints do not fit a JSON number; keep their digits
            match text.parse::<i64>() {
                Ok(val) => Ok(Value::Number(serde_json::Number::from(val))),
                Err(_) => Ok(Value::String(text)),
            }
        }
        ast::Constant::Float(f) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .ok_or_else(|| ParseError::UnsupportedNode(format!("non-finite float: {}", f))),
        ast::Constant::Bool(b) => Ok(Value::Bool(*b)),
        ast::Constant::None => Ok(Value::Null),
        ast::Constant::Ellipsis => Ok(Value::String("...".to_string())),
        ast::Constant::Tuple(items) => Ok(Value::Array(
            items
                .iter()
                .map(constant_to_value)
                .collect::<Result<Vec<_>, _>>()?,
        )),
        other => Err(ParseError::UnsupportedNode(format!(
            "unsupported constant type: {:?}",
            other
        ))),
    }
}

pub fn negate_json_value(value: &Value) -> Result<Value, ParseError> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Value::Number(serde_json::Number::from(-i)))
            } else if let Some(f) = n.as_f64() {
                serde_json::Number::from_f64(-f)
                    .map(Value::Number)
                    .ok_or_else(|| ParseError::UnsupportedNode("cannot negate value".to_string()))
            } else {
                Err(ParseError::UnsupportedNode("cannot negate value".to_string()))
            }
        }
        _ => Err(ParseError::UnsupportedNode(
            "cannot negate non-numeric value".to_string(),
        )),
    }
}

/// Evaluates a Python literal (numbers, strings, booleans, None, lists,
/// tuples, sets, dicts).
pub fn literal_eval(text: &str) -> Result<Value, ParseError> {
    let parsed = rustpython_parser::parse(text, Mode::Expression, "<literal>")
        .map_err(|e| ParseError::InvalidSyntax(e.to_string()))?;
    let ast::Mod::Expression(expr) = parsed else {
        return Err(ParseError::InvalidSyntax("expected an expression".to_string()));
    };
    ast_expr_to_structured(&expr.body, text, ValueGrammar::Literal)
}

fn node_kind(expr: &ast::Expr) -> &'static str {
    match expr {
        ast::Expr::BinOp(_) => "BinOp",
        ast::Expr::BoolOp(_) => "BoolOp",
        ast::Expr::Compare(_) => "Compare",
        ast::Expr::Call(_) => "Call",
        ast::Expr::Constant(_) => "Constant",
        ast::Expr::Attribute(_) => "Attribute",
        ast::Expr::Subscript(_) => "Subscript",
        ast::Expr::Name(_) => "Name",
        ast::Expr::List(_) => "List",
        ast::Expr::Tuple(_) => "Tuple",
        ast::Expr::Dict(_) => "Dict",
        ast::Expr::Lambda(_) => "Lambda",
        ast::Expr::JoinedStr(_) => "JoinedStr",
        ast::Expr::Starred(_) => "Starred",
        _ => "expression",
    }
}

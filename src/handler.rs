use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    category::{EvaluationMethod, TestCategory},
    datasets::{ChatMessage, GroundTruthEntry},
    decode::SyntaxKind,
    error::{HandlerError, HarnessError},
    function_call::FunctionCall,
};

/// Everything a handler needs for one model query.
#[derive(Clone, Debug, Serialize)]
pub struct QueryRequest {
    pub entry_id: String,
    pub turn: usize,
    pub step: usize,
    pub messages: Vec<ChatMessage>,
    pub functions: Vec<Value>,
    pub temperature: f64,
    pub syntax: SyntaxKind,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    pub text: String,
    #[serde(default)]
    pub input_token_count: u64,
    #[serde(default)]
    pub output_token_count: u64,
    /// Seconds.
    #[serde(default)]
    pub latency: f64,
}

impl ModelResponse {
    pub fn text(text: impl Into<String>) -> Self {
        ModelResponse {
            text: text.into(),
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait ModelHandler: Send + Sync {
    fn model_name(&self) -> &str;

    /// Surface syntax this model writes calls in.
    fn syntax(&self) -> SyntaxKind {
        SyntaxKind::PythonCall
    }

    async fn query(&self, request: QueryRequest) -> Result<ModelResponse, HandlerError>;
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: IndexMap<String, Arc<dyn ModelHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn ModelHandler>) {
        self.handlers
            .insert(handler.model_name().to_string(), handler);
    }

    pub fn get(&self, model_name: &str) -> Result<Arc<dyn ModelHandler>, HarnessError> {
        self.handlers
            .get(model_name)
            .cloned()
            .ok_or_else(|| HarnessError::UnknownModel(model_name.to_string()))
    }

    pub fn model_names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

const ORACLE_IDLE_REPLY: &str = "There is nothing further to do.";

/// Replays ground truth as model output: the turn's calls on the first step
/// of a turn, plain text afterwards.
pub struct OracleHandler {
    model_name: String,
    scripts: IndexMap<String, Vec<String>>,
}

impl OracleHandler {
    pub fn new(model_name: impl Into<String>) -> Self {
        OracleHandler {
            model_name: model_name.into(),
            scripts: IndexMap::new(),
        }
    }

    /// Adds the replies for every entry of `category` that has ground truth.
    pub fn add_ground_truth(
        &mut self,
        category: TestCategory,
        ground_truth: &[GroundTruthEntry],
    ) -> Result<(), HarnessError> {
        for entry in ground_truth {
            let script = oracle_script(category, entry).map_err(|e| HarnessError::Json {
                path: format!("ground truth of {}", entry.id).into(),
                source: e,
            })?;
            self.scripts.insert(entry.id.clone(), script);
        }
        Ok(())
    }
}

fn call_list_text(calls: &[String]) -> String {
    if calls.is_empty() {
        return ORACLE_IDLE_REPLY.to_string();
    }
    format!("[{}]", calls.join(", "))
}

/// First acceptable value of each parameter, skipping optional ones.
fn first_acceptable_call(name: &str, params: &IndexMap<String, Vec<Value>>) -> FunctionCall {
    let arguments = params
        .iter()
        .filter_map(|(param, options)| {
            options
                .iter()
                .find(|v| *v != &Value::String(String::new()))
                .map(|v| (param.clone(), v.clone()))
        })
        .collect();
    FunctionCall::new(name, arguments)
}

fn oracle_script(
    category: TestCategory,
    entry: &GroundTruthEntry,
) -> Result<Vec<String>, serde_json::Error> {
    match category.evaluation_method() {
        EvaluationMethod::MultiTurn => Ok(entry
            .multi_turn_trace()?
            .iter()
            .map(|turn| {
                let calls: Vec<String> = turn.iter().map(|c| c.to_call_string()).collect();
                call_list_text(&calls)
            })
            .collect()),
        EvaluationMethod::Ast => {
            let answers: Vec<IndexMap<String, IndexMap<String, Vec<Value>>>> =
                serde_json::from_value(entry.ground_truth.clone())?;
            let calls: Vec<String> = answers
                .iter()
                .flat_map(|answer| answer.iter())
                .map(|(name, params)| first_acceptable_call(name, params).to_python_call_string())
                .collect();
            Ok(vec![call_list_text(&calls)])
        }
        EvaluationMethod::Agentic => {
            let answers: Vec<String> = match &entry.ground_truth {
                Value::String(s) => vec![s.clone()],
                other => serde_json::from_value(other.clone())?,
            };
            Ok(vec![answers.first().cloned().unwrap_or_default()])
        }
        EvaluationMethod::Relevance | EvaluationMethod::Irrelevance | EvaluationMethod::Unscored => {
            Ok(Vec::new())
        }
    }
}

#[async_trait]
impl ModelHandler for OracleHandler {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn query(&self, request: QueryRequest) -> Result<ModelResponse, HandlerError> {
        if request.step > 0 {
            return Ok(ModelResponse::text(ORACLE_IDLE_REPLY));
        }
        let reply = self
            .scripts
            .get(&request.entry_id)
            .and_then(|turns| turns.get(request.turn))
            .cloned()
            .unwrap_or_else(|| ORACLE_IDLE_REPLY.to_string());
        Ok(ModelResponse::text(reply))
    }
}

type ReplyFn = dyn Fn(&QueryRequest) -> Result<ModelResponse, HandlerError> + Send + Sync;

/// Handler backed by a closure. Useful for scripted conversations.
pub struct ClosureHandler {
    model_name: String,
    syntax: SyntaxKind,
    reply: Box<ReplyFn>,
}

impl ClosureHandler {
    pub fn new<F>(model_name: impl Into<String>, reply: F) -> Self
    where
        F: Fn(&QueryRequest) -> Result<ModelResponse, HandlerError> + Send + Sync + 'static,
    {
        ClosureHandler {
            model_name: model_name.into(),
            syntax: SyntaxKind::PythonCall,
            reply: Box::new(reply),
        }
    }

    pub fn with_syntax(mut self, syntax: SyntaxKind) -> Self {
        self.syntax = syntax;
        self
    }
}

#[async_trait]
impl ModelHandler for ClosureHandler {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn syntax(&self) -> SyntaxKind {
        self.syntax
    }

    async fn query(&self, request: QueryRequest) -> Result<ModelResponse, HandlerError> {
        (self.reply)(&request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(entry_id: &str, turn: usize, step: usize) -> QueryRequest {
        QueryRequest {
            entry_id: entry_id.to_string(),
            turn,
            step,
            messages: Vec::new(),
            functions: Vec::new(),
            temperature: 0.001,
            syntax: SyntaxKind::PythonCall,
        }
    }

    #[tokio::test]
    async fn test_oracle_replays_multi_turn_trace() {
        let mut oracle = OracleHandler::new("oracle");
        oracle
            .add_ground_truth(
                TestCategory::MultiTurnBase,
                &[GroundTruthEntry {
                    id: "multi_turn_base_0".to_string(),
                    ground_truth: json!([["add(a=1, b=2)", "subtract(a=3, b=1)"], []]),
                }],
            )
            .unwrap();
        let first = oracle.query(request("multi_turn_base_0", 0, 0)).await.unwrap();
        assert_eq!(first.text, "[add(a=1, b=2), subtract(a=3, b=1)]");
        let follow_up = oracle.query(request("multi_turn_base_0", 0, 1)).await.unwrap();
        assert_eq!(follow_up.text, ORACLE_IDLE_REPLY);
        let empty_turn = oracle.query(request("multi_turn_base_0", 1, 0)).await.unwrap();
        assert_eq!(empty_turn.text, ORACLE_IDLE_REPLY);
    }

    #[tokio::test]
    async fn test_oracle_picks_first_acceptable_ast_values() {
        let mut oracle = OracleHandler::new("oracle");
        oracle
            .add_ground_truth(
                TestCategory::Simple,
                &[GroundTruthEntry {
                    id: "simple_python_0".to_string(),
                    ground_truth: json!([{"area": {"base": [10], "unit": ["", "cm"]}}]),
                }],
            )
            .unwrap();
        let reply = oracle.query(request("simple_python_0", 0, 0)).await.unwrap();
        assert_eq!(reply.text, "[area(base=10, unit='cm')]");
    }

    #[test]
    fn test_registry_rejects_unknown_model() {
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(OracleHandler::new("oracle")));
        assert!(registry.get("oracle").is_ok());
        assert!(matches!(registry.get("gpt-9"), Err(HarnessError::UnknownModel(_))));
    }
}

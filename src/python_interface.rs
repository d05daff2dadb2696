use std::sync::Arc;

use async_trait::async_trait;
use pyo3::{Py, PyAny, PyResult, Python, exceptions::PyRuntimeError, prelude::*, pyfunction};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    category::parse_test_category_argument,
    config::HarnessConfig,
    datasets::ChatMessage,
    decode::SyntaxKind,
    error::{HandlerError, HarnessError},
    handler::{ModelHandler, ModelResponse, QueryRequest},
    pipeline,
    simulator::SimulatorRegistry,
};

/// What the Python callback receives, serialized as one JSON string.
#[derive(Clone, Serialize)]
pub struct PythonTask {
    pub identifier: String,
    pub turn: usize,
    pub step: usize,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<Value>,
    pub temperature: f64,
    pub syntax: SyntaxKind,
}

impl From<QueryRequest> for PythonTask {
    fn from(request: QueryRequest) -> Self {
        PythonTask {
            identifier: request.entry_id,
            turn: request.turn,
            step: request.step,
            messages: request.messages,
            tools: request.functions,
            temperature: request.temperature,
            syntax: request.syntax,
        }
    }
}

/// What the callback must return, as a JSON string.
#[derive(Clone, Deserialize)]
pub struct PythonResponse {
    pub identifier: String,
    pub response: String,
    #[serde(default)]
    pub input_token_count: u64,
    #[serde(default)]
    pub output_token_count: u64,
    #[serde(default)]
    pub latency: f64,
}

/// Forwards every query to a Python callable `callback(task_json) -> response_json`.
pub struct PythonHandler {
    model_name: String,
    syntax: SyntaxKind,
    callback: Arc<Py<PyAny>>,
}

impl PythonHandler {
    pub fn new(model_name: impl Into<String>, syntax: SyntaxKind, callback: Py<PyAny>) -> Self {
        PythonHandler {
            model_name: model_name.into(),
            syntax,
            callback: Arc::new(callback),
        }
    }
}

#[async_trait]
impl ModelHandler for PythonHandler {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn syntax(&self) -> SyntaxKind {
        self.syntax
    }

    async fn query(&self, request: QueryRequest) -> Result<ModelResponse, HandlerError> {
        let entry_id = request.entry_id.clone();
        let payload = serde_json::to_string(&PythonTask::from(request))
            .map_err(|e| HandlerError::Request(e.to_string()))?;
        let callback = self.callback.clone();
        // the callback blocks on network I/O while holding the interpreter
        let raw = tokio::task::spawn_blocking(move || {
            Python::attach(|py| -> PyResult<String> {
                callback.bind(py).call1((payload,))?.extract::<String>()
            })
        })
        .await
        .map_err(|e| HandlerError::Join(e.to_string()))?
        .map_err(|e| HandlerError::Request(e.to_string()))?;

        let response: PythonResponse =
            serde_json::from_str(&raw).map_err(|e| HandlerError::MalformedResponse(e.to_string()))?;
        if response.identifier != entry_id {
            return Err(HandlerError::MalformedResponse(format!(
                "response for {} arrived while querying {}",
                response.identifier, entry_id
            )));
        }
        Ok(ModelResponse {
            text: response.response,
            input_token_count: response.input_token_count,
            output_token_count: response.output_token_count,
            latency: response.latency,
        })
    }
}

fn to_py_err(e: HarnessError) -> PyErr {
    PyRuntimeError::new_err(e.to_string())
}

fn parse_syntax(syntax: &str) -> PyResult<SyntaxKind> {
    serde_json::from_value(Value::String(syntax.to_string()))
        .map_err(|_| PyRuntimeError::new_err(format!("Unknown call syntax '{syntax}'")))
}

fn build_runtime(config: &HarnessConfig) -> PyResult<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.num_threads.max(1))
        .enable_all()
        .build()
        .map_err(|e| PyRuntimeError::new_err(e.to_string()))
}

/// Runs generation for `test_category` with `callback` as the model.
/// Returns `(completed, errored, skipped)`.
#[pyfunction]
#[pyo3(signature = (model_name, callback, test_category, syntax = "python_call", num_threads = 1, allow_overwrite = false))]
pub fn run_generation(
    py: Python<'_>,
    model_name: String,
    callback: Py<PyAny>,
    test_category: Vec<String>,
    syntax: &str,
    num_threads: usize,
    allow_overwrite: bool,
) -> PyResult<(usize, usize, usize)> {
    dotenvy::dotenv().ok();
    let config = Arc::new(HarnessConfig {
        num_threads,
        allow_overwrite,
        ..HarnessConfig::default()
    });
    let categories = parse_test_category_argument(&test_category).map_err(to_py_err)?;
    let handler = Arc::new(PythonHandler::new(model_name, parse_syntax(syntax)?, callback));
    let runtime = build_runtime(&config)?;
    let registry = Arc::new(SimulatorRegistry::default());
    // release the interpreter so worker threads can call back into Python
    let summary = py
        .detach(|| runtime.block_on(pipeline::generate(config, registry, handler, &categories)))
        .map_err(to_py_err)?;
    Ok((summary.completed, summary.errored, summary.skipped))
}

/// Scores existing results and writes the score files and leaderboard.
#[pyfunction]
#[pyo3(signature = (model_name, test_category, syntax = "python_call"))]
pub fn run_evaluation(
    py: Python<'_>,
    model_name: Vec<String>,
    test_category: Vec<String>,
    syntax: &str,
) -> PyResult<()> {
    let config = Arc::new(HarnessConfig::default());
    let categories = parse_test_category_argument(&test_category).map_err(to_py_err)?;
    let syntax = parse_syntax(syntax)?;
    let models: Vec<(String, SyntaxKind)> = model_name.into_iter().map(|m| (m, syntax)).collect();
    let runtime = build_runtime(&config)?;
    let registry = Arc::new(SimulatorRegistry::default());
    py.detach(|| runtime.block_on(pipeline::evaluate(config, registry, &models, &categories)))
        .map_err(to_py_err)?;
    Ok(())
}

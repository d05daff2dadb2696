use std::{path::PathBuf, time::Instant};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use crate::{
    category::{CategoryKind, TestCategory},
    config::HarnessConfig,
    datasets::{ChatMessage, GroundTruthCall, TestEntry},
    decode::{SyntaxKind, decode_function_calls},
    error::{EntryError, SimulatorError},
    execution::{ExecutionResult, InstanceSet, execute, execute_call_strings},
    handler::{ModelHandler, ModelResponse, QueryRequest},
    simulator::{ScenarioContext, SimulatorRegistry},
    snapshot::StateSnapshot,
};

/// Replaces the empty user message of a turn that unlocks held-out functions.
pub const ADDITIONAL_FUNCTION_PROMPT: &str =
    "I have updated some more functions you can choose from. What about now?";

/// One line of a result file: `{"id", "result", ...metadata}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub id: String,
    pub result: Value,
    #[serde(flatten)]
    pub metadata: IndexMap<String, Value>,
}

impl ResultRecord {
    /// Per turn, per step raw model text. `None` unless `result` has that shape.
    pub fn multi_turn_result(&self) -> Option<Vec<Vec<String>>> {
        serde_json::from_value(self.result.clone()).ok()
    }

    pub fn is_inference_error(&self) -> bool {
        matches!(&self.result, Value::String(s) if s.starts_with(INFERENCE_ERROR_PREFIX))
    }

    pub fn force_quit(&self) -> bool {
        self.metadata.get("force_quit").and_then(Value::as_bool) == Some(true)
    }
}

pub const INFERENCE_ERROR_PREFIX: &str = "Error during inference:";

/// Result recorded in place of model output when an entry fails.
pub fn inference_error_record(entry_id: &str, error: &EntryError) -> ResultRecord {
    let mut chain = vec![error.to_string()];
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        chain.push(cause.to_string());
        source = cause.source();
    }
    let mut metadata = IndexMap::new();
    metadata.insert("traceback".to_string(), json!(chain.join("\n")));
    ResultRecord {
        id: entry_id.to_string(),
        result: Value::String(format!("{} {}", INFERENCE_ERROR_PREFIX, error)),
        metadata,
    }
}

/// Per-entry setting shared by the inference run and the scorer's replays.
#[derive(Clone)]
pub struct EntryRunner<'a> {
    pub config: &'a HarnessConfig,
    pub registry: &'a SimulatorRegistry,
    pub snapshot_dir: PathBuf,
}

impl<'a> EntryRunner<'a> {
    pub fn scenario(&self, entry: &TestEntry) -> Result<ScenarioContext, EntryError> {
        let category = entry.category()?;
        Ok(ScenarioContext {
            entry_id: entry.id.clone(),
            category,
            snapshot_dir: self.snapshot_dir.clone(),
            scenario: category
                .memory_backend()
                .and_then(|_| entry.memory_scenario()),
            long_context: entry.long_context || category == TestCategory::MultiTurnLongContext,
        })
    }

    fn instantiate(&self, entry: &TestEntry, ctx: &ScenarioContext) -> Result<InstanceSet, SimulatorError> {
        self.registry
            .instantiate(&entry.involved_classes, &entry.initial_config, ctx)
    }

    /// Runs one entry against `handler` and returns its result record.
    pub async fn run_entry(
        &self,
        entry: &TestEntry,
        handler: &dyn ModelHandler,
    ) -> Result<ResultRecord, EntryError> {
        match entry.category()?.kind() {
            CategoryKind::SingleTurn => self.run_single_turn(entry, handler).await,
            _ => self.run_multi_turn(entry, handler).await,
        }
    }

    async fn query(
        &self,
        handler: &dyn ModelHandler,
        request: QueryRequest,
    ) -> Result<ModelResponse, EntryError> {
        let start = Instant::now();
        let mut response = handler.query(request).await?;
        if response.latency == 0.0 {
            response.latency = start.elapsed().as_secs_f64();
        }
        Ok(response)
    }

    async fn run_single_turn(
        &self,
        entry: &TestEntry,
        handler: &dyn ModelHandler,
    ) -> Result<ResultRecord, EntryError> {
        let messages = entry.question.first().cloned().unwrap_or_default();
        let request = QueryRequest {
            entry_id: entry.id.clone(),
            turn: 0,
            step: 0,
            messages: messages.clone(),
            functions: entry.function.clone(),
            temperature: self.config.temperature,
            syntax: handler.syntax(),
        };
        let response = self.query(handler, request).await?;

        let mut metadata = IndexMap::new();
        metadata.insert("input_token_count".to_string(), json!(response.input_token_count));
        metadata.insert("output_token_count".to_string(), json!(response.output_token_count));
        metadata.insert("latency".to_string(), json!(response.latency));
        if self.config.include_input_log {
            metadata.insert("inference_log".to_string(), json!(messages));
        }
        Ok(ResultRecord {
            id: entry.id.clone(),
            result: Value::String(response.text),
            metadata,
        })
    }

    /// Turns run in order. Within a turn the model is queried until it stops
    /// emitting decodable calls or the step limit is hit; the latter sets
    /// `force_quit` and records every remaining turn as empty.
    async fn run_multi_turn(
        &self,
        entry: &TestEntry,
        handler: &dyn ModelHandler,
    ) -> Result<ResultRecord, EntryError> {
        let ctx = self.scenario(entry)?;
        let mut instances = self.instantiate(entry, &ctx)?;
        let syntax = handler.syntax();

        let mut history: Vec<ChatMessage> = Vec::new();
        let mut results: Vec<Vec<String>> = Vec::new();
        let mut input_tokens: Vec<Vec<u64>> = Vec::new();
        let mut output_tokens: Vec<Vec<u64>> = Vec::new();
        let mut latencies: Vec<Vec<f64>> = Vec::new();
        let mut force_quit = false;

        for (turn, turn_messages) in entry.question.iter().enumerate() {
            if force_quit {
                results.push(Vec::new());
                input_tokens.push(Vec::new());
                output_tokens.push(Vec::new());
                latencies.push(Vec::new());
                continue;
            }
            if entry.held_out_functions.contains_key(&turn) && turn_messages.is_empty() {
                history.push(ChatMessage::user(ADDITIONAL_FUNCTION_PROMPT));
            } else {
                history.extend(turn_messages.iter().cloned());
            }
            let functions = entry.visible_functions(turn);

            let mut turn_results = Vec::new();
            let mut turn_input = Vec::new();
            let mut turn_output = Vec::new();
            let mut turn_latency = Vec::new();
            let mut step = 0;
            loop {
                let request = QueryRequest {
                    entry_id: entry.id.clone(),
                    turn,
                    step,
                    messages: history.clone(),
                    functions: functions.clone(),
                    temperature: self.config.temperature,
                    syntax,
                };
                let response = self.query(handler, request).await?;
                turn_input.push(response.input_token_count);
                turn_output.push(response.output_token_count);
                turn_latency.push(response.latency);
                history.push(ChatMessage::assistant(response.text.clone()));
                turn_results.push(response.text.clone());

                let calls = match decode_function_calls(&response.text, syntax, self.config.xml_strictness) {
                    Ok(calls) if !calls.is_empty() => calls,
                    // no decodable calls: the model is done with this turn
                    _ => break,
                };
                let outcomes = execute(&calls, &mut instances);
                for (call, outcome) in calls.iter().zip(&outcomes) {
                    history.push(ChatMessage::tool(call.to_python_call_string(), outcome.content()));
                }

                step += 1;
                if step >= self.config.max_steps_per_turn {
                    debug!(entry = %entry.id, turn, "step limit reached, forcing quit");
                    force_quit = true;
                    break;
                }
            }
            results.push(turn_results);
            input_tokens.push(turn_input);
            output_tokens.push(turn_output);
            latencies.push(turn_latency);
        }

        instances.complete_entry(&ctx)?;

        let mut metadata = IndexMap::new();
        metadata.insert("input_token_count".to_string(), json!(input_tokens));
        metadata.insert("output_token_count".to_string(), json!(output_tokens));
        metadata.insert("latency".to_string(), json!(latencies));
        if force_quit {
            metadata.insert("force_quit".to_string(), json!(true));
        }
        if self.config.include_input_log {
            metadata.insert("inference_log".to_string(), json!(history));
        }
        Ok(ResultRecord {
            id: entry.id.clone(),
            result: json!(results),
            metadata,
        })
    }

    /// Executes the recorded trace against a fresh instance set.
    pub fn run_ground_truth(
        &self,
        entry: &TestEntry,
        trace: &[Vec<GroundTruthCall>],
    ) -> Result<Vec<TurnOutcome>, EntryError> {
        let ctx = self.scenario(entry)?;
        let mut instances = self.instantiate(entry, &ctx)?;
        let outcomes = trace
            .iter()
            .map(|turn| {
                let calls: Vec<String> = turn.iter().map(GroundTruthCall::to_call_string).collect();
                let results = execute_call_strings(&calls, &mut instances);
                TurnOutcome {
                    calls,
                    results,
                    state: instances.snapshot(),
                }
            })
            .collect();
        Ok(outcomes)
    }

    /// Re-executes recorded model output step by step. Steps that do not
    /// decode are skipped, as they were during inference.
    pub fn replay_model_turns(
        &self,
        entry: &TestEntry,
        model_result: &[Vec<String>],
        syntax: SyntaxKind,
    ) -> Result<Vec<TurnOutcome>, EntryError> {
        let ctx = self.scenario(entry)?;
        let mut instances = self.instantiate(entry, &ctx)?;
        let outcomes = model_result
            .iter()
            .map(|steps| {
                let mut calls = Vec::new();
                let mut results = Vec::new();
                for step in steps {
                    let Ok(decoded) = decode_function_calls(step, syntax, self.config.xml_strictness)
                    else {
                        continue;
                    };
                    results.extend(execute(&decoded, &mut instances));
                    calls.extend(decoded.iter().map(|c| c.to_python_call_string()));
                }
                TurnOutcome {
                    calls,
                    results,
                    state: instances.snapshot(),
                }
            })
            .collect();
        Ok(outcomes)
    }
}

/// Calls executed in one turn, their results and the state after the turn.
#[derive(Clone, Debug, PartialEq)]
pub struct TurnOutcome {
    pub calls: Vec<String>,
    pub results: Vec<ExecutionResult>,
    pub state: StateSnapshot,
}

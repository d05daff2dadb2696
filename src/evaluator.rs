use std::sync::Arc;

use futures::{StreamExt, stream};
use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::{
    aggregator::LeaderboardTable,
    category::{EvaluationMethod, TestCategory},
    config::HarnessConfig,
    datasets::{GroundTruthCall, GroundTruthEntry, TestEntry, load_ground_truth, load_test_entries},
    decode::{SyntaxKind, decode_function_calls},
    error::{EntryError, HarnessError, ParseError},
    function_call::{FunctionCall, calls_to_value, is_empty_output, is_function_calling_format_output},
    multi_turn::{EntryRunner, ResultRecord, TurnOutcome},
    paths::{ground_truth_file, memory_snapshot_dir, result_file, score_file},
    simulator::SimulatorRegistry,
    snapshot::diff_snapshots,
    utils::{load_json_lines_as, write_json_lines_to_file},
};

/// `{function_name: {param: [acceptable values]}}`. An empty string among
/// the acceptable values marks the parameter optional.
pub type PossibleAnswer = IndexMap<String, IndexMap<String, Vec<Value>>>;

/// Verdict for one entry. Failures always say what diverged.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckerResult {
    pub valid: bool,
    pub error: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl CheckerResult {
    pub fn pass() -> Self {
        CheckerResult {
            valid: true,
            error: Vec::new(),
            error_type: None,
            details: None,
        }
    }

    pub fn fail(error_type: &str, message: impl Into<String>) -> Self {
        CheckerResult {
            valid: false,
            error: vec![message.into()],
            error_type: Some(error_type.to_string()),
            details: None,
        }
    }

    fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn error_type(&self) -> &str {
        self.error_type.as_deref().unwrap_or_default()
    }
}

/// First line of a score file.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScoreSummary {
    pub accuracy: f64,
    pub correct_count: usize,
    pub total_count: usize,
}

/// One failed entry, as written after the summary line.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EntryScore {
    pub id: String,
    pub model_name: String,
    pub test_category: TestCategory,
    pub valid: bool,
    pub error: Vec<String>,
    pub error_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    pub prompt: Value,
    pub model_result_raw: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_result_decoded: Option<Value>,
    pub possible_answer: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inference_log: Option<Value>,
}

#[derive(Clone, Debug)]
pub struct CategoryReport {
    pub category: TestCategory,
    pub summary: ScoreSummary,
    pub failures: Vec<EntryScore>,
}

/* ---------------------------------- AST ---------------------------------- */

/// Strips spaces and `,./-_*^`, lowercases and turns `'` into `"`.
pub fn standardize_string(text: &str) -> String {
    text.chars()
        .filter(|c| !matches!(c, ' ' | ',' | '.' | '/' | '-' | '_' | '*' | '^'))
        .flat_map(char::to_lowercase)
        .map(|c| if c == '\'' { '"' } else { c })
        .collect()
}

/// Compares one model value against one acceptable value.
pub fn value_matches(model: &Value, expected: &Value) -> bool {
    match (model, expected) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => a == b,
        },
        (Value::String(a), Value::String(b)) => standardize_string(a) == standardize_string(b),
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| value_matches(x, y))
        }
        (Value::Object(a), Value::Object(b)) => dict_matches(a, b),
        _ => model == expected,
    }
}

/// Nested dict: each expected value is itself a list of acceptable values.
fn dict_matches(model: &serde_json::Map<String, Value>, expected: &serde_json::Map<String, Value>) -> bool {
    if model.keys().any(|k| !expected.contains_key(k)) {
        return false;
    }
    expected.iter().all(|(key, options)| {
        let options = match options {
            Value::Array(items) => items.as_slice(),
            single => std::slice::from_ref(single),
        };
        match model.get(key) {
            Some(value) => options.iter().any(|o| value_matches(value, o)),
            None => options.iter().any(is_optional_marker),
        }
    })
}

fn is_optional_marker(value: &Value) -> bool {
    matches!(value, Value::String(s) if s.is_empty())
}

fn value_error_kind(value: &Value) -> &'static str {
    match value {
        Value::String(_) => "value_error:string",
        Value::Array(_) => "value_error:list/tuple",
        Value::Object(_) => "value_error:dict_value",
        _ => "value_error:others",
    }
}

/// Checks one decoded call against one possible answer.
pub fn simple_function_checker(call: &FunctionCall, possible_answer: &PossibleAnswer) -> CheckerResult {
    let Some((expected_name, params)) = possible_answer.first() else {
        return CheckerResult::fail(
            "simple_function_checker:wrong_func_name",
            "Possible answer names no function.",
        );
    };
    if &call.name != expected_name {
        return CheckerResult::fail(
            "simple_function_checker:wrong_func_name",
            format!("Function name '{}' not found in model output.", expected_name),
        );
    }

    for (param, options) in params {
        if !call.arguments.contains_key(param) && !options.iter().any(is_optional_marker) {
            return CheckerResult::fail(
                "simple_function_checker:missing_required",
                format!("Missing required parameter: '{}'.", param),
            );
        }
    }

    for (param, value) in &call.arguments {
        let Some(options) = params.get(param) else {
            return CheckerResult::fail(
                "simple_function_checker:unexpected_param",
                format!("Unexpected parameter: '{}'.", param),
            );
        };
        if !options.iter().any(|option| value_matches(value, option)) {
            return CheckerResult::fail(
                value_error_kind(value),
                format!(
                    "Invalid value for parameter '{}': {}. Expected one of {}.",
                    param,
                    value,
                    Value::Array(options.clone())
                ),
            )
            .with_details(json!({"parameter": param, "model_value": value, "possible_values": options}));
        }
    }
    CheckerResult::pass()
}

/// Parallel categories match calls in any order, greedily; the others in order.
pub fn ast_checker(
    model_output: &[FunctionCall],
    possible_answers: &[PossibleAnswer],
    category: TestCategory,
) -> CheckerResult {
    if category.is_parallel() {
        parallel_function_checker_no_order(model_output, possible_answers)
    } else {
        ordered_function_checker(model_output, possible_answers)
    }
}

fn ordered_function_checker(model_output: &[FunctionCall], possible_answers: &[PossibleAnswer]) -> CheckerResult {
    if model_output.len() != possible_answers.len() {
        return CheckerResult::fail(
            "multiple_function_checker:wrong_count",
            format!(
                "Wrong number of functions. Expected {}, got {}.",
                possible_answers.len(),
                model_output.len()
            ),
        );
    }
    for (call, answer) in model_output.iter().zip(possible_answers) {
        let result = simple_function_checker(call, answer);
        if !result.valid {
            return result;
        }
    }
    CheckerResult::pass()
}

fn parallel_function_checker_no_order(
    model_output: &[FunctionCall],
    possible_answers: &[PossibleAnswer],
) -> CheckerResult {
    if model_output.len() != possible_answers.len() {
        return CheckerResult::fail(
            "parallel_function_checker_no_order:wrong_count",
            format!(
                "Wrong number of functions. Expected {}, got {}.",
                possible_answers.len(),
                model_output.len()
            ),
        );
    }

    let mut unmatched: Vec<&FunctionCall> = model_output.iter().collect();
    for (index, answer) in possible_answers.iter().enumerate() {
        let mut attempts = Vec::new();
        let position = unmatched.iter().position(|call| {
            let result = simple_function_checker(call, answer);
            let valid = result.valid;
            attempts.push(result);
            valid
        });
        match position {
            Some(pos) => {
                unmatched.remove(pos);
            }
            None => {
                return CheckerResult::fail(
                    "parallel_function_checker_no_order:cannot_find_match",
                    format!(
                        "Could not find a matching function among the model output for index {} of possible answers.",
                        index
                    ),
                )
                .with_details(json!({"attempts": attempts}));
            }
        }
    }
    CheckerResult::pass()
}

/* ------------------------------- relevance -------------------------------- */

/// Whether `raw` holds at least one function call. Undecodable output and
/// `[]`/`[{}]` both count as no call.
pub fn contains_function_call(
    raw: &str,
    syntax: SyntaxKind,
    config: &HarnessConfig,
) -> (bool, Option<Value>, Option<ParseError>) {
    match decode_function_calls(raw, syntax, config.xml_strictness) {
        Ok(calls) => {
            let decoded = calls_to_value(&calls);
            (!is_empty_output(&decoded), Some(decoded), None)
        }
        Err(e) => (false, None, Some(e)),
    }
}

/* ------------------------------- multi-turn ------------------------------- */

/// Turn-by-turn comparison of the model's replay with the ground-truth replay.
pub fn multi_turn_checker(model: &[TurnOutcome], ground_truth: &[TurnOutcome]) -> CheckerResult {
    if model.len() != ground_truth.len() {
        return CheckerResult::fail(
            "multi_turn:force_terminated",
            format!(
                "The model result has {} turns but the ground truth has {}.",
                model.len(),
                ground_truth.len()
            ),
        );
    }

    for (turn, (model_turn, expected_turn)) in model.iter().zip(ground_truth).enumerate() {
        if expected_turn.calls.is_empty() {
            if !model_turn.calls.is_empty() {
                return CheckerResult::fail(
                    "multi_turn:empty_turn_model_response",
                    format!("Model was expected to make no function call in turn {}.", turn),
                )
                .with_details(json!({"turn": turn, "model_calls": model_turn.calls}));
            }
            continue;
        }

        let mismatches = diff_snapshots(&expected_turn.state, &model_turn.state);
        if !mismatches.is_empty() {
            return CheckerResult::fail(
                "multi_turn:instance_state_mismatch",
                format!(
                    "Model instance state does not match the ground truth after turn {}.",
                    turn
                ),
            )
            .with_details(json!({"turn": turn, "differences": mismatches}));
        }

        let model_responses: Vec<String> = model_turn.results.iter().map(|r| r.content()).collect();
        let expected_responses: Vec<String> =
            expected_turn.results.iter().map(|r| r.content()).collect();
        let missing = missing_responses(&model_responses, &expected_responses);
        if !missing.is_empty() {
            return CheckerResult::fail(
                "multi_turn:execution_response_mismatch",
                format!(
                    "Model execution results in turn {} do not contain every ground truth result.",
                    turn
                ),
            )
            .with_details(json!({
                "turn": turn,
                "missing": missing,
                "model_response": model_responses,
                "ground_truth_response": expected_responses,
            }));
        }
    }
    CheckerResult::pass()
}

/// Expected responses with no counterpart among the model's, counted with
/// multiplicity.
fn missing_responses(model: &[String], expected: &[String]) -> Vec<String> {
    let mut available: Vec<&String> = model.iter().collect();
    let mut missing = Vec::new();
    for response in expected {
        match available.iter().position(|r| *r == response) {
            Some(pos) => {
                available.swap_remove(pos);
            }
            None => missing.push(response.clone()),
        }
    }
    missing
}

/* -------------------------------- agentic --------------------------------- */

/// Like [`standardize_string`] but keeps whitespace, so that answers can be
/// matched on word boundaries. Parentheses are dropped as well.
pub fn standardize_answer(text: &str) -> String {
    text.chars()
        .filter(|c| !matches!(c, ',' | '.' | '/' | '-' | '_' | '*' | '^' | '(' | ')'))
        .flat_map(char::to_lowercase)
        .map(|c| if c == '\'' { '"' } else { c })
        .collect()
}

/// Passes when any expected answer occurs as whole words in the final answer.
pub fn agentic_checker(final_answer: &str, possible_answers: &[String]) -> CheckerResult {
    let response = standardize_answer(final_answer);
    let found = possible_answers.iter().any(|answer| {
        let pattern = format!(r"\b{}\b", regex::escape(&standardize_answer(answer)));
        Regex::new(&pattern).is_ok_and(|re| re.is_match(&response))
    });
    if found {
        return CheckerResult::pass();
    }
    CheckerResult::fail(
        "agentic:answer_not_found",
        "None of the expected answers were found in the model's final response.",
    )
    .with_details(json!({"final_answer": final_answer, "possible_answers": possible_answers}))
}

/// Last step that does not decode to a function call.
pub fn last_non_call_message<'a>(
    steps: &'a [String],
    syntax: SyntaxKind,
    config: &HarnessConfig,
) -> Option<&'a String> {
    steps.iter().rev().find(|step| {
        !matches!(decode_function_calls(step, syntax, config.xml_strictness), Ok(calls) if !calls.is_empty())
    })
}

const INFERENCE_ERROR_MESSAGE: &str =
    "Error during inference phase. Model did not output a list of model responses.";

/* ------------------------------- evaluator -------------------------------- */

/// Scores result files of one model.
#[derive(Clone)]
pub struct Evaluator {
    config: Arc<HarnessConfig>,
    registry: Arc<SimulatorRegistry>,
    model_name: String,
    syntax: SyntaxKind,
}

impl Evaluator {
    pub fn new(
        config: Arc<HarnessConfig>,
        registry: Arc<SimulatorRegistry>,
        model_name: impl Into<String>,
        syntax: SyntaxKind,
    ) -> Self {
        Evaluator {
            config,
            registry,
            model_name: model_name.into(),
            syntax,
        }
    }

    fn runner(&self) -> EntryRunner<'_> {
        EntryRunner {
            config: &self.config,
            registry: &self.registry,
            snapshot_dir: memory_snapshot_dir(&self.config.result_dir, &self.model_name),
        }
    }

    /// Scores every record of `category`. `entries` and `ground_truth` may
    /// hold more ids than `results`; the extras are ignored.
    pub fn score_category(
        &self,
        category: TestCategory,
        results: &[ResultRecord],
        entries: &[TestEntry],
        ground_truth: &[GroundTruthEntry],
    ) -> Result<CategoryReport, HarnessError> {
        let entries: IndexMap<&str, &TestEntry> = entries.iter().map(|e| (e.id.as_str(), e)).collect();
        let ground_truth: IndexMap<&str, &GroundTruthEntry> =
            ground_truth.iter().map(|g| (g.id.as_str(), g)).collect();
        let method = category.evaluation_method();

        let mut failures = Vec::new();
        let mut correct_count = 0;
        for record in results {
            let entry = entries
                .get(record.id.as_str())
                .copied()
                .ok_or_else(|| HarnessError::MissingRecord {
                    what: "test entry",
                    id: record.id.clone(),
                })?;
            let possible_answer = match method {
                EvaluationMethod::Relevance | EvaluationMethod::Irrelevance => Value::Null,
                _ => ground_truth
                    .get(record.id.as_str())
                    .map(|g| g.ground_truth.clone())
                    .ok_or_else(|| HarnessError::MissingRecord {
                        what: "ground truth",
                        id: record.id.clone(),
                    })?,
            };

            let (verdict, decoded) = match method {
                EvaluationMethod::Ast => self.check_ast(category, record, &possible_answer)?,
                EvaluationMethod::Relevance | EvaluationMethod::Irrelevance => {
                    self.check_relevance(method, record)
                }
                EvaluationMethod::MultiTurn => self.check_multi_turn(category, record, entry, &possible_answer)?,
                EvaluationMethod::Agentic => self.check_agentic(category, record, &possible_answer)?,
                EvaluationMethod::Unscored => (CheckerResult::pass(), None),
            };

            if verdict.valid {
                correct_count += 1;
                continue;
            }
            failures.push(EntryScore {
                id: record.id.clone(),
                model_name: self.model_name.clone(),
                test_category: category,
                valid: false,
                error_type: verdict.error_type().to_string(),
                error: verdict.error,
                details: verdict.details,
                prompt: prompt_without_docs(entry),
                model_result_raw: record.result.clone(),
                model_result_decoded: decoded,
                possible_answer,
                inference_log: record.metadata.get("inference_log").cloned(),
            });
        }

        let total_count = results.len();
        let accuracy = if total_count == 0 {
            0.0
        } else {
            correct_count as f64 / total_count as f64
        };
        Ok(CategoryReport {
            category,
            summary: ScoreSummary {
                accuracy,
                correct_count,
                total_count,
            },
            failures,
        })
    }

    fn check_ast(
        &self,
        category: TestCategory,
        record: &ResultRecord,
        possible_answer: &Value,
    ) -> Result<(CheckerResult, Option<Value>), HarnessError> {
        let answers: Vec<PossibleAnswer> =
            serde_json::from_value(possible_answer.clone()).map_err(|e| HarnessError::Json {
                path: ground_truth_file(&self.config.ground_truth_dir, category),
                source: e,
            })?;
        let raw = single_turn_text(&record.result);
        let calls = match decode_function_calls(&raw, self.syntax, self.config.xml_strictness) {
            Ok(calls) => calls,
            Err(e @ ParseError::WrongFormat(_)) => {
                return Ok((
                    CheckerResult::fail("ast_decoder:decoder_wrong_output_format", e.to_string()),
                    None,
                ));
            }
            Err(e) => {
                return Ok((CheckerResult::fail("ast_decoder:decoder_failed", e.to_string()), None));
            }
        };
        let decoded = calls_to_value(&calls);
        if !is_function_calling_format_output(&decoded) {
            return Ok((
                CheckerResult::fail(
                    "ast_decoder:decoder_wrong_output_format",
                    "Did not output in the specified format.",
                ),
                Some(decoded),
            ));
        }
        Ok((ast_checker(&calls, &answers, category), Some(decoded)))
    }

    fn check_relevance(&self, method: EvaluationMethod, record: &ResultRecord) -> (CheckerResult, Option<Value>) {
        let raw = single_turn_text(&record.result);
        let (has_call, decoded, decode_error) = contains_function_call(&raw, self.syntax, &self.config);
        let verdict = match method {
            EvaluationMethod::Irrelevance if has_call => CheckerResult::fail(
                "irrelevance_error:decoder_success",
                "Valid syntax. Successfully decode AST when it should not.",
            ),
            EvaluationMethod::Relevance if !has_call => CheckerResult::fail(
                "relevance_error:decoder_failed",
                format!(
                    "Invalid syntax. Failed to decode AST when it should have. {}",
                    decode_error.map(|e| e.to_string()).unwrap_or_default()
                ),
            ),
            _ => CheckerResult::pass(),
        };
        (verdict, decoded)
    }

    fn check_multi_turn(
        &self,
        category: TestCategory,
        record: &ResultRecord,
        entry: &TestEntry,
        possible_answer: &Value,
    ) -> Result<(CheckerResult, Option<Value>), HarnessError> {
        if record.is_inference_error() {
            return Ok((
                CheckerResult::fail("multi_turn:inference_error", INFERENCE_ERROR_MESSAGE),
                None,
            ));
        }
        let Some(model_result) = record.multi_turn_result() else {
            return Ok((
                CheckerResult::fail(
                    "multi_turn:parse_error",
                    "Model result is not a list of turns of model responses.",
                ),
                None,
            ));
        };
        let trace: Vec<Vec<GroundTruthCall>> = serde_json::from_value(possible_answer.clone())
            .map_err(|e| HarnessError::Json {
                path: ground_truth_file(&self.config.ground_truth_dir, category),
                source: e,
            })?;
        if record.force_quit() || model_result.len() != trace.len() {
            return Ok((
                CheckerResult::fail(
                    "multi_turn:force_terminated",
                    format!(
                        "Model was force-terminated during inference phase. The model result has {} turns, the ground truth has {}.",
                        model_result.len(),
                        trace.len()
                    ),
                ),
                None,
            ));
        }

        let runner = self.runner();
        let replay_error = |source: EntryError| HarnessError::Replay {
            id: entry.id.clone(),
            source: Box::new(source),
        };
        let expected = runner.run_ground_truth(entry, &trace).map_err(replay_error)?;
        let model = runner
            .replay_model_turns(entry, &model_result, self.syntax)
            .map_err(replay_error)?;
        let decoded = json!(model.iter().map(|turn| &turn.calls).collect::<Vec<_>>());
        Ok((multi_turn_checker(&model, &expected), Some(decoded)))
    }

    fn check_agentic(
        &self,
        category: TestCategory,
        record: &ResultRecord,
        possible_answer: &Value,
    ) -> Result<(CheckerResult, Option<Value>), HarnessError> {
        let answers: Vec<String> = match possible_answer {
            Value::String(answer) => vec![answer.clone()],
            other => serde_json::from_value(other.clone()).map_err(|e| HarnessError::Json {
                path: ground_truth_file(&self.config.ground_truth_dir, category),
                source: e,
            })?,
        };
        // a single turn of several steps
        let Some(turns) = record.multi_turn_result().filter(|turns| turns.len() == 1) else {
            return Ok((
                CheckerResult::fail("agentic:inference_error", INFERENCE_ERROR_MESSAGE),
                None,
            ));
        };
        let Some(final_answer) = last_non_call_message(&turns[0], self.syntax, &self.config) else {
            return Ok((
                CheckerResult::fail(
                    "agentic:no_last_message",
                    "Cannot find the last chat message that is not a function call.",
                ),
                None,
            ));
        };
        Ok((agentic_checker(final_answer, &answers), Some(json!(final_answer))))
    }

    /// Loads the category's files, scores them and writes the score file.
    /// `None` when the category is unscored or has no result file.
    pub fn run_category(&self, category: TestCategory) -> Result<Option<CategoryReport>, HarnessError> {
        if category.evaluation_method() == EvaluationMethod::Unscored {
            return Ok(None);
        }
        let path = result_file(&self.config.result_dir, &self.model_name, category);
        if !path.exists() {
            warn!(model = %self.model_name, category = %category, path = %path.display(), "no result file, skipping");
            return Ok(None);
        }
        info!(model = %self.model_name, category = %category, "running test");

        let results: Vec<ResultRecord> = load_json_lines_as(&path)?;
        let entries = load_test_entries(&self.config.dataset_dir, category)?;
        let ground_truth = match category.evaluation_method() {
            EvaluationMethod::Relevance | EvaluationMethod::Irrelevance => Vec::new(),
            _ => load_ground_truth(&self.config.ground_truth_dir, category)?,
        };
        let report = self.score_category(category, &results, &entries, &ground_truth)?;

        let mut lines = vec![json!(report.summary)];
        for failure in &report.failures {
            lines.push(serde_json::to_value(failure).map_err(|e| HarnessError::Json {
                path: score_file(&self.config.score_dir, &self.model_name, category),
                source: e,
            })?);
        }
        write_json_lines_to_file(
            score_file(&self.config.score_dir, &self.model_name, category),
            &lines,
        )?;
        info!(
            model = %self.model_name,
            category = %category,
            accuracy = report.summary.accuracy,
            "test completed"
        );
        Ok(Some(report))
    }

    /// Scores one category and records it in `table`.
    pub fn evaluate_task(
        &self,
        category: TestCategory,
        table: &mut LeaderboardTable,
    ) -> Result<Option<ScoreSummary>, HarnessError> {
        let Some(report) = self.run_category(category)? else {
            return Ok(None);
        };
        table.record_result(
            &self.model_name,
            category,
            report.summary.accuracy,
            report.summary.total_count,
        );
        Ok(Some(report.summary))
    }

    /// Scores categories concurrently, `num_threads` at a time.
    pub async fn evaluate_categories(
        &self,
        categories: &[TestCategory],
        table: &mut LeaderboardTable,
    ) -> Result<(), HarnessError> {
        let tasks = categories.iter().copied().map(|category| {
            let evaluator = self.clone();
            async move {
                let outcome =
                    tokio::task::spawn_blocking(move || evaluator.run_category(category)).await;
                (category, outcome)
            }
        });
        // categories run concurrently but are recorded in the order given
        let mut scored = stream::iter(tasks).buffered(self.config.num_threads.max(1));
        while let Some((category, outcome)) = scored.next().await {
            let report = outcome.map_err(|e| HarnessError::Task(format!("{category}: {e}")))??;
            if let Some(report) = report {
                table.record_result(
                    &self.model_name,
                    category,
                    report.summary.accuracy,
                    report.summary.total_count,
                );
            }
        }
        Ok(())
    }
}

/// Single-turn output is stored raw; older multi-step layouts keep the
/// candidate call in the last step of the first turn.
fn single_turn_text(result: &Value) -> String {
    match result {
        Value::String(text) => text.clone(),
        Value::Array(turns) => turns
            .first()
            .and_then(Value::as_array)
            .and_then(|steps| steps.last())
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| result.to_string()),
        other => other.to_string(),
    }
}

/// Docs are repeated across entries and long, so score files leave them out.
fn prompt_without_docs(entry: &TestEntry) -> Value {
    let mut prompt = serde_json::to_value(entry).unwrap_or_default();
    if let Value::Object(map) = &mut prompt {
        map.remove("function");
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        category::MemoryBackend,
        datasets::GroundTruthCall,
        multi_turn::INFERENCE_ERROR_PREFIX,
        utils::{load_json_lines, write_json_lines_to_file},
    };
    use pretty_assertions::assert_eq;

    fn answers(value: Value) -> Vec<PossibleAnswer> {
        serde_json::from_value(value).unwrap()
    }

    fn call(name: &str, args: Value) -> FunctionCall {
        FunctionCall::new(name, serde_json::from_value(args).unwrap())
    }

    fn record(id: &str, result: Value) -> ResultRecord {
        ResultRecord {
            id: id.to_string(),
            result,
            metadata: IndexMap::new(),
        }
    }

    fn entry(id: &str, classes: &[&str]) -> TestEntry {
        serde_json::from_value(json!({
            "id": id,
            "question": [[{"role": "user", "content": "question"}]],
            "function": [{"name": "doc"}],
            "involved_classes": classes,
        }))
        .unwrap()
    }

    fn evaluator(config: HarnessConfig) -> Evaluator {
        Evaluator::new(
            Arc::new(config),
            Arc::new(SimulatorRegistry::default()),
            "test-model",
            SyntaxKind::PythonCall,
        )
    }

    #[test]
    fn test_simple_checker_accepts_optional_and_widened_values() {
        let possible = answers(json!([{"calculate_area": {
            "base": [10],
            "height": [5.0],
            "unit": ["", "cm"],
            "shape": ["Triangle"]
        }}]));
        let model = [call(
            "calculate_area",
            json!({"base": 10.0, "height": 5, "shape": " triangle"}),
        )];
        assert!(ast_checker(&model, &possible, TestCategory::Simple).valid);
    }

    #[test]
    fn test_simple_checker_reports_what_diverged() {
        let possible = answers(json!([{"add": {"a": [1], "b": [2]}}]));

        let wrong_name = ast_checker(&[call("sum", json!({"a": 1, "b": 2}))], &possible, TestCategory::Simple);
        assert_eq!(wrong_name.error_type(), "simple_function_checker:wrong_func_name");

        let missing = ast_checker(&[call("add", json!({"a": 1}))], &possible, TestCategory::Simple);
        assert_eq!(missing.error_type(), "simple_function_checker:missing_required");

        let extra = ast_checker(
            &[call("add", json!({"a": 1, "b": 2, "c": 3}))],
            &possible,
            TestCategory::Simple,
        );
        assert_eq!(extra.error_type(), "simple_function_checker:unexpected_param");

        let wrong_value = ast_checker(&[call("add", json!({"a": 1, "b": 3}))], &possible, TestCategory::Simple);
        assert_eq!(wrong_value.error_type(), "value_error:others");
        assert!(wrong_value.details.is_some());
    }

    #[test]
    fn test_nested_values_compare_structurally() {
        let possible = answers(json!([{"book": {
            "guests": [["Alice", "Bob"]],
            "options": [{"room": ["suite", "double"], "breakfast": ["", true]}]
        }}]));
        let ok = call("book", json!({"guests": ["alice", "BOB"], "options": {"room": "double"}}));
        assert!(ast_checker(&[ok], &possible, TestCategory::Simple).valid);

        let reordered = call("book", json!({"guests": ["Bob", "Alice"], "options": {"room": "suite"}}));
        assert_eq!(
            ast_checker(&[reordered], &possible, TestCategory::Simple).error_type(),
            "value_error:list/tuple"
        );

        let unknown_key = call("book", json!({"guests": ["Alice", "Bob"], "options": {"room": "suite", "pets": 1}}));
        assert_eq!(
            ast_checker(&[unknown_key], &possible, TestCategory::Simple).error_type(),
            "value_error:dict_value"
        );
    }

    #[test]
    fn test_parallel_matches_in_any_order_but_multiple_does_not() {
        let possible = answers(json!([
            {"weather": {"city": ["Paris"]}},
            {"weather": {"city": ["Tokyo"]}}
        ]));
        let model = [
            call("weather", json!({"city": "Tokyo"})),
            call("weather", json!({"city": "Paris"})),
        ];
        assert!(ast_checker(&model, &possible, TestCategory::Parallel).valid);
        assert!(!ast_checker(&model, &possible, TestCategory::Multiple).valid);

        let short = ast_checker(&model[..1], &possible, TestCategory::Parallel);
        assert_eq!(short.error_type(), "parallel_function_checker_no_order:wrong_count");

        let duplicated = [
            call("weather", json!({"city": "Paris"})),
            call("weather", json!({"city": "Paris"})),
        ];
        let result = ast_checker(&duplicated, &possible, TestCategory::Parallel);
        assert_eq!(result.error_type(), "parallel_function_checker_no_order:cannot_find_match");
    }

    #[test]
    fn test_relevance_and_irrelevance_are_opposites() {
        let evaluator = evaluator(HarnessConfig::default());
        let entries = [entry("irrelevance_0", &[]), entry("irrelevance_1", &[]), entry("irrelevance_2", &[])];
        let results = [
            record("irrelevance_0", json!("I cannot help with that.")),
            record("irrelevance_1", json!("[]")),
            record("irrelevance_2", json!("[get_weather(city='Paris')]")),
        ];
        let report = evaluator
            .score_category(TestCategory::Irrelevance, &results, &entries, &[])
            .unwrap();
        assert_eq!(report.summary.correct_count, 2);
        assert_eq!(report.failures[0].id, "irrelevance_2");
        assert_eq!(report.failures[0].error_type, "irrelevance_error:decoder_success");

        let entries = [entry("live_relevance_0", &[]), entry("live_relevance_1", &[])];
        let results = [
            record("live_relevance_0", json!("[get_weather(city='Paris')]")),
            record("live_relevance_1", json!(format!("{} timeout", INFERENCE_ERROR_PREFIX))),
        ];
        let report = evaluator
            .score_category(TestCategory::LiveRelevance, &results, &entries, &[])
            .unwrap();
        assert_eq!(report.summary.correct_count, 1);
        assert_eq!(report.failures[0].error_type, "relevance_error:decoder_failed");
    }

    #[test]
    fn test_agentic_checker_matches_whole_words() {
        let answers = vec!["Paris".to_string()];
        assert!(agentic_checker("The capital of France is paris.", &answers).valid);
        assert!(!agentic_checker("Try the Parisian cafe", &answers).valid);
        assert!(agentic_checker("It's 1,000 km", &["1000 km".to_string()]).valid);
        assert_eq!(standardize_string("Hello, World_-'x'"), "helloworld\"x\"");
        assert_eq!(standardize_answer("April 1, (2024)"), "april 1 2024");
    }

    #[test]
    fn test_agentic_scoring_uses_last_non_call_message() {
        let evaluator = evaluator(HarnessConfig::default());
        let category = TestCategory::Memory(MemoryBackend::Kv);
        let entries = [
            entry("memory_kv_0-customer-0", &["MemoryAPI_kv"]),
            entry("memory_kv_1-customer-1", &["MemoryAPI_kv"]),
            entry("memory_kv_2-customer-2", &["MemoryAPI_kv"]),
        ];
        let ground_truth = [
            GroundTruthEntry { id: "memory_kv_0-customer-0".to_string(), ground_truth: json!(["blue"]) },
            GroundTruthEntry { id: "memory_kv_1-customer-1".to_string(), ground_truth: json!(["green"]) },
            GroundTruthEntry { id: "memory_kv_2-customer-2".to_string(), ground_truth: json!("red") },
        ];
        let results = [
            record(
                "memory_kv_0-customer-0",
                json!([["[core_memory_retrieve_all()]", "Your favourite colour is Blue."]]),
            ),
            record("memory_kv_1-customer-1", json!([["[core_memory_retrieve_all()]"]])),
            record("memory_kv_2-customer-2", json!([["red"], ["red"]])),
        ];
        let report = evaluator
            .score_category(category, &results, &entries, &ground_truth)
            .unwrap();
        assert_eq!(report.summary.correct_count, 1);
        let types: Vec<&str> = report.failures.iter().map(|f| f.error_type.as_str()).collect();
        assert_eq!(types, vec!["agentic:no_last_message", "agentic:inference_error"]);
    }

    fn wifi_entry() -> TestEntry {
        serde_json::from_value(json!({
            "id": "multi_turn_base_0",
            "question": [
                [{"role": "user", "content": "turn on wifi"}],
                [{"role": "user", "content": "thanks"}],
                [{"role": "user", "content": "add 1 and 2"}]
            ],
            "involved_classes": ["BaseApi", "MathAPI"],
        }))
        .unwrap()
    }

    fn wifi_trace() -> Vec<Vec<GroundTruthCall>> {
        serde_json::from_value(json!([["turn_on_wifi()"], [], ["add(a=1, b=2)"]])).unwrap()
    }

    fn replay(model_result: Value) -> CheckerResult {
        let config = HarnessConfig::default();
        let registry = SimulatorRegistry::default();
        let runner = EntryRunner {
            config: &config,
            registry: &registry,
            snapshot_dir: "unused".into(),
        };
        let entry = wifi_entry();
        let model_result: Vec<Vec<String>> = serde_json::from_value(model_result).unwrap();
        let expected = runner.run_ground_truth(&entry, &wifi_trace()).unwrap();
        let model = runner
            .replay_model_turns(&entry, &model_result, SyntaxKind::PythonCall)
            .unwrap();
        multi_turn_checker(&model, &expected)
    }

    #[test]
    fn test_multi_turn_checker_accepts_matching_replay() {
        let result = replay(json!([
            ["[turn_on_wifi()]", "Wi-Fi is on."],
            ["You're welcome."],
            ["[add(a=1, b=2)]", "It is 3."]
        ]));
        assert!(result.valid, "{:?}", result);
    }

    #[test]
    fn test_multi_turn_checker_flags_state_mismatch() {
        let result = replay(json!([["I won't."], ["Ok."], ["[add(a=1, b=2)]", "3"]]));
        assert_eq!(result.error_type(), "multi_turn:instance_state_mismatch");
    }

    #[test]
    fn test_multi_turn_checker_flags_calls_in_empty_turn() {
        let result = replay(json!([
            ["[turn_on_wifi()]", "done"],
            ["[add(a=5, b=5)]", "10"],
            ["[add(a=1, b=2)]", "3"]
        ]));
        assert_eq!(result.error_type(), "multi_turn:empty_turn_model_response");
    }

    #[test]
    fn test_multi_turn_checker_flags_missing_responses() {
        let result = replay(json!([
            ["[turn_on_wifi()]", "done"],
            ["ok"],
            ["[add(a=2, b=2)]", "4"]
        ]));
        assert_eq!(result.error_type(), "multi_turn:execution_response_mismatch");
        let details = result.details.unwrap();
        assert_eq!(details["turn"], json!(2));
    }

    #[test]
    fn test_multi_turn_scoring_handles_bad_records() {
        let evaluator = evaluator(HarnessConfig::default());
        let entry = wifi_entry();
        let ground_truth = [GroundTruthEntry {
            id: entry.id.clone(),
            ground_truth: json!([["turn_on_wifi()"], [], ["add(a=1, b=2)"]]),
        }];

        let mut forced = record(&entry.id, json!([["[turn_on_wifi()]"], [], []]));
        forced.metadata.insert("force_quit".to_string(), json!(true));
        let failed = record(&entry.id, json!(format!("{} boom", INFERENCE_ERROR_PREFIX)));
        let garbled = record(&entry.id, json!({"not": "turns"}));

        for (record, expected) in [
            (forced, "multi_turn:force_terminated"),
            (failed, "multi_turn:inference_error"),
            (garbled, "multi_turn:parse_error"),
        ] {
            let report = evaluator
                .score_category(
                    TestCategory::MultiTurnBase,
                    std::slice::from_ref(&record),
                    std::slice::from_ref(&entry),
                    &ground_truth,
                )
                .unwrap();
            assert_eq!(report.failures[0].error_type, expected);
            assert!(report.failures[0].prompt.get("function").is_none());
        }
    }

    #[test]
    fn test_evaluate_task_writes_score_file_and_records_result() {
        let dir = tempfile::tempdir().unwrap();
        let config = HarnessConfig {
            result_dir: dir.path().join("result"),
            score_dir: dir.path().join("score"),
            dataset_dir: dir.path().join("data"),
            ground_truth_dir: dir.path().join("data/possible_answer"),
            ..HarnessConfig::default()
        };
        let category = TestCategory::Simple;
        write_json_lines_to_file(
            crate::paths::dataset_file(&config.dataset_dir, category),
            &[entry("simple_python_0", &[]), entry("simple_python_1", &[])],
        )
        .unwrap();
        write_json_lines_to_file(
            ground_truth_file(&config.ground_truth_dir, category),
            &[
                json!({"id": "simple_python_0", "ground_truth": [{"add": {"a": [1], "b": [2]}}]}),
                json!({"id": "simple_python_1", "ground_truth": [{"add": {"a": [3], "b": [4]}}]}),
            ],
        )
        .unwrap();
        write_json_lines_to_file(
            result_file(&config.result_dir, "test-model", category),
            &[
                record("simple_python_0", json!("[add(a=1, b=2)]")),
                record("simple_python_1", json!("add(a=3, b=")),
            ],
        )
        .unwrap();

        let evaluator = evaluator(config.clone());
        let mut table = LeaderboardTable::new();
        let summary = evaluator.evaluate_task(category, &mut table).unwrap().unwrap();
        assert_eq!(summary.correct_count, 1);
        assert_eq!(summary.total_count, 2);
        assert_eq!(table.get_category_score("test-model", category).accuracy, 0.5);

        let lines = load_json_lines(score_file(&config.score_dir, "test-model", category)).unwrap();
        assert_eq!(lines[0], json!({"accuracy": 0.5, "correct_count": 1, "total_count": 2}));
        assert_eq!(lines[1]["id"], json!("simple_python_1"));
        assert_eq!(lines[1]["error_type"], json!("ast_decoder:decoder_failed"));

        // no result file and unscored categories are skipped
        assert!(evaluator.evaluate_task(TestCategory::Multiple, &mut table).unwrap().is_none());
        assert!(
            evaluator
                .evaluate_task(TestCategory::MemoryPrereq(MemoryBackend::Kv), &mut table)
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_evaluate_categories_records_every_scored_category() {
        let dir = tempfile::tempdir().unwrap();
        let config = HarnessConfig {
            result_dir: dir.path().join("result"),
            score_dir: dir.path().join("score"),
            dataset_dir: dir.path().join("data"),
            num_threads: 2,
            ..HarnessConfig::default()
        };
        for (category, id) in [
            (TestCategory::Irrelevance, "irrelevance_0"),
            (TestCategory::LiveIrrelevance, "live_irrelevance_0"),
        ] {
            write_json_lines_to_file(
                crate::paths::dataset_file(&config.dataset_dir, category),
                &[entry(id, &[])],
            )
            .unwrap();
            write_json_lines_to_file(
                result_file(&config.result_dir, "test-model", category),
                &[record(id, json!("No function fits."))],
            )
            .unwrap();
        }

        let evaluator = evaluator(config);
        let mut table = LeaderboardTable::new();
        evaluator
            .evaluate_categories(
                &[TestCategory::Irrelevance, TestCategory::LiveIrrelevance, TestCategory::Simple],
                &mut table,
            )
            .await
            .unwrap();
        assert_eq!(table.get_category_score("test-model", TestCategory::Irrelevance).accuracy, 1.0);
        assert_eq!(
            table.get_category_score("test-model", TestCategory::LiveIrrelevance).total_count,
            1
        );
        assert!(
            table
                .get_category_score("test-model", TestCategory::Simple)
                .display_accuracy
                .is_not_available()
        );
    }

    #[tokio::test]
    async fn test_evaluate_categories_records_in_requested_order() {
        let dir = tempfile::tempdir().unwrap();
        let config = HarnessConfig {
            result_dir: dir.path().join("result"),
            score_dir: dir.path().join("score"),
            dataset_dir: dir.path().join("data"),
            num_threads: 4,
            ..HarnessConfig::default()
        };
        let categories = [
            TestCategory::LiveIrrelevance,
            TestCategory::Irrelevance,
            TestCategory::LiveRelevance,
        ];
        for category in categories {
            let id = format!("{category}_0");
            write_json_lines_to_file(
                crate::paths::dataset_file(&config.dataset_dir, category),
                &[entry(&id, &[])],
            )
            .unwrap();
            write_json_lines_to_file(
                result_file(&config.result_dir, "test-model", category),
                &[record(&id, json!("No function fits."))],
            )
            .unwrap();
        }

        let evaluator = evaluator(config);
        for _ in 0..3 {
            let mut table = LeaderboardTable::new();
            evaluator.evaluate_categories(&categories, &mut table).await.unwrap();
            let recorded: Vec<TestCategory> = table.models["test-model"].keys().copied().collect();
            assert_eq!(recorded, categories);
        }
    }
}

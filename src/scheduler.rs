use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap, HashSet},
    path::{Path, PathBuf},
    sync::Arc,
};

use indexmap::IndexMap;
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::{
    category::{TestCategory, extract_test_category_from_id, sort_key},
    config::HarnessConfig,
    datasets::TestEntry,
    error::{EntryError, HandlerError, HarnessError, SimulatorError},
    handler::ModelHandler,
    ledger::{CompletionLedger, LedgerState},
    multi_turn::{EntryRunner, ResultRecord, inference_error_record},
    paths::{ledger_file, memory_snapshot_dir, result_file},
    simulator::SimulatorRegistry,
    utils::{append_json_line, load_json_lines_as, write_json_lines_to_file},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryStatus {
    Pending,
    Ready,
    Running,
    Done,
    Errored,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct GenerationSummary {
    pub completed: usize,
    pub errored: usize,
    pub skipped: usize,
}

/// Ready-queue key: priority band, then category, then insertion order.
type ReadyKey = Reverse<(u8, String, usize)>;

struct ScheduledEntry {
    entry: Arc<TestEntry>,
    category: TestCategory,
    status: EntryStatus,
    pending: usize,
    dependents: Vec<usize>,
}

/// Runs every entry for one model with at most `num_threads` in flight.
/// Entries start only after all their dependencies are done.
pub struct Scheduler {
    config: Arc<HarnessConfig>,
    registry: Arc<SimulatorRegistry>,
    handler: Arc<dyn ModelHandler>,
}

impl Scheduler {
    pub fn new(
        config: Arc<HarnessConfig>,
        registry: Arc<SimulatorRegistry>,
        handler: Arc<dyn ModelHandler>,
    ) -> Self {
        Scheduler {
            config,
            registry,
            handler,
        }
    }

    fn model_name(&self) -> &str {
        self.handler.model_name()
    }

    fn snapshot_dir(&self) -> PathBuf {
        memory_snapshot_dir(&self.config.result_dir, self.model_name())
    }

    /// Fatal checks done before anything is scheduled.
    fn preflight(
        &self,
        entries: &[TestEntry],
        ledger: &CompletionLedger,
    ) -> Result<Vec<TestCategory>, HarnessError> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut categories = Vec::with_capacity(entries.len());
        for entry in entries {
            if !seen.insert(entry.id.as_str()) {
                return Err(HarnessError::DuplicateEntry(entry.id.clone()));
            }
            sort_key(&entry.id)?;
            categories.push(entry.category()?);
            for class_name in &entry.involved_classes {
                if !self.registry.contains(class_name) {
                    return Err(SimulatorError::UnknownClass(class_name.clone()).into());
                }
            }
        }

        let snapshot_dir = self.snapshot_dir();
        for entry in entries {
            // a memory entry's prerequisites share its scenario folder
            let scenario_dir = match entry.memory_scenario() {
                Some(scenario) => snapshot_dir.join(scenario),
                None => snapshot_dir.clone(),
            };
            for dependency in &entry.depends_on {
                if seen.contains(dependency.as_str()) {
                    continue;
                }
                let done = ledger.state(dependency) == LedgerState::Done;
                let needs_snapshot = extract_test_category_from_id(dependency)
                    .is_ok_and(TestCategory::is_memory_prereq);
                let snapshot_ok =
                    !needs_snapshot || scenario_dir.join(format!("{}.json", dependency)).exists();
                if !(done && snapshot_ok) {
                    return Err(HarnessError::MissingDependency {
                        entry: entry.id.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }

        detect_cycle(entries)?;
        Ok(categories)
    }

    pub async fn run(&self, entries: Vec<TestEntry>) -> Result<GenerationSummary, HarnessError> {
        let mut ledger = CompletionLedger::open(ledger_file(&self.config.result_dir, self.model_name()))?;
        let total_loaded = entries.len();
        let entries: Vec<TestEntry> = entries
            .into_iter()
            .filter(|e| ledger.should_run(&e.id, self.config.allow_overwrite))
            .collect();
        let mut summary = GenerationSummary {
            skipped: total_loaded - entries.len(),
            ..Default::default()
        };
        let categories = self.preflight(&entries, &ledger)?;

        let index_of: HashMap<String, usize> = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.id.clone(), i))
            .collect();
        let mut scheduled: Vec<ScheduledEntry> = entries
            .into_iter()
            .zip(categories)
            .map(|(entry, category)| ScheduledEntry {
                entry: Arc::new(entry),
                category,
                status: EntryStatus::Pending,
                pending: 0,
                dependents: Vec::new(),
            })
            .collect();
        for i in 0..scheduled.len() {
            let deps: Vec<usize> = scheduled[i]
                .entry
                .depends_on
                .iter()
                .filter_map(|d| index_of.get(d).copied())
                .collect();
            scheduled[i].pending = deps.len();
            for dep in deps {
                scheduled[dep].dependents.push(i);
            }
        }

        // Enqueue in sort-key order so insertion order follows entry index.
        let mut order: Vec<usize> = (0..scheduled.len()).collect();
        order.sort_by_cached_key(|&i| sort_key(&scheduled[i].entry.id).ok());
        let mut sequence = 0usize;
        let mut ready: BinaryHeap<(ReadyKey, usize)> = BinaryHeap::new();
        let mut enqueue = |ready: &mut BinaryHeap<(ReadyKey, usize)>, s: &mut ScheduledEntry, i: usize| {
            s.status = EntryStatus::Ready;
            ready.push((
                Reverse((s.category.kind().priority(), s.category.name(), sequence)),
                i,
            ));
            sequence += 1;
        };
        for &i in &order {
            if scheduled[i].pending == 0 {
                enqueue(&mut ready, &mut scheduled[i], i);
            }
        }

        let total = scheduled.len();
        let num_threads = self.config.num_threads.max(1);
        let mut touched: Vec<TestCategory> = Vec::new();
        let mut in_flight: JoinSet<(usize, Result<ResultRecord, EntryError>)> = JoinSet::new();
        info!(
            model = self.model_name(),
            "Generating {} entries ({} already done)", total, summary.skipped
        );

        loop {
            while in_flight.len() < num_threads {
                let Some((_, i)) = ready.pop() else { break };
                scheduled[i].status = EntryStatus::Running;
                let entry = scheduled[i].entry.clone();
                let handler = self.handler.clone();
                let config = self.config.clone();
                let registry = self.registry.clone();
                let snapshot_dir = self.snapshot_dir();
                in_flight.spawn(async move {
                    let worker = tokio::spawn(async move {
                        let runner = EntryRunner {
                            config: &config,
                            registry: &registry,
                            snapshot_dir,
                        };
                        runner.run_entry(&entry, handler.as_ref()).await
                    });
                    let outcome = match worker.await {
                        Ok(result) => result,
                        Err(e) => Err(EntryError::Handler(HandlerError::Join(e.to_string()))),
                    };
                    (i, outcome)
                });
            }

            let Some(joined) = in_flight.join_next().await else {
                break;
            };
            let (i, outcome) = match joined {
                Ok(pair) => pair,
                // the outer task only awaits the worker, so this means the runtime is shutting down
                Err(e) => {
                    error!("scheduler task failed: {}", e);
                    continue;
                }
            };

            let entry_id = scheduled[i].entry.id.clone();
            let record = match outcome {
                Ok(record) => {
                    scheduled[i].status = EntryStatus::Done;
                    ledger.mark(&entry_id, LedgerState::Done);
                    summary.completed += 1;
                    record
                }
                Err(e) => {
                    error!(entry = %entry_id, "Error during inference: {:#}", e);
                    scheduled[i].status = EntryStatus::Errored;
                    ledger.mark(&entry_id, LedgerState::Errored);
                    summary.errored += 1;
                    inference_error_record(&entry_id, &e)
                }
            };
            self.write_record(scheduled[i].category, &record, &mut touched)?;
            ledger.save()?;
            info!(
                "Entry {} finished. {}/{} completed.",
                entry_id,
                summary.completed + summary.errored,
                total
            );

            if scheduled[i].status == EntryStatus::Done {
                let dependents = scheduled[i].dependents.clone();
                for d in dependents {
                    scheduled[d].pending -= 1;
                    if scheduled[d].pending == 0 && scheduled[d].status == EntryStatus::Pending {
                        enqueue(&mut ready, &mut scheduled[d], d);
                    }
                }
            }
        }

        // Entries whose dependencies errored never became ready.
        for i in 0..scheduled.len() {
            if scheduled[i].status != EntryStatus::Pending {
                continue;
            }
            let blocked_on = scheduled[i]
                .entry
                .depends_on
                .iter()
                .find(|d| {
                    index_of
                        .get(*d)
                        .is_some_and(|&j| scheduled[j].status != EntryStatus::Done)
                })
                .cloned()
                .unwrap_or_default();
            warn!(entry = %scheduled[i].entry.id, dependency = %blocked_on, "dependency did not complete");
            let error = EntryError::Harness(HarnessError::MissingDependency {
                entry: scheduled[i].entry.id.clone(),
                dependency: blocked_on,
            });
            let record = inference_error_record(&scheduled[i].entry.id, &error);
            scheduled[i].status = EntryStatus::Errored;
            ledger.mark(&scheduled[i].entry.id, LedgerState::Errored);
            summary.errored += 1;
            self.write_record(scheduled[i].category, &record, &mut touched)?;
        }
        ledger.save()?;

        for category in touched {
            sort_result_file(&result_file(&self.config.result_dir, self.model_name(), category))?;
        }
        Ok(summary)
    }

    fn write_record(
        &self,
        category: TestCategory,
        record: &ResultRecord,
        touched: &mut Vec<TestCategory>,
    ) -> Result<(), HarnessError> {
        if !touched.contains(&category) {
            touched.push(category);
        }
        append_json_line(
            result_file(&self.config.result_dir, self.model_name(), category),
            record,
        )
    }
}

/// Rewrites a result file sorted by entry id, keeping the latest record per id.
pub fn sort_result_file(path: &Path) -> Result<(), HarnessError> {
    let records: Vec<ResultRecord> = load_json_lines_as(path)?;
    let mut latest: IndexMap<String, ResultRecord> = IndexMap::new();
    for record in records {
        latest.insert(record.id.clone(), record);
    }
    let mut records: Vec<ResultRecord> = latest.into_values().collect();
    records.sort_by_cached_key(|r| sort_key(&r.id).ok());
    write_json_lines_to_file(path, &records)
}

/// Kahn's algorithm over the dependency edges between `entries`.
fn detect_cycle(entries: &[TestEntry]) -> Result<(), HarnessError> {
    let index_of: HashMap<&str, usize> = entries
        .iter()
        .enumerate()
        .map(|(i, e)| (e.id.as_str(), i))
        .collect();
    let mut indegree = vec![0usize; entries.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); entries.len()];
    for (i, entry) in entries.iter().enumerate() {
        for dep in &entry.depends_on {
            if let Some(&j) = index_of.get(dep.as_str()) {
                indegree[i] += 1;
                dependents[j].push(i);
            }
        }
    }
    let mut stack: Vec<usize> = (0..entries.len()).filter(|&i| indegree[i] == 0).collect();
    let mut visited = 0;
    while let Some(i) = stack.pop() {
        visited += 1;
        for &d in &dependents[i] {
            indegree[d] -= 1;
            if indegree[d] == 0 {
                stack.push(d);
            }
        }
    }
    if visited == entries.len() {
        return Ok(());
    }
    let stuck = indegree
        .iter()
        .position(|&n| n > 0)
        .map(|i| entries[i].id.clone())
        .unwrap_or_default();
    Err(HarnessError::DependencyCycle(stuck))
}

#[cfg(test)]
mod tests {
    use std::{
        sync::Mutex,
        time::{Duration, Instant},
    };

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::{
        decode::SyntaxKind,
        handler::{ClosureHandler, ModelResponse, QueryRequest},
    };

    fn entry(id: &str, depends_on: &[&str]) -> TestEntry {
        serde_json::from_value(json!({
            "id": id,
            "question": [[{"role": "user", "content": id}]],
            "depends_on": depends_on,
        }))
        .unwrap()
    }

    fn config(dir: &std::path::Path, num_threads: usize) -> Arc<HarnessConfig> {
        Arc::new(HarnessConfig {
            num_threads,
            result_dir: dir.to_path_buf(),
            ..HarnessConfig::default()
        })
    }

    /// Sleeps a varying amount per query and records when each entry's
    /// query started and finished.
    struct TimingHandler {
        seed: u64,
        events: Mutex<HashMap<String, (Instant, Instant)>>,
    }

    #[async_trait]
    impl ModelHandler for TimingHandler {
        fn model_name(&self) -> &str {
            "timing"
        }

        fn syntax(&self) -> SyntaxKind {
            SyntaxKind::PythonCall
        }

        async fn query(&self, request: QueryRequest) -> Result<ModelResponse, HandlerError> {
            let start = Instant::now();
            let salt = request.entry_id.bytes().map(u64::from).sum::<u64>();
            let delay = (self.seed.wrapping_mul(6364136223846793005).wrapping_add(salt)) % 4;
            tokio::time::sleep(Duration::from_millis(delay)).await;
            self.events
                .lock()
                .unwrap()
                .insert(request.entry_id.clone(), (start, Instant::now()));
            Ok(ModelResponse::text("[]"))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_dependent_never_starts_before_dependency_finishes() {
        for seed in 0..100u64 {
            let dir = tempfile::tempdir().unwrap();
            let handler = Arc::new(TimingHandler {
                seed,
                events: Mutex::new(HashMap::new()),
            });
            let scheduler = Scheduler::new(
                config(dir.path(), 4),
                Arc::new(SimulatorRegistry::default()),
                handler.clone(),
            );
            let entries = vec![
                entry("simple_python_1", &["simple_python_0"]),
                entry("simple_python_2", &[]),
                entry("simple_python_0", &[]),
                entry("simple_python_3", &[]),
            ];
            let summary = scheduler.run(entries).await.unwrap();
            assert_eq!(summary.completed, 4);

            let events = handler.events.lock().unwrap();
            let (_, a_done) = events["simple_python_0"];
            let (b_start, _) = events["simple_python_1"];
            assert!(b_start > a_done, "seed {seed}: B started before A completed");
        }
    }

    #[tokio::test]
    async fn test_results_are_sorted_and_resumable() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(Mutex::new(0usize));
        let counter = calls.clone();
        let handler = Arc::new(ClosureHandler::new("m", move |_| {
            *counter.lock().unwrap() += 1;
            Ok(ModelResponse::text("[]"))
        }));
        let entries = || vec![entry("simple_python_10", &[]), entry("simple_python_2", &[])];
        let scheduler = Scheduler::new(
            config(dir.path(), 2),
            Arc::new(SimulatorRegistry::default()),
            handler,
        );
        scheduler.run(entries()).await.unwrap();

        let path = result_file(dir.path(), "m", TestCategory::Simple);
        let records: Vec<ResultRecord> = load_json_lines_as(&path).unwrap();
        let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["simple_python_2", "simple_python_10"]);

        let summary = scheduler.run(entries()).await.unwrap();
        assert_eq!(summary.skipped, 2);
        assert_eq!(*calls.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_inference_error_is_recorded_and_dependents_blocked() {
        let dir = tempfile::tempdir().unwrap();
        let handler = Arc::new(ClosureHandler::new("m", |request| {
            if request.entry_id == "simple_python_0" {
                Err(HandlerError::MalformedResponse("not json".to_string()))
            } else {
                Ok(ModelResponse::text("[]"))
            }
        }));
        let scheduler = Scheduler::new(
            config(dir.path(), 2),
            Arc::new(SimulatorRegistry::default()),
            handler,
        );
        let summary = scheduler
            .run(vec![
                entry("simple_python_0", &[]),
                entry("simple_python_1", &["simple_python_0"]),
                entry("simple_python_2", &[]),
            ])
            .await
            .unwrap();
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.errored, 2);

        let records: Vec<ResultRecord> =
            load_json_lines_as(result_file(dir.path(), "m", TestCategory::Simple)).unwrap();
        assert!(records[0].is_inference_error());
        assert!(records[0].metadata.contains_key("traceback"));
        assert!(records[1].is_inference_error());
        assert!(!records[2].is_inference_error());

        let ledger = CompletionLedger::open(ledger_file(dir.path(), "m")).unwrap();
        assert_eq!(ledger.state("simple_python_0"), LedgerState::Errored);
        assert_eq!(ledger.state("simple_python_2"), LedgerState::Done);
    }

    #[tokio::test]
    async fn test_preflight_rejects_bad_runs() {
        let dir = tempfile::tempdir().unwrap();
        let handler = Arc::new(ClosureHandler::new("m", |_| Ok(ModelResponse::text("[]"))));
        let scheduler = Scheduler::new(
            config(dir.path(), 1),
            Arc::new(SimulatorRegistry::default()),
            handler,
        );

        let cycle = scheduler
            .run(vec![
                entry("simple_python_0", &["simple_python_1"]),
                entry("simple_python_1", &["simple_python_0"]),
            ])
            .await;
        assert!(matches!(cycle, Err(HarnessError::DependencyCycle(_))));

        let missing = scheduler
            .run(vec![entry("simple_python_0", &["simple_python_9"])])
            .await;
        assert!(matches!(missing, Err(HarnessError::MissingDependency { .. })));

        let mut unsupported = entry("multi_turn_base_0", &[]);
        unsupported.involved_classes = vec!["TravelAPI".to_string()];
        let unsupported = scheduler.run(vec![unsupported]).await;
        assert!(matches!(
            unsupported,
            Err(HarnessError::Simulator(SimulatorError::UnknownClass(_)))
        ));

        let duplicate = scheduler
            .run(vec![entry("simple_python_0", &[]), entry("simple_python_0", &[])])
            .await;
        assert!(matches!(duplicate, Err(HarnessError::DuplicateEntry(_))));
    }

    #[tokio::test]
    async fn test_memory_prereq_chain_runs_before_scored_entry() {
        let dir = tempfile::tempdir().unwrap();
        let memory_entry = |id: &str, deps: &[&str], content: &str| -> TestEntry {
            serde_json::from_value(json!({
                "id": id,
                "question": [[{"role": "user", "content": content}]],
                "involved_classes": ["MemoryAPI_kv"],
                "depends_on": deps,
            }))
            .unwrap()
        };
        let handler = Arc::new(ClosureHandler::new("m", |request| {
            if request.step > 0 {
                return Ok(ModelResponse::text("Saved."));
            }
            let text = match request.entry_id.as_str() {
                "memory_kv_prereq_0-notes-0" => "[long_term_memory_add(key='pet', value='cat')]",
                "memory_kv_prereq_1-notes-1" => "[short_term_memory_add(value='likes tea')]",
                _ => "[long_term_memory_retrieve(key='pet')]",
            };
            Ok(ModelResponse::text(text))
        }));
        let scheduler = Scheduler::new(
            config(dir.path(), 3),
            Arc::new(SimulatorRegistry::default()),
            handler,
        );
        let summary = scheduler
            .run(vec![
                memory_entry(
                    "memory_kv_0-notes-0",
                    &["memory_kv_prereq_0-notes-0", "memory_kv_prereq_1-notes-1"],
                    "what pet?",
                ),
                memory_entry(
                    "memory_kv_prereq_1-notes-1",
                    &["memory_kv_prereq_0-notes-0"],
                    "remember tea",
                ),
                memory_entry("memory_kv_prereq_0-notes-0", &[], "remember cat"),
            ])
            .await
            .unwrap();
        assert_eq!(summary.completed, 3);

        let snapshot_dir = memory_snapshot_dir(dir.path(), "m");
        let final_state: serde_json::Value = crate::utils::read_json(
            snapshot_dir.join("notes").join("memory_kv_prereq_final.json"),
        )
        .unwrap();
        assert_eq!(final_state["long_term_memory"]["pet"], json!("cat"));
        assert_eq!(final_state["short_term_memory"]["likes tea"], json!("likes tea"));
    }
}

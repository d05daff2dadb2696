use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::LazyLock,
};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::{
    category::{extract_test_category_from_id, is_first_memory_prereq_entry},
    error::{ExecutionError, SimulatorError},
    simulator::{DispatchTable, NoArgs, ReturnValue, ScenarioContext, Simulator, snapshot_fields},
};

pub const MAX_SHORT_TERM_MEMORY_SIZE: usize = 7;
pub const MAX_SHORT_TERM_MEMORY_ENTRY_LENGTH: usize = 300;
pub const MAX_LONG_TERM_MEMORY_SIZE: usize = 100;
pub const MAX_LONG_TERM_MEMORY_ENTRY_LENGTH: usize = 2000;

const BM25_K1: f64 = 1.5;
const BM25_B: f64 = 0.75;
const BM25_DELTA: f64 = 1.0;

/// Key-value memory backend. State survives across entries of the same
/// scenario through snapshot files in the model's `memory_snapshot` folder.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MemoryApi {
    pub short_term_memory: IndexMap<String, String>,
    pub long_term_memory: IndexMap<String, String>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValueArgs {
    pub value: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeyArgs {
    pub key: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeyValueArgs {
    pub key: String,
    pub value: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SearchArgs {
    pub query: String,
    #[serde(default = "default_k")]
    pub k: usize,
}

fn default_k() -> usize {
    5
}

fn status(message: &str) -> Result<Value, String> {
    Ok(json!({ "status": message }))
}

// Soft failures are reported to the model as an `error` payload, not as a failed call.
fn soft_error(message: &str) -> Result<Value, String> {
    Ok(json!({ "error": message }))
}

fn tokenize(text: &str) -> Vec<String> {
    text.replace('_', " ")
        .to_lowercase()
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// BM25+ scores of `query` against each document of `corpus`, in corpus order.
pub fn bm25_plus_scores(query: &str, corpus: &[&str]) -> Vec<f64> {
    let documents: Vec<Vec<String>> = corpus.iter().map(|d| tokenize(d)).collect();
    if documents.is_empty() {
        return Vec::new();
    }
    let n = documents.len() as f64;
    let avg_len = documents.iter().map(Vec::len).sum::<usize>() as f64 / n;

    let mut document_frequency: HashMap<&str, usize> = HashMap::new();
    for doc in &documents {
        let mut seen: Vec<&str> = doc.iter().map(String::as_str).collect();
        seen.sort_unstable();
        seen.dedup();
        for term in seen {
            *document_frequency.entry(term).or_default() += 1;
        }
    }

    let query_terms = tokenize(query);
    documents
        .iter()
        .map(|doc| {
            let len_norm = if avg_len > 0.0 {
                1.0 - BM25_B + BM25_B * doc.len() as f64 / avg_len
            } else {
                1.0
            };
            query_terms
                .iter()
                .map(|term| {
                    let df = document_frequency.get(term.as_str()).copied().unwrap_or(0) as f64;
                    let idf = if df == 0.0 { 0.0 } else { ((n + 1.0) / df).ln() };
                    let tf = doc.iter().filter(|t| *t == term).count() as f64;
                    idf * (BM25_DELTA + tf * (BM25_K1 + 1.0) / (BM25_K1 * len_norm + tf))
                })
                .sum()
        })
        .collect()
}

/// Top-`k` documents by BM25+ score as `{"ranked_results": [[score, text], ...]}`.
pub fn similarity_search(query: &str, corpus: &[&str], k: usize) -> Value {
    let scores = bm25_plus_scores(query, corpus);
    let mut ranked: Vec<(f64, &str)> = scores.into_iter().zip(corpus.iter().copied()).collect();
    // Stable sort keeps corpus order among ties.
    ranked.sort_by(|a, b| b.0.total_cmp(&a.0));
    ranked.truncate(k);
    json!({ "ranked_results": ranked })
}

impl MemoryApi {
    pub fn short_term_memory_add(&mut self, value: String) -> Result<Value, String> {
        if self.short_term_memory.len() >= MAX_SHORT_TERM_MEMORY_SIZE {
            return soft_error("Short term memory is full. Please clear some entries.");
        }
        if value.chars().count() > MAX_SHORT_TERM_MEMORY_ENTRY_LENGTH {
            return soft_error(&format!(
                "Entry is too long. Please shorten the entry to less than {} characters.",
                MAX_SHORT_TERM_MEMORY_ENTRY_LENGTH
            ));
        }
        self.short_term_memory.insert(value.clone(), value);
        status("Entry added.")
    }

    pub fn short_term_memory_remove(&mut self, value: &str) -> Result<Value, String> {
        match self.short_term_memory.shift_remove(value) {
            Some(_) => status("Entry removed."),
            None => soft_error("Entry not found."),
        }
    }

    pub fn short_term_memory_clear(&mut self) -> Result<Value, String> {
        self.short_term_memory.clear();
        status("Short term memory cleared.")
    }

    pub fn short_term_memory_search(&self, query: &str, k: usize) -> Result<Value, String> {
        let corpus: Vec<&str> = self.short_term_memory.values().map(String::as_str).collect();
        Ok(similarity_search(query, &corpus, k))
    }

    pub fn short_term_memory_retrieve_all(&self) -> Result<Value, String> {
        let values: Vec<&String> = self.short_term_memory.values().collect();
        Ok(json!({ "values": values }))
    }

    pub fn long_term_memory_add(&mut self, key: String, value: String) -> Result<Value, String> {
        if self.long_term_memory.len() >= MAX_LONG_TERM_MEMORY_SIZE {
            return soft_error("Long term memory is full. Please clear some entries.");
        }
        if value.chars().count() > MAX_LONG_TERM_MEMORY_ENTRY_LENGTH {
            return soft_error(&format!(
                "Entry is too long. Please shorten the entry to less than {} characters.",
                MAX_LONG_TERM_MEMORY_ENTRY_LENGTH
            ));
        }
        if self.long_term_memory.contains_key(&key) {
            return soft_error("Key name must be unique.");
        }
        self.long_term_memory.insert(key, value);
        status("Key added.")
    }

    pub fn long_term_memory_remove(&mut self, key: &str) -> Result<Value, String> {
        match self.long_term_memory.shift_remove(key) {
            Some(_) => status("Key removed."),
            None => soft_error("Key not found."),
        }
    }

    pub fn long_term_memory_replace(&mut self, key: &str, value: String) -> Result<Value, String> {
        if value.chars().count() > MAX_LONG_TERM_MEMORY_ENTRY_LENGTH {
            return soft_error(&format!(
                "Entry is too long. Please shorten the entry to less than {} characters.",
                MAX_LONG_TERM_MEMORY_ENTRY_LENGTH
            ));
        }
        match self.long_term_memory.get_mut(key) {
            Some(slot) => {
                *slot = value;
                status("Key replaced.")
            }
            None => soft_error("Key not found."),
        }
    }

    pub fn long_term_memory_clear(&mut self) -> Result<Value, String> {
        self.long_term_memory.clear();
        status("Long term memory cleared.")
    }

    pub fn long_term_memory_retrieve(&self, key: &str) -> Result<Value, String> {
        match self.long_term_memory.get(key) {
            Some(value) => Ok(json!({ "value": value })),
            None => soft_error("Key not found."),
        }
    }

    pub fn long_term_memory_list_keys(&self) -> Result<Value, String> {
        let keys: Vec<&String> = self.long_term_memory.keys().collect();
        Ok(json!({ "keys": keys }))
    }

    pub fn long_term_memory_key_search(&self, query: &str, k: usize) -> Result<Value, String> {
        let corpus: Vec<&str> = self.long_term_memory.keys().map(String::as_str).collect();
        Ok(similarity_search(query, &corpus, k))
    }

    fn load_snapshot_file(&mut self, path: &Path) -> Result<(), SimulatorError> {
        let content = fs::read_to_string(path).map_err(|source| SimulatorError::SnapshotIo {
            path: path.to_path_buf(),
            source,
        })?;
        *self = serde_json::from_str(&content)?;
        Ok(())
    }

    fn write_snapshot_file(&self, path: PathBuf) -> Result<(), SimulatorError> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(&path, content).map_err(|source| SimulatorError::SnapshotIo { path, source })
    }
}

/// Removes everything inside `dir`, creating it if missing.
fn reset_snapshot_dir(dir: &Path) -> Result<(), SimulatorError> {
    let io_err = |source| SimulatorError::SnapshotIo {
        path: dir.to_path_buf(),
        source,
    };
    if dir.exists() {
        for item in fs::read_dir(dir).map_err(io_err)? {
            let path = item.map_err(io_err)?.path();
            let removed = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            removed.map_err(|source| SimulatorError::SnapshotIo {
                path: path.clone(),
                source,
            })?;
        }
    }
    fs::create_dir_all(dir).map_err(io_err)
}

static MEMORY_API_METHODS: LazyLock<DispatchTable<MemoryApi>> = LazyLock::new(|| {
    DispatchTable::new()
        .method("short_term_memory_add", |api: &mut MemoryApi, args: ValueArgs| {
            api.short_term_memory_add(args.value)
        })
        .method("short_term_memory_remove", |api: &mut MemoryApi, args: ValueArgs| {
            api.short_term_memory_remove(&args.value)
        })
        .method("short_term_memory_clear", |api: &mut MemoryApi, _: NoArgs| {
            api.short_term_memory_clear()
        })
        .method("short_term_memory_search", |api: &mut MemoryApi, args: SearchArgs| {
            api.short_term_memory_search(&args.query, args.k)
        })
        .method("short_term_memory_retrieve_all", |api: &mut MemoryApi, _: NoArgs| {
            api.short_term_memory_retrieve_all()
        })
        .method("long_term_memory_add", |api: &mut MemoryApi, args: KeyValueArgs| {
            api.long_term_memory_add(args.key, args.value)
        })
        .method("long_term_memory_remove", |api: &mut MemoryApi, args: KeyArgs| {
            api.long_term_memory_remove(&args.key)
        })
        .method("long_term_memory_replace", |api: &mut MemoryApi, args: KeyValueArgs| {
            api.long_term_memory_replace(&args.key, args.value)
        })
        .method("long_term_memory_clear", |api: &mut MemoryApi, _: NoArgs| {
            api.long_term_memory_clear()
        })
        .method("long_term_memory_retrieve", |api: &mut MemoryApi, args: KeyArgs| {
            api.long_term_memory_retrieve(&args.key)
        })
        .method("long_term_memory_list_keys", |api: &mut MemoryApi, _: NoArgs| {
            api.long_term_memory_list_keys()
        })
        .method("long_term_memory_key_search", |api: &mut MemoryApi, args: SearchArgs| {
            api.long_term_memory_key_search(&args.query, args.k)
        })
});

impl Simulator for MemoryApi {
    fn class_name(&self) -> &'static str {
        "MemoryAPI_kv"
    }

    /// The first prerequisite entry of a scenario starts from a wiped
    /// scenario folder. Later prerequisite entries continue from the
    /// category's running snapshot, and scored entries start from the final
    /// prerequisite state of their scenario.
    fn load_scenario(
        &mut self,
        _initial_config: &Value,
        ctx: &ScenarioContext,
    ) -> Result<(), SimulatorError> {
        let category = ctx.category;
        let scenario_dir = ctx.scenario_snapshot_dir();
        let target_file = if category.is_memory_prereq() {
            scenario_dir.join(format!("{}_final.json", category.name()))
        } else {
            scenario_dir.join(format!("{}_prereq_final.json", category.name()))
        };

        if is_first_memory_prereq_entry(&ctx.entry_id) {
            info!("Resetting memory snapshots in {}", scenario_dir.display());
            reset_snapshot_dir(&scenario_dir)?;
            *self = MemoryApi::default();
            return Ok(());
        }
        if !target_file.exists() {
            return Err(SimulatorError::MissingSnapshot(target_file));
        }
        debug!("Loading memory snapshot {}", target_file.display());
        self.load_snapshot_file(&target_file)
    }

    fn method_names(&self) -> Vec<&'static str> {
        MEMORY_API_METHODS.method_names()
    }

    fn invoke(
        &mut self,
        method: &str,
        arguments: &IndexMap<String, Value>,
    ) -> Result<ReturnValue, ExecutionError> {
        MEMORY_API_METHODS.invoke(self, method, arguments)
    }

    fn snapshot(&self) -> IndexMap<String, Value> {
        snapshot_fields(self)
    }

    /// Writes `{entry_id}.json` and the category's running `_final.json`
    /// into the scenario folder.
    fn on_entry_complete(&self, ctx: &ScenarioContext) -> Result<(), SimulatorError> {
        let scenario_dir = ctx.scenario_snapshot_dir();
        fs::create_dir_all(&scenario_dir).map_err(|source| SimulatorError::SnapshotIo {
            path: scenario_dir.clone(),
            source,
        })?;
        let category = extract_test_category_from_id(&ctx.entry_id)
            .map(|c| c.name())
            .unwrap_or_else(|_| ctx.category.name());
        self.write_snapshot_file(scenario_dir.join(format!("{}.json", ctx.entry_id)))?;
        self.write_snapshot_file(scenario_dir.join(format!("{}_final.json", category)))
    }
}

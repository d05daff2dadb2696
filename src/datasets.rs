use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    category::{TestCategory, extract_test_category_from_id, memory_scenario_from_id, sort_key},
    error::HarnessError,
    function_call::FunctionCall,
    paths::{dataset_file, ground_truth_file},
    utils::{load_json_lines, load_json_lines_as},
};

/// Folder, relative to the dataset dir, holding one JSON-lines doc file per
/// simulator class.
pub const FUNCTION_DOC_DIR: &str = "multi_turn_func_doc";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage {
            role: "user".to_string(),
            content: content.into(),
            name: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        ChatMessage {
            role: "assistant".to_string(),
            content: content.into(),
            name: None,
        }
    }

    pub fn tool(call: impl Into<String>, content: impl Into<String>) -> Self {
        ChatMessage {
            role: "tool".to_string(),
            content: content.into(),
            name: Some(call.into()),
        }
    }
}

/// One benchmark case, as stored in `{VERSION_PREFIX}_{category}.json`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestEntry {
    pub id: String,
    /// Turns, each an ordered list of user messages.
    pub question: Vec<Vec<ChatMessage>>,
    #[serde(default)]
    pub function: Vec<Value>,
    #[serde(default)]
    pub involved_classes: Vec<String>,
    #[serde(default)]
    pub initial_config: IndexMap<String, Value>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Turn index → names of functions withheld until that turn.
    #[serde(default)]
    pub missed_function: IndexMap<usize, Vec<String>>,
    #[serde(default)]
    pub long_context: bool,
    /// Memory scenario the entry belongs to. Falls back to the id's scenario
    /// segment when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario: Option<String>,
    /// Docs removed from `function` for `missed_function`, by turn index.
    #[serde(skip)]
    pub held_out_functions: IndexMap<usize, Vec<Value>>,
}

impl TestEntry {
    pub fn category(&self) -> Result<TestCategory, HarnessError> {
        extract_test_category_from_id(&self.id)
    }

    pub fn memory_scenario(&self) -> Option<String> {
        self.scenario
            .clone()
            .or_else(|| memory_scenario_from_id(&self.id))
    }

    /// Moves the docs of every `missed_function` name out of `function`.
    pub fn hold_out_missed_functions(&mut self) {
        for (turn, names) in &self.missed_function {
            let held = self.held_out_functions.entry(*turn).or_default();
            for name in names {
                let position = self
                    .function
                    .iter()
                    .position(|doc| doc.get("name").and_then(Value::as_str) == Some(name));
                match position {
                    Some(index) => held.push(self.function.remove(index)),
                    None => warn!(entry = %self.id, function = %name, "missed function has no doc"),
                }
            }
        }
    }

    /// Function docs visible to the model at `turn`.
    pub fn visible_functions(&self, turn: usize) -> Vec<Value> {
        let mut docs = self.function.clone();
        for (held_turn, held) in &self.held_out_functions {
            if *held_turn <= turn {
                docs.extend(held.iter().cloned());
            }
        }
        docs
    }
}

/// One call in a recorded trace: either Python call text or the
/// `{name: {args}}` mapping.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GroundTruthCall {
    Text(String),
    Call(FunctionCall),
}

impl GroundTruthCall {
    pub fn to_call_string(&self) -> String {
        match self {
            GroundTruthCall::Text(text) => text.clone(),
            GroundTruthCall::Call(call) => call.to_python_call_string(),
        }
    }
}

/// Ground truth line. Its shape depends on the category's evaluation
/// method, so it is kept raw until the checker picks it apart.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GroundTruthEntry {
    pub id: String,
    pub ground_truth: Value,
}

impl GroundTruthEntry {
    pub fn multi_turn_trace(&self) -> Result<Vec<Vec<GroundTruthCall>>, serde_json::Error> {
        serde_json::from_value(self.ground_truth.clone())
    }
}

pub fn load_test_entries(
    dataset_dir: &Path,
    category: TestCategory,
) -> Result<Vec<TestEntry>, HarnessError> {
    load_json_lines_as(dataset_file(dataset_dir, category))
}

pub fn load_ground_truth(
    ground_truth_dir: &Path,
    category: TestCategory,
) -> Result<Vec<GroundTruthEntry>, HarnessError> {
    load_json_lines_as(ground_truth_file(ground_truth_dir, category))
}

/// Number of entries in a category's dataset file; 0 when the file is absent.
pub fn count_dataset_entries(
    dataset_dir: &Path,
    category: TestCategory,
) -> Result<usize, HarnessError> {
    let path = dataset_file(dataset_dir, category);
    if !path.exists() {
        return Ok(0);
    }
    Ok(load_json_lines(&path)?.len())
}

/// Fills `function` for entries that only name their classes.
pub fn populate_function_docs(
    entries: &mut [TestEntry],
    dataset_dir: &Path,
) -> Result<(), HarnessError> {
    let mut cache: IndexMap<String, Vec<Value>> = IndexMap::new();
    for entry in entries.iter_mut() {
        if !entry.function.is_empty() || entry.involved_classes.is_empty() {
            continue;
        }
        for class_name in &entry.involved_classes {
            if !cache.contains_key(class_name) {
                let path = dataset_dir
                    .join(FUNCTION_DOC_DIR)
                    .join(format!("{}.json", class_name));
                let docs = if path.exists() {
                    load_json_lines_as(&path)?
                } else {
                    debug!("no function docs for {} at {}", class_name, path.display());
                    Vec::new()
                };
                cache.insert(class_name.clone(), docs);
            }
            entry.function.extend(cache[class_name].iter().cloned());
        }
    }
    Ok(())
}

/// Prerequisite entries of one backend and scenario run in id order, each
/// depending on the ones before it; every scored entry of that backend and
/// scenario depends on all of them. Entries that already declare
/// dependencies are left alone.
pub fn wire_memory_dependencies(entries: &mut [TestEntry]) -> Result<(), HarnessError> {
    type ChainKey = (TestCategory, Option<String>);
    let mut prereq_ids: IndexMap<ChainKey, Vec<(u64, String)>> = IndexMap::new();
    for entry in entries.iter() {
        let category = entry.category()?;
        if category.is_memory_prereq() {
            let (_, _, index) = sort_key(&entry.id)?;
            prereq_ids
                .entry((category, entry.memory_scenario()))
                .or_default()
                .push((index, entry.id.clone()));
        }
    }
    for ids in prereq_ids.values_mut() {
        ids.sort();
    }

    for entry in entries.iter_mut() {
        if !entry.depends_on.is_empty() {
            continue;
        }
        let category = entry.category()?;
        let scenario = entry.memory_scenario();
        if category.is_memory_prereq() {
            if let Some(chain) = prereq_ids.get(&(category, scenario)) {
                entry.depends_on = chain
                    .iter()
                    .take_while(|(_, id)| *id != entry.id)
                    .map(|(_, id)| id.clone())
                    .collect();
            }
        } else if let Some(prereq) = category.prereq_category() {
            match prereq_ids.get(&(prereq, scenario)) {
                Some(chain) => {
                    entry.depends_on = chain.iter().map(|(_, id)| id.clone()).collect();
                }
                None => warn!(entry = %entry.id, "no prerequisite entries for memory scenario"),
            }
        }
    }
    Ok(())
}

/// Drops prerequisite entries whose scored memory category is not in the run.
pub fn clean_up_memory_prereq_entries(
    entries: Vec<TestEntry>,
) -> Result<Vec<TestEntry>, HarnessError> {
    let mut present: Vec<TestCategory> = Vec::new();
    for entry in &entries {
        let category = entry.category()?;
        if !present.contains(&category) {
            present.push(category);
        }
    }
    let mut kept = Vec::with_capacity(entries.len());
    for entry in entries {
        let category = entry.category()?;
        let orphaned = category.is_memory_prereq()
            && category
                .memory_backend()
                .is_some_and(|b| !present.contains(&TestCategory::Memory(b)));
        if orphaned {
            debug!("dropping orphaned prerequisite entry {}", entry.id);
            continue;
        }
        kept.push(entry);
    }
    Ok(kept)
}

/// Loads every entry of `categories` (plus the prerequisite entries memory
/// categories need) and applies the load-time preprocessing.
pub fn load_dataset(
    dataset_dir: &Path,
    categories: &[TestCategory],
) -> Result<Vec<TestEntry>, HarnessError> {
    let mut to_load: Vec<TestCategory> = Vec::new();
    for category in categories {
        if let Some(prereq) = category.prereq_category() {
            if !to_load.contains(&prereq) {
                to_load.push(prereq);
            }
        }
        if !to_load.contains(category) {
            to_load.push(*category);
        }
    }

    let mut entries = Vec::new();
    for category in to_load {
        entries.extend(load_test_entries(dataset_dir, category)?);
    }
    populate_function_docs(&mut entries, dataset_dir)?;
    for entry in entries.iter_mut() {
        entry.hold_out_missed_functions();
    }
    wire_memory_dependencies(&mut entries)?;
    clean_up_memory_prereq_entries(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(id: &str) -> TestEntry {
        serde_json::from_value(json!({"id": id, "question": [[{"role": "user", "content": "hi"}]]}))
            .unwrap()
    }

    #[test]
    fn test_missed_function_is_held_until_its_turn() {
        let mut e: TestEntry = serde_json::from_value(json!({
            "id": "multi_turn_miss_func_0",
            "question": [[], []],
            "function": [{"name": "send_message"}, {"name": "delete_message"}],
            "missed_function": {"1": ["delete_message"]},
        }))
        .unwrap();
        e.hold_out_missed_functions();
        assert_eq!(e.visible_functions(0), vec![json!({"name": "send_message"})]);
        assert_eq!(e.visible_functions(1).len(), 2);
        assert_eq!(e.function.len(), 1);
    }

    #[test]
    fn test_memory_dependencies_chain_in_id_order() {
        let mut entries = vec![
            entry("memory_kv_prereq_1-notes-1"),
            entry("memory_kv_0-notes-0"),
            entry("memory_kv_prereq_0-notes-0"),
            entry("simple_python_0"),
        ];
        wire_memory_dependencies(&mut entries).unwrap();
        assert_eq!(entries[0].depends_on, vec!["memory_kv_prereq_0-notes-0"]);
        assert_eq!(
            entries[1].depends_on,
            vec!["memory_kv_prereq_0-notes-0", "memory_kv_prereq_1-notes-1"]
        );
        assert!(entries[2].depends_on.is_empty());
        assert!(entries[3].depends_on.is_empty());
    }

    #[test]
    fn test_memory_dependencies_stay_within_scenario() {
        let mut entries = vec![
            entry("memory_kv_prereq_0-notes-0"),
            entry("memory_kv_prereq_1-notes-1"),
            entry("memory_kv_prereq_2-student-0"),
            entry("memory_kv_0-notes-0"),
            entry("memory_kv_1-student-0"),
        ];
        wire_memory_dependencies(&mut entries).unwrap();
        assert!(entries[2].depends_on.is_empty());
        assert_eq!(
            entries[3].depends_on,
            vec!["memory_kv_prereq_0-notes-0", "memory_kv_prereq_1-notes-1"]
        );
        assert_eq!(entries[4].depends_on, vec!["memory_kv_prereq_2-student-0"]);
        assert!(
            entries[3]
                .depends_on
                .iter()
                .all(|id| !entries[4].depends_on.contains(id))
        );
    }

    #[test]
    fn test_scenario_field_overrides_id_segment() {
        let mut entries = vec![entry("memory_kv_prereq_0-notes-0"), entry("memory_kv_0-x-0")];
        entries[1].scenario = Some("notes".to_string());
        wire_memory_dependencies(&mut entries).unwrap();
        assert_eq!(entries[1].depends_on, vec!["memory_kv_prereq_0-notes-0"]);
    }

    #[test]
    fn test_orphaned_prereq_entries_are_dropped() {
        let entries = vec![entry("memory_kv_prereq_0-notes-0"), entry("simple_python_0")];
        let kept = clean_up_memory_prereq_entries(entries).unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id, "simple_python_0");
    }

    #[test]
    fn test_ground_truth_call_shapes() {
        let gt = GroundTruthEntry {
            id: "multi_turn_base_0".to_string(),
            ground_truth: json!([["add(a=1, b=2)"], [{"subtract": {"a": 5, "b": 1}}], []]),
        };
        let trace = gt.multi_turn_trace().unwrap();
        assert_eq!(trace.len(), 3);
        assert_eq!(trace[1][0].to_call_string(), "subtract(a=5, b=1)");
        assert!(trace[2].is_empty());
    }

    #[test]
    fn test_load_dataset_includes_prereqs_and_docs() {
        let dir = tempfile::tempdir().unwrap();
        let write = |name: &str, lines: &[Value]| {
            let text: Vec<String> = lines.iter().map(|v| v.to_string()).collect();
            std::fs::write(dir.path().join(name), text.join("\n")).unwrap();
        };
        write(
            "BFCL_v4_memory_kv_prereq.json",
            &[json!({"id": "memory_kv_prereq_0-notes-0", "question": [[]], "involved_classes": ["MemoryAPI_kv"]})],
        );
        write(
            "BFCL_v4_memory_kv.json",
            &[json!({"id": "memory_kv_0-notes-0", "question": [[]], "involved_classes": ["MemoryAPI_kv"]})],
        );
        std::fs::create_dir(dir.path().join(FUNCTION_DOC_DIR)).unwrap();
        std::fs::write(
            dir.path().join(FUNCTION_DOC_DIR).join("MemoryAPI_kv.json"),
            json!({"name": "short_term_memory_add"}).to_string(),
        )
        .unwrap();

        let entries =
            load_dataset(dir.path(), &[TestCategory::Memory(crate::category::MemoryBackend::Kv)])
                .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, "memory_kv_prereq_0-notes-0");
        assert_eq!(entries[1].depends_on, vec!["memory_kv_prereq_0-notes-0"]);
        assert_eq!(entries[1].function.len(), 1);

        assert_eq!(
            count_dataset_entries(dir.path(), TestCategory::Memory(crate::category::MemoryBackend::Kv))
                .unwrap(),
            1
        );
        assert_eq!(count_dataset_entries(dir.path(), TestCategory::Simple).unwrap(), 0);
    }
}

use std::{fmt, str::FromStr, sync::LazyLock};

use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::HarnessError;

/// Scheduling band of a category. Lower bands are enqueued first so that
/// prerequisite state exists before dependents need it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CategoryKind {
    MemoryPrereq,
    WebSearch,
    SingleTurn,
    MultiTurn,
    Memory,
}

const KIND_PRIORITY: [(CategoryKind, u8); 5] = [
    (CategoryKind::MemoryPrereq, 0),
    (CategoryKind::WebSearch, 1),
    (CategoryKind::SingleTurn, 2),
    (CategoryKind::MultiTurn, 3),
    (CategoryKind::Memory, 4),
];

impl CategoryKind {
    pub fn priority(self) -> u8 {
        KIND_PRIORITY
            .iter()
            .find(|(kind, _)| *kind == self)
            .map(|(_, p)| *p)
            .unwrap_or(u8::MAX)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EvaluationMethod {
    /// Structural comparison of decoded calls against acceptable values.
    Ast,
    /// At least one function call must be emitted.
    Relevance,
    /// No function call may be emitted.
    Irrelevance,
    /// Turn-by-turn state and response comparison.
    MultiTurn,
    /// The final answer must mention one of the expected answers.
    Agentic,
    /// Only run to seed state for dependents; never scored.
    Unscored,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MemoryBackend {
    Kv,
    Vector,
    RecSum,
}

impl MemoryBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            MemoryBackend::Kv => "kv",
            MemoryBackend::Vector => "vector",
            MemoryBackend::RecSum => "rec_sum",
        }
    }

    /// Simulator class that backs this memory category.
    pub fn class_name(self) -> String {
        format!("MemoryAPI_{}", self.as_str())
    }
}

/// Closed set of test categories, resolved once from the category name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TestCategory {
    Simple,
    Multiple,
    Parallel,
    ParallelMultiple,
    Irrelevance,
    LiveSimple,
    LiveMultiple,
    LiveParallel,
    LiveParallelMultiple,
    LiveRelevance,
    LiveIrrelevance,
    MultiTurnBase,
    MultiTurnMissFunc,
    MultiTurnMissParam,
    MultiTurnLongContext,
    WebSearchBase,
    WebSearchNoSnippet,
    MemoryPrereq(MemoryBackend),
    Memory(MemoryBackend),
}

pub static ALL_CATEGORIES: LazyLock<Vec<TestCategory>> = LazyLock::new(|| {
    use MemoryBackend::*;
    use TestCategory::*;
    vec![
        Simple,
        Multiple,
        Parallel,
        ParallelMultiple,
        Irrelevance,
        LiveSimple,
        LiveMultiple,
        LiveParallel,
        LiveParallelMultiple,
        LiveRelevance,
        LiveIrrelevance,
        MultiTurnBase,
        MultiTurnMissFunc,
        MultiTurnMissParam,
        MultiTurnLongContext,
        WebSearchBase,
        WebSearchNoSnippet,
        MemoryPrereq(Kv),
        MemoryPrereq(Vector),
        MemoryPrereq(RecSum),
        Memory(Kv),
        Memory(Vector),
        Memory(RecSum),
    ]
});

/// Named groups accepted on the command line in place of single categories.
pub static CATEGORY_GROUPS: LazyLock<IndexMap<&'static str, Vec<TestCategory>>> =
    LazyLock::new(|| {
        use TestCategory::*;
        let mut m = IndexMap::new();
        m.insert("all", ALL_CATEGORIES.iter().copied().filter(|c| !c.is_memory_prereq()).collect());
        m.insert("non_live", vec![Simple, Multiple, Parallel, ParallelMultiple, Irrelevance]);
        m.insert(
            "live",
            vec![
                LiveSimple,
                LiveMultiple,
                LiveParallel,
                LiveParallelMultiple,
                LiveRelevance,
                LiveIrrelevance,
            ],
        );
        m.insert(
            "multi_turn",
            vec![MultiTurnBase, MultiTurnMissFunc, MultiTurnMissParam, MultiTurnLongContext],
        );
        m.insert("web_search", vec![WebSearchBase, WebSearchNoSnippet]);
        m.insert(
            "memory",
            vec![
                Memory(MemoryBackend::Kv),
                Memory(MemoryBackend::Vector),
                Memory(MemoryBackend::RecSum),
            ],
        );
        m
    });

impl TestCategory {
    pub fn name(self) -> String {
        use TestCategory::*;
        match self {
            Simple => "simple_python".to_string(),
            Multiple => "multiple".to_string(),
            Parallel => "parallel".to_string(),
            ParallelMultiple => "parallel_multiple".to_string(),
            Irrelevance => "irrelevance".to_string(),
            LiveSimple => "live_simple".to_string(),
            LiveMultiple => "live_multiple".to_string(),
            LiveParallel => "live_parallel".to_string(),
            LiveParallelMultiple => "live_parallel_multiple".to_string(),
            LiveRelevance => "live_relevance".to_string(),
            LiveIrrelevance => "live_irrelevance".to_string(),
            MultiTurnBase => "multi_turn_base".to_string(),
            MultiTurnMissFunc => "multi_turn_miss_func".to_string(),
            MultiTurnMissParam => "multi_turn_miss_param".to_string(),
            MultiTurnLongContext => "multi_turn_long_context".to_string(),
            WebSearchBase => "web_search_base".to_string(),
            WebSearchNoSnippet => "web_search_no_snippet".to_string(),
            MemoryPrereq(backend) => format!("memory_{}_prereq", backend.as_str()),
            Memory(backend) => format!("memory_{}", backend.as_str()),
        }
    }

    pub fn kind(self) -> CategoryKind {
        use TestCategory::*;
        match self {
            MemoryPrereq(_) => CategoryKind::MemoryPrereq,
            WebSearchBase | WebSearchNoSnippet => CategoryKind::WebSearch,
            MultiTurnBase | MultiTurnMissFunc | MultiTurnMissParam | MultiTurnLongContext => {
                CategoryKind::MultiTurn
            }
            Memory(_) => CategoryKind::Memory,
            _ => CategoryKind::SingleTurn,
        }
    }

    pub fn evaluation_method(self) -> EvaluationMethod {
        use TestCategory::*;
        match self {
            Irrelevance | LiveIrrelevance => EvaluationMethod::Irrelevance,
            LiveRelevance => EvaluationMethod::Relevance,
            MemoryPrereq(_) => EvaluationMethod::Unscored,
            WebSearchBase | WebSearchNoSnippet | Memory(_) => EvaluationMethod::Agentic,
            _ if self.kind() == CategoryKind::MultiTurn => EvaluationMethod::MultiTurn,
            _ => EvaluationMethod::Ast,
        }
    }

    /// Folder that result and score files of this category live in.
    pub fn group(self) -> &'static str {
        use TestCategory::*;
        match self {
            Simple | Multiple | Parallel | ParallelMultiple | Irrelevance => "non_live",
            LiveSimple | LiveMultiple | LiveParallel | LiveParallelMultiple | LiveRelevance
            | LiveIrrelevance => "live",
            MultiTurnBase | MultiTurnMissFunc | MultiTurnMissParam | MultiTurnLongContext => {
                "multi_turn"
            }
            WebSearchBase | WebSearchNoSnippet | MemoryPrereq(_) | Memory(_) => "agentic",
        }
    }

    /// Calls may come in any order.
    pub fn is_parallel(self) -> bool {
        use TestCategory::*;
        matches!(
            self,
            Parallel | ParallelMultiple | LiveParallel | LiveParallelMultiple
        )
    }

    pub fn is_memory_prereq(self) -> bool {
        matches!(self, TestCategory::MemoryPrereq(_))
    }

    pub fn memory_backend(self) -> Option<MemoryBackend> {
        match self {
            TestCategory::MemoryPrereq(b) | TestCategory::Memory(b) => Some(b),
            _ => None,
        }
    }

    /// Simulator class every entry of this category needs, when the category
    /// depends on a fixed backend.
    pub fn simulator_class(self) -> Option<String> {
        match self {
            TestCategory::WebSearchBase | TestCategory::WebSearchNoSnippet => {
                Some("WebSearchAPI".to_string())
            }
            _ => self.memory_backend().map(MemoryBackend::class_name),
        }
    }

    /// Category whose prerequisite entries seed this one.
    pub fn prereq_category(self) -> Option<TestCategory> {
        match self {
            TestCategory::Memory(b) => Some(TestCategory::MemoryPrereq(b)),
            _ => None,
        }
    }

    pub fn is_multi_turn_interaction(self) -> bool {
        !matches!(self.kind(), CategoryKind::SingleTurn)
    }
}

impl fmt::Display for TestCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl FromStr for TestCategory {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALL_CATEGORIES
            .iter()
            .copied()
            .find(|c| c.name() == s)
            .ok_or_else(|| HarnessError::UnknownCategory(s.to_string()))
    }
}

impl Serialize for TestCategory {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.name())
    }
}

impl<'de> Deserialize<'de> for TestCategory {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse().map_err(serde::de::Error::custom)
    }
}

/// Expands category names and group names (`all`, `live`, ...) into categories.
pub fn parse_test_category_argument(args: &[String]) -> Result<Vec<TestCategory>, HarnessError> {
    let mut categories: Vec<TestCategory> = Vec::new();
    for arg in args {
        let expanded = match CATEGORY_GROUPS.get(arg.as_str()) {
            Some(group) => group.clone(),
            None => vec![arg.parse()?],
        };
        for category in expanded {
            if !categories.contains(&category) {
                categories.push(category);
            }
        }
    }
    Ok(categories)
}

/// `simple_python_12`, `live_simple_19-3-15`, `prefix:memory_kv_3-customer-0`.
static ENTRY_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?P<category>.+)_(?P<index>\d+)(?P<suffix>-.*)?$").expect("static regex"));

pub fn extract_test_category_from_id(entry_id: &str) -> Result<TestCategory, HarnessError> {
    let base = entry_id.split(':').next().unwrap_or(entry_id);
    let captures = ENTRY_ID
        .captures(base)
        .ok_or_else(|| HarnessError::MalformedId(entry_id.to_string()))?;
    captures["category"].parse()
}

/// Sort key used for scheduling and for writing result files:
/// priority band, then category name, then numeric index.
pub fn sort_key(entry_id: &str) -> Result<(u8, String, u64), HarnessError> {
    let base = entry_id.split(':').next().unwrap_or(entry_id);
    let captures = ENTRY_ID
        .captures(base)
        .ok_or_else(|| HarnessError::MalformedId(entry_id.to_string()))?;
    let category: TestCategory = captures["category"].parse()?;
    let index: u64 = captures["index"]
        .parse()
        .map_err(|_| HarnessError::MalformedId(entry_id.to_string()))?;
    Ok((category.kind().priority(), category.name(), index))
}

pub fn is_first_memory_prereq_entry(entry_id: &str) -> bool {
    entry_id.contains("prereq") && entry_id.ends_with("-0")
}

/// Scenario segment of a memory entry id: `customer` in
/// `memory_kv_prereq_3-customer-0`.
pub fn memory_scenario_from_id(entry_id: &str) -> Option<String> {
    let base = entry_id.split(':').next().unwrap_or(entry_id);
    let captures = ENTRY_ID.captures(base)?;
    let suffix = captures.name("suffix")?.as_str().trim_start_matches('-');
    suffix
        .split('-')
        .next()
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
}

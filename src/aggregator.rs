use std::path::Path;

use indexmap::IndexMap;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::info;

use crate::{
    category::TestCategory, error::HarnessError, paths::leaderboard_file, utils::write_json_pretty,
};

/// Accuracy as shown on the leaderboard: the number, or `"N/A"` when some
/// constituent category was never evaluated.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum DisplayAccuracy {
    Value(f64),
    NotAvailable,
}

impl DisplayAccuracy {
    pub fn is_not_available(self) -> bool {
        matches!(self, DisplayAccuracy::NotAvailable)
    }
}

impl Serialize for DisplayAccuracy {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            DisplayAccuracy::Value(v) => serializer.serialize_f64(*v),
            DisplayAccuracy::NotAvailable => serializer.serialize_str("N/A"),
        }
    }
}

impl<'de> Deserialize<'de> for DisplayAccuracy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(f64),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Number(v) => Ok(DisplayAccuracy::Value(v)),
            Raw::Text(s) if s == "N/A" => Ok(DisplayAccuracy::NotAvailable),
            Raw::Text(s) => Err(serde::de::Error::custom(format!(
                "expected a number or \"N/A\", got {s:?}"
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccuracyScore {
    pub accuracy: f64,
    pub total_count: usize,
    pub display_accuracy: DisplayAccuracy,
}

impl AccuracyScore {
    pub fn new(accuracy: f64, total_count: usize) -> Self {
        AccuracyScore {
            accuracy,
            total_count,
            display_accuracy: DisplayAccuracy::Value(accuracy),
        }
    }

    /// Sentinel for a category that was not evaluated. It keeps the
    /// category's dataset size, so it counts as 0 over that many entries in
    /// numeric rollups.
    pub fn not_available(total_count: usize) -> Self {
        AccuracyScore {
            accuracy: 0.0,
            total_count,
            display_accuracy: DisplayAccuracy::NotAvailable,
        }
    }

    fn with_display(accuracy: f64, total_count: usize, has_na: bool, display_na: bool) -> Self {
        AccuracyScore {
            accuracy,
            total_count,
            display_accuracy: if has_na && display_na {
                DisplayAccuracy::NotAvailable
            } else {
                DisplayAccuracy::Value(accuracy)
            },
        }
    }
}

/// Mean weighted by entry count. An empty total gives 0.
pub fn calculate_weighted_accuracy(
    scores: &[AccuracyScore],
    display_na_if_category_missing: bool,
) -> AccuracyScore {
    let total_count: usize = scores.iter().map(|s| s.total_count).sum();
    let weighted: f64 = scores
        .iter()
        .map(|s| s.accuracy * s.total_count as f64)
        .sum();
    let accuracy = if total_count == 0 {
        0.0
    } else {
        weighted / total_count as f64
    };
    let has_na = scores.iter().any(|s| s.display_accuracy.is_not_available());
    AccuracyScore::with_display(accuracy, total_count, has_na, display_na_if_category_missing)
}

/// Plain mean of the category accuracies, whatever their sizes.
pub fn calculate_unweighted_accuracy(
    scores: &[AccuracyScore],
    display_na_if_category_missing: bool,
) -> AccuracyScore {
    let total_count: usize = scores.iter().map(|s| s.total_count).sum();
    let accuracy = if scores.is_empty() {
        0.0
    } else {
        scores.iter().map(|s| s.accuracy).sum::<f64>() / scores.len() as f64
    };
    let has_na = scores.iter().any(|s| s.display_accuracy.is_not_available());
    AccuracyScore::with_display(accuracy, total_count, has_na, display_na_if_category_missing)
}

/// Per-model, per-category scores collected while evaluating.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LeaderboardTable {
    pub models: IndexMap<String, IndexMap<TestCategory, AccuracyScore>>,
    /// Entry count of each category's dataset, used to weigh categories a
    /// model was not evaluated on.
    #[serde(default)]
    pub dataset_sizes: IndexMap<TestCategory, usize>,
}

impl LeaderboardTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_result(
        &mut self,
        model_name: &str,
        category: TestCategory,
        accuracy: f64,
        total_count: usize,
    ) {
        self.models
            .entry(model_name.to_string())
            .or_default()
            .insert(category, AccuracyScore::new(accuracy, total_count));
    }

    pub fn set_dataset_size(&mut self, category: TestCategory, entry_count: usize) {
        self.dataset_sizes.insert(category, entry_count);
    }

    /// The recorded score, or the N/A sentinel sized by the category's
    /// dataset when the category was not run.
    pub fn get_category_score(&self, model_name: &str, category: TestCategory) -> AccuracyScore {
        self.models
            .get(model_name)
            .and_then(|scores| scores.get(&category))
            .copied()
            .unwrap_or_else(|| {
                AccuracyScore::not_available(
                    self.dataset_sizes.get(&category).copied().unwrap_or_default(),
                )
            })
    }

    pub fn model_summary(&self, model_name: &str) -> ModelSummary {
        use TestCategory::*;
        let score = |category| self.get_category_score(model_name, category);

        let non_live_ast = [score(Simple), score(Multiple), score(Parallel), score(ParallelMultiple)];
        let mut non_live_all = non_live_ast.to_vec();
        non_live_all.push(score(Irrelevance));
        let non_live = GroupSummary {
            summary: calculate_unweighted_accuracy(&non_live_ast, true),
            overall: calculate_unweighted_accuracy(&non_live_all, false),
        };

        let live_ast = [
            score(LiveSimple),
            score(LiveMultiple),
            score(LiveParallel),
            score(LiveParallelMultiple),
        ];
        let mut live_all = live_ast.to_vec();
        live_all.extend([score(LiveIrrelevance), score(LiveRelevance)]);
        let live = GroupSummary {
            summary: calculate_weighted_accuracy(&live_ast, true),
            overall: calculate_weighted_accuracy(&live_all, false),
        };

        let multi_turn_scores = [
            score(MultiTurnBase),
            score(MultiTurnMissFunc),
            score(MultiTurnMissParam),
            score(MultiTurnLongContext),
        ];
        let multi_turn = calculate_unweighted_accuracy(&multi_turn_scores, false);

        let overall =
            calculate_unweighted_accuracy(&[live.overall, non_live.overall, multi_turn], false);

        ModelSummary {
            model_name: model_name.to_string(),
            overall,
            non_live,
            live,
            multi_turn,
            relevance: score(LiveRelevance),
            irrelevance: calculate_unweighted_accuracy(
                &[score(Irrelevance), score(LiveIrrelevance)],
                true,
            ),
            categories: self.models.get(model_name).cloned().unwrap_or_default(),
        }
    }

    /// Model summaries ranked by overall accuracy, best first.
    pub fn ranked(&self) -> Vec<RankedModel> {
        let mut summaries: Vec<ModelSummary> =
            self.models.keys().map(|m| self.model_summary(m)).collect();
        summaries.sort_by_key(|s| std::cmp::Reverse(OrderedFloat(s.overall.accuracy)));
        summaries
            .into_iter()
            .enumerate()
            .map(|(i, summary)| RankedModel {
                rank: i + 1,
                summary,
            })
            .collect()
    }

    /// Writes `leaderboard.json` under `score_dir`.
    pub fn write(&self, score_dir: &Path) -> Result<(), HarnessError> {
        let path = leaderboard_file(score_dir);
        let ranked = self.ranked();
        for entry in &ranked {
            info!(
                rank = entry.rank,
                model = %entry.summary.model_name,
                overall = entry.summary.overall.accuracy,
                "leaderboard"
            );
        }
        write_json_pretty(&path, &ranked)
    }
}

/// Narrow summary (AST categories only, N/A propagated) and the group's
/// overall score (everything in the group, never N/A).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GroupSummary {
    pub summary: AccuracyScore,
    pub overall: AccuracyScore,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelSummary {
    pub model_name: String,
    pub overall: AccuracyScore,
    pub non_live: GroupSummary,
    pub live: GroupSummary,
    pub multi_turn: AccuracyScore,
    pub relevance: AccuracyScore,
    pub irrelevance: AccuracyScore,
    pub categories: IndexMap<TestCategory, AccuracyScore>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RankedModel {
    pub rank: usize,
    #[serde(flatten)]
    pub summary: ModelSummary,
}

use std::{
    path::{Path, PathBuf},
    sync::LazyLock,
};

use crate::category::TestCategory;

pub const VERSION_PREFIX: &str = "BFCL_v4";

pub static BASE_DATASET_PATH: LazyLock<PathBuf> = LazyLock::new(|| PathBuf::from("data"));

pub static BASE_GROUND_TRUTH_PATH: LazyLock<PathBuf> =
    LazyLock::new(|| PathBuf::from("data/possible_answer"));

pub static BASE_RESULT_PATH: LazyLock<PathBuf> = LazyLock::new(|| PathBuf::from("result"));

pub static BASE_SCORE_PATH: LazyLock<PathBuf> = LazyLock::new(|| PathBuf::from("score"));

/// Model names may contain `/` (e.g. `org/model`); keep them one path segment.
pub fn model_dir_name(model_name: &str) -> String {
    model_name.replace('/', "_")
}

pub fn dataset_file(dataset_dir: &Path, category: TestCategory) -> PathBuf {
    dataset_dir.join(format!("{}_{}.json", VERSION_PREFIX, category.name()))
}

pub fn ground_truth_file(ground_truth_dir: &Path, category: TestCategory) -> PathBuf {
    ground_truth_dir.join(format!("{}_{}.json", VERSION_PREFIX, category.name()))
}

pub fn model_result_dir(result_dir: &Path, model_name: &str) -> PathBuf {
    result_dir.join(model_dir_name(model_name))
}

pub fn result_file(result_dir: &Path, model_name: &str, category: TestCategory) -> PathBuf {
    model_result_dir(result_dir, model_name)
        .join(category.group())
        .join(format!("{}_{}_result.json", VERSION_PREFIX, category.name()))
}

pub fn score_file(score_dir: &Path, model_name: &str, category: TestCategory) -> PathBuf {
    score_dir
        .join(model_dir_name(model_name))
        .join(category.group())
        .join(format!("{}_{}_score.json", VERSION_PREFIX, category.name()))
}

pub fn memory_snapshot_dir(result_dir: &Path, model_name: &str) -> PathBuf {
    model_result_dir(result_dir, model_name).join("memory_snapshot")
}

pub fn ledger_file(result_dir: &Path, model_name: &str) -> PathBuf {
    model_result_dir(result_dir, model_name).join("completion_ledger.json")
}

pub fn leaderboard_file(score_dir: &Path) -> PathBuf {
    score_dir.join("leaderboard.json")
}

use std::path::PathBuf;

use clap::Args;
use serde::{Deserialize, Serialize};

use crate::{
    parse_xml::XmlStrictness,
    paths::{BASE_DATASET_PATH, BASE_GROUND_TRUTH_PATH, BASE_RESULT_PATH, BASE_SCORE_PATH},
};

pub const DEFAULT_MAX_STEPS_PER_TURN: usize = 20;

/// Run-wide settings, passed explicitly to the scheduler, orchestrator and evaluator.
#[derive(Clone, Debug, Args, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Number of entries processed concurrently.
    #[arg(long, value_name = "N", default_value_t = 1)]
    pub num_threads: usize,

    #[arg(long, value_name = "DIR", default_value_os_t = BASE_RESULT_PATH.clone())]
    pub result_dir: PathBuf,

    #[arg(long, value_name = "DIR", default_value_os_t = BASE_SCORE_PATH.clone())]
    pub score_dir: PathBuf,

    #[arg(long, value_name = "DIR", default_value_os_t = BASE_DATASET_PATH.clone())]
    pub dataset_dir: PathBuf,

    #[arg(long, value_name = "DIR", default_value_os_t = BASE_GROUND_TRUTH_PATH.clone())]
    pub ground_truth_dir: PathBuf,

    /// Regenerate entries that already have a result.
    #[arg(long)]
    pub allow_overwrite: bool,

    #[arg(long, default_value_t = 0.001)]
    pub temperature: f64,

    #[arg(long, value_enum, default_value_t = XmlStrictness::Lenient)]
    pub xml_strictness: XmlStrictness,

    /// Store the full chat history in each result's metadata.
    #[arg(long)]
    pub include_input_log: bool,

    #[arg(long, value_name = "N", default_value_t = DEFAULT_MAX_STEPS_PER_TURN)]
    pub max_steps_per_turn: usize,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        HarnessConfig {
            num_threads: 1,
            result_dir: BASE_RESULT_PATH.clone(),
            score_dir: BASE_SCORE_PATH.clone(),
            dataset_dir: BASE_DATASET_PATH.clone(),
            ground_truth_dir: BASE_GROUND_TRUTH_PATH.clone(),
            allow_overwrite: false,
            temperature: 0.001,
            xml_strictness: XmlStrictness::default(),
            include_input_log: false,
            max_steps_per_turn: DEFAULT_MAX_STEPS_PER_TURN,
        }
    }
}

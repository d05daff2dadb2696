use std::sync::Arc;

use tracing::{info, warn};

use crate::{
    aggregator::LeaderboardTable,
    category::{ALL_CATEGORIES, TestCategory},
    config::HarnessConfig,
    datasets::{count_dataset_entries, load_dataset, load_ground_truth},
    decode::SyntaxKind,
    error::HarnessError,
    evaluator::Evaluator,
    handler::{ModelHandler, OracleHandler},
    paths::ground_truth_file,
    scheduler::{GenerationSummary, Scheduler},
    simulator::SimulatorRegistry,
};

/// Loads every entry of `categories` and runs them against `handler`.
pub async fn generate(
    config: Arc<HarnessConfig>,
    registry: Arc<SimulatorRegistry>,
    handler: Arc<dyn ModelHandler>,
    categories: &[TestCategory],
) -> Result<GenerationSummary, HarnessError> {
    let entries = load_dataset(&config.dataset_dir, categories)?;
    info!(
        model = handler.model_name(),
        entries = entries.len(),
        categories = categories.len(),
        "starting generation"
    );
    let scheduler = Scheduler::new(config, registry, handler);
    let summary = scheduler.run(entries).await?;
    info!(
        completed = summary.completed,
        errored = summary.errored,
        skipped = summary.skipped,
        "generation finished"
    );
    Ok(summary)
}

/// Drops categories whose backing simulator class is not registered.
pub fn runnable_categories(
    registry: &SimulatorRegistry,
    categories: &[TestCategory],
) -> Vec<TestCategory> {
    categories
        .iter()
        .copied()
        .filter(|category| match category.simulator_class() {
            Some(class) if !registry.contains(&class) => {
                warn!(%category, class = %class, "no simulator registered, skipping category");
                false
            }
            _ => true,
        })
        .collect()
}

/// Handler that answers with the ground truth of `categories`. Categories
/// without a ground-truth file are left unscripted.
pub fn oracle_handler(
    config: &HarnessConfig,
    model_name: &str,
    categories: &[TestCategory],
) -> Result<OracleHandler, HarnessError> {
    let mut oracle = OracleHandler::new(model_name);
    for category in categories {
        let path = ground_truth_file(&config.ground_truth_dir, *category);
        if !path.exists() {
            continue;
        }
        oracle.add_ground_truth(*category, &load_ground_truth(&config.ground_truth_dir, *category)?)?;
    }
    Ok(oracle)
}

/// Scores `categories` for every model and writes the leaderboard.
pub async fn evaluate(
    config: Arc<HarnessConfig>,
    registry: Arc<SimulatorRegistry>,
    models: &[(String, SyntaxKind)],
    categories: &[TestCategory],
) -> Result<LeaderboardTable, HarnessError> {
    let mut table = LeaderboardTable::new();
    for category in ALL_CATEGORIES.iter().filter(|c| !c.is_memory_prereq()) {
        table.set_dataset_size(*category, count_dataset_entries(&config.dataset_dir, *category)?);
    }
    for (model_name, syntax) in models {
        info!(model = %model_name, "evaluating");
        let evaluator = Evaluator::new(config.clone(), registry.clone(), model_name.clone(), *syntax);
        evaluator.evaluate_categories(categories, &mut table).await?;
    }
    table.write(&config.score_dir)?;
    Ok(table)
}

use std::{process::ExitCode, sync::Arc};

use bfcl_core::{
    category::parse_test_category_argument,
    config::HarnessConfig,
    decode::SyntaxKind,
    error::HarnessError,
    handler::HandlerRegistry,
    pipeline,
    simulator::SimulatorRegistry,
};
use clap::{Parser, Subcommand};
use tracing::{error, info};

/// Model name under which the ground-truth replay handler is registered.
const ORACLE_MODEL: &str = "oracle";

/// Function-calling benchmark harness.
#[derive(Parser, Debug)]
#[command(name = "bfcl", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run test entries against a model and write result files
    Generate {
        #[arg(long, default_value = ORACLE_MODEL)]
        model: String,

        /// Categories or groups (all, non_live, live, multi_turn, web_search, memory)
        #[arg(long = "test-category", num_args = 1.., default_value = "all")]
        test_category: Vec<String>,

        #[command(flatten)]
        config: HarnessConfig,
    },
    /// Score result files and write the leaderboard
    Evaluate {
        #[arg(long, num_args = 1.., required = true)]
        model: Vec<String>,

        #[arg(long = "test-category", num_args = 1.., default_value = "all")]
        test_category: Vec<String>,

        /// Call syntax the models wrote their output in
        #[arg(long, value_enum, default_value_t = SyntaxKind::PythonCall)]
        syntax: SyntaxKind,

        #[command(flatten)]
        config: HarnessConfig,
    },
}

async fn run(cli: Cli) -> Result<(), HarnessError> {
    let registry = Arc::new(SimulatorRegistry::default());
    match cli.command {
        Commands::Generate {
            model,
            test_category,
            config,
        } => {
            let categories =
                pipeline::runnable_categories(&registry, &parse_test_category_argument(&test_category)?);
            let mut handlers = HandlerRegistry::new();
            handlers.register(Arc::new(pipeline::oracle_handler(
                &config,
                ORACLE_MODEL,
                &categories,
            )?));
            let handler = handlers.get(&model)?;
            pipeline::generate(Arc::new(config), registry, handler, &categories).await?;
        }
        Commands::Evaluate {
            model,
            test_category,
            syntax,
            config,
        } => {
            let categories = parse_test_category_argument(&test_category)?;
            let models: Vec<(String, SyntaxKind)> = model.into_iter().map(|m| (m, syntax)).collect();
            let table = pipeline::evaluate(Arc::new(config), registry, &models, &categories).await?;
            for ranked in table.ranked() {
                info!(
                    rank = ranked.rank,
                    model = %ranked.summary.model_name,
                    overall = ranked.summary.overall.accuracy,
                    "final ranking"
                );
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("bfcl_core=info,bfcl=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "run aborted");
            ExitCode::FAILURE
        }
    }
}

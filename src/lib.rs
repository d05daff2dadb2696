pub mod aggregator;
pub mod base_api;
pub mod category;
pub mod config;
pub mod datasets;
pub mod decode;
pub mod error;
pub mod evaluator;
pub mod execution;
pub mod function_call;
pub mod handler;
pub mod ledger;
pub mod math_api;
pub mod memory_api;
pub mod message;
pub mod multi_turn;
pub mod parse_ast;
pub mod parse_xml;
pub mod paths;
pub mod pipeline;
#[cfg(feature = "python")]
pub mod python_interface;
pub mod reminder;
pub mod scheduler;
pub mod simulator;
pub mod snapshot;
pub mod utils;

#[cfg(feature = "python")]
use pyo3::prelude::*;

#[cfg(feature = "python")]
#[pymodule]
pub mod bfcl_core {
    #[pymodule_export]
    use super::python_interface::{run_evaluation, run_generation};
}

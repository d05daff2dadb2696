use std::sync::LazyLock;

use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::{
    error::{ExecutionError, SimulatorError},
    simulator::{DispatchTable, ReturnValue, ScenarioContext, Simulator},
};

/// Stateless arithmetic helpers. Results are `{"result": x}`.
#[derive(Clone, Copy, Debug, Default)]
pub struct MathApi;

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BinaryArgs {
    pub a: f64,
    pub b: f64,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UnaryArgs {
    pub number: f64,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListArgs {
    pub numbers: Vec<f64>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PowerArgs {
    pub base: f64,
    pub exponent: f64,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoundArgs {
    pub number: f64,
    #[serde(default)]
    pub decimal_places: u32,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PercentageArgs {
    pub part: f64,
    pub whole: f64,
}

fn result(x: f64) -> Result<Value, String> {
    if !x.is_finite() {
        return Err(format!("Result is not a finite number: {}", x));
    }
    Ok(json!({ "result": x }))
}

fn non_empty(numbers: &[f64]) -> Result<(), String> {
    if numbers.is_empty() {
        return Err("Cannot calculate on an empty list".to_string());
    }
    Ok(())
}

impl MathApi {
    pub fn mean(numbers: &[f64]) -> Result<Value, String> {
        non_empty(numbers)?;
        result(numbers.iter().sum::<f64>() / numbers.len() as f64)
    }

    pub fn standard_deviation(numbers: &[f64]) -> Result<Value, String> {
        non_empty(numbers)?;
        let mean = numbers.iter().sum::<f64>() / numbers.len() as f64;
        let variance =
            numbers.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / numbers.len() as f64;
        result(variance.sqrt())
    }

    pub fn divide(args: BinaryArgs) -> Result<Value, String> {
        if args.b == 0.0 {
            return Err("Cannot divide by zero".to_string());
        }
        result(args.a / args.b)
    }

    pub fn square_root(args: UnaryArgs) -> Result<Value, String> {
        if args.number < 0.0 {
            return Err("Cannot calculate square root of a negative number".to_string());
        }
        result(args.number.sqrt())
    }

    pub fn round_number(args: RoundArgs) -> Result<Value, String> {
        let factor = 10f64.powi(args.decimal_places as i32);
        result((args.number * factor).round() / factor)
    }

    pub fn percentage(args: PercentageArgs) -> Result<Value, String> {
        if args.whole == 0.0 {
            return Err("Whole value cannot be zero".to_string());
        }
        result(args.part / args.whole * 100.0)
    }
}

static MATH_API_METHODS: LazyLock<DispatchTable<MathApi>> = LazyLock::new(|| {
    DispatchTable::new()
        .method("add", |_: &mut MathApi, args: BinaryArgs| result(args.a + args.b))
        .method("subtract", |_: &mut MathApi, args: BinaryArgs| result(args.a - args.b))
        .method("multiply", |_: &mut MathApi, args: BinaryArgs| result(args.a * args.b))
        .method("divide", |_: &mut MathApi, args: BinaryArgs| MathApi::divide(args))
        .method("power", |_: &mut MathApi, args: PowerArgs| {
            result(args.base.powf(args.exponent))
        })
        .method("square_root", |_: &mut MathApi, args: UnaryArgs| MathApi::square_root(args))
        .method("absolute_value", |_: &mut MathApi, args: UnaryArgs| result(args.number.abs()))
        .method("round_number", |_: &mut MathApi, args: RoundArgs| MathApi::round_number(args))
        .method("percentage", |_: &mut MathApi, args: PercentageArgs| MathApi::percentage(args))
        .method("mean", |_: &mut MathApi, args: ListArgs| MathApi::mean(&args.numbers))
        .method("standard_deviation", |_: &mut MathApi, args: ListArgs| {
            MathApi::standard_deviation(&args.numbers)
        })
        .method("sum_values", |_: &mut MathApi, args: ListArgs| {
            result(args.numbers.iter().sum())
        })
        .method("max_value", |_: &mut MathApi, args: ListArgs| {
            non_empty(&args.numbers)?;
            result(args.numbers.iter().copied().fold(f64::NEG_INFINITY, f64::max))
        })
        .method("min_value", |_: &mut MathApi, args: ListArgs| {
            non_empty(&args.numbers)?;
            result(args.numbers.iter().copied().fold(f64::INFINITY, f64::min))
        })
});

impl Simulator for MathApi {
    fn class_name(&self) -> &'static str {
        "MathAPI"
    }

    fn load_scenario(
        &mut self,
        _initial_config: &Value,
        _ctx: &ScenarioContext,
    ) -> Result<(), SimulatorError> {
        Ok(())
    }

    fn method_names(&self) -> Vec<&'static str> {
        MATH_API_METHODS.method_names()
    }

    fn invoke(
        &mut self,
        method: &str,
        arguments: &IndexMap<String, Value>,
    ) -> Result<ReturnValue, ExecutionError> {
        MATH_API_METHODS.invoke(self, method, arguments)
    }

    fn snapshot(&self) -> IndexMap<String, Value> {
        IndexMap::new()
    }
}

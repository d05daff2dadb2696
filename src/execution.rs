use std::collections::HashMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::{ExecutionError, SimulatorError},
    function_call::FunctionCall,
    parse_ast::decode_function_list,
    simulator::{ReturnValue, ScenarioContext, Simulator},
};

/// Outcome of one call. Failures are data, never panics.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionResult {
    Success { value: ReturnValue },
    Error { message: String },
}

impl ExecutionResult {
    pub fn success(value: impl Into<ReturnValue>) -> Self {
        ExecutionResult::Success {
            value: value.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ExecutionResult::Error {
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ExecutionResult::Error { .. })
    }

    /// Content of the tool message for this call.
    pub fn content(&self) -> String {
        match self {
            ExecutionResult::Success { value } => value.to_content_string(),
            ExecutionResult::Error { message } => format!("Error during execution: {}", message),
        }
    }
}

impl From<Result<ReturnValue, ExecutionError>> for ExecutionResult {
    fn from(result: Result<ReturnValue, ExecutionError>) -> Self {
        match result {
            Ok(value) => ExecutionResult::Success { value },
            Err(e) => ExecutionResult::error(e.to_string()),
        }
    }
}

/// Live simulator instances for one entry, keyed by class name. Each method
/// name resolves to exactly one class.
#[derive(Default)]
pub struct InstanceSet {
    instances: IndexMap<String, Box<dyn Simulator>>,
    method_owner: HashMap<&'static str, String>,
}

impl InstanceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        class_name: String,
        instance: Box<dyn Simulator>,
    ) -> Result<(), SimulatorError> {
        for method in instance.method_names() {
            if let Some(owner) = self.method_owner.get(method) {
                if *owner != class_name {
                    return Err(SimulatorError::MethodCollision {
                        method: method.to_string(),
                        first: owner.clone(),
                        second: class_name,
                    });
                }
            }
        }
        for method in instance.method_names() {
            self.method_owner.insert(method, class_name.clone());
        }
        self.instances.insert(class_name, instance);
        Ok(())
    }

    pub fn class_names(&self) -> impl Iterator<Item = &str> {
        self.instances.keys().map(String::as_str)
    }

    pub fn get(&self, class_name: &str) -> Option<&dyn Simulator> {
        self.instances.get(class_name).map(|b| b.as_ref())
    }

    pub fn owner_of(&self, method: &str) -> Option<&str> {
        self.method_owner.get(method).map(String::as_str)
    }

    pub fn call(&mut self, call: &FunctionCall) -> ExecutionResult {
        let Some(owner) = self.method_owner.get(call.name.as_str()).cloned() else {
            return ExecutionError::UnknownMethod(call.name.clone()).into_result();
        };
        let Some(instance) = self.instances.get_mut(&owner) else {
            return ExecutionError::UnknownMethod(call.name.clone()).into_result();
        };
        let result: ExecutionResult = instance.invoke(&call.name, &call.arguments).into();
        self.share_device_from(&owner);
        result
    }

    /// Copies `source`'s device state into every other class on the device,
    /// so all of them see one Wi-Fi and login state.
    pub fn share_device_from(&mut self, source: &str) {
        let Some(device) = self.instances.get(source).and_then(|i| i.device()).cloned() else {
            return;
        };
        for (name, instance) in self.instances.iter_mut() {
            if name == source {
                continue;
            }
            if let Some(target) = instance.device_mut() {
                *target = device.clone();
            }
        }
    }

    /// State of every instance, keyed by class name.
    pub fn snapshot(&self) -> IndexMap<String, IndexMap<String, Value>> {
        self.instances
            .iter()
            .map(|(name, instance)| (name.clone(), instance.snapshot()))
            .collect()
    }

    pub fn complete_entry(&self, ctx: &ScenarioContext) -> Result<(), SimulatorError> {
        for instance in self.instances.values() {
            instance.on_entry_complete(ctx)?;
        }
        Ok(())
    }
}

impl ExecutionError {
    fn into_result(self) -> ExecutionResult {
        ExecutionResult::error(self.to_string())
    }
}

/// Runs `calls` strictly in order. The result list always has the same length
/// as `calls`; a failing call does not stop the ones after it and earlier
/// side effects are kept.
pub fn execute(calls: &[FunctionCall], instances: &mut InstanceSet) -> Vec<ExecutionResult> {
    calls
        .iter()
        .map(|call| {
            let result = instances.call(call);
            if let ExecutionResult::Error { message } = &result {
                tracing::debug!(call = %call.to_python_call_string(), error = %message, "call failed");
            }
            result
        })
        .collect()
}

/// Executes calls given as Python call strings, as recorded in ground truth.
/// A string that does not decode yields an error result in its slot.
pub fn execute_call_strings(call_strings: &[String], instances: &mut InstanceSet) -> Vec<ExecutionResult> {
    call_strings
        .iter()
        .map(|text| match decode_function_list(text) {
            Ok(calls) if calls.len() == 1 => instances.call(&calls[0]),
            Ok(calls) => ExecutionResult::error(format!(
                "expected exactly one call in {:?}, found {}",
                text,
                calls.len()
            )),
            Err(e) => ExecutionResult::error(e.to_string()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        category::TestCategory,
        simulator::SimulatorRegistry,
    };
    use serde_json::json;

    fn ctx() -> ScenarioContext {
        ScenarioContext {
            entry_id: "multi_turn_base_0".to_string(),
            category: TestCategory::MultiTurnBase,
            snapshot_dir: std::env::temp_dir(),
            scenario: None,
            long_context: false,
        }
    }

    fn calls(value: Value) -> Vec<FunctionCall> {
        serde_json::from_value(value).unwrap()
    }

    fn math_instances() -> InstanceSet {
        SimulatorRegistry::default()
            .instantiate(&["MathAPI".to_string()], &IndexMap::new(), &ctx())
            .unwrap()
    }

    #[test]
    fn test_missing_required_argument_does_not_block_later_calls() {
        let mut instances = math_instances();
        let results = execute(
            &calls(json!([
                {"add": {"a": 2}},
                {"add": {"a": 2, "b": 3}}
            ])),
            &mut instances,
        );
        assert_eq!(results.len(), 2);
        assert!(results[0].is_error());
        assert!(results[0].content().contains("missing field `b`"));
        assert_eq!(results[1], ExecutionResult::success(json!({"result": 5.0})));
    }

    #[test]
    fn test_execute_never_raises_on_garbage() {
        let mut instances = math_instances();
        let input = calls(json!([
            {"launch_rocket": {}},
            {"divide": {"a": 1, "b": 0}},
            {"add": {"a": "two", "b": 3}},
            {"add": {"a": 1, "b": 1, "c": 1}},
            {"mean": {"numbers": []}}
        ]));
        let results = execute(&input, &mut instances);
        assert_eq!(results.len(), input.len());
        assert!(results.iter().all(ExecutionResult::is_error));
        assert_eq!(results[0].content(), "Error during execution: Unknown method: launch_rocket");
    }

    #[test]
    fn test_side_effects_persist_after_a_failure() {
        let config: IndexMap<String, Value> =
            serde_json::from_value(json!({"ReminderApi": {"reminder_list": {}, "reminder_id_counter": 0}}))
                .unwrap();
        let mut instances = SimulatorRegistry::default()
            .instantiate(&["ReminderApi".to_string()], &config, &ctx())
            .unwrap();
        let results = execute(
            &calls(json!([
                {"add_reminder": {"title": "Dentist", "description": "checkup", "time": "2024-07-15 09:30"}},
                {"delete_reminder": {"reminder_id": 42}}
            ])),
            &mut instances,
        );
        assert!(!results[0].is_error());
        assert!(results[1].is_error());
        let snapshot = instances.snapshot();
        assert_eq!(snapshot["ReminderApi"]["reminder_list"].as_object().unwrap().len(), 1);
    }

    #[test]
    fn test_method_collision_is_configuration_error() {
        let mut instances = InstanceSet::new();
        instances
            .insert("MathAPI".to_string(), Box::new(crate::math_api::MathApi))
            .unwrap();
        let err = instances
            .insert("MathAPI_copy".to_string(), Box::new(crate::math_api::MathApi))
            .unwrap_err();
        assert!(matches!(err, SimulatorError::MethodCollision { .. }));
    }

    #[test]
    fn test_unknown_class_is_rejected() {
        let err = SimulatorRegistry::default()
            .instantiate(&["TravelAPI".to_string()], &IndexMap::new(), &ctx())
            .err()
            .unwrap();
        assert!(matches!(err, SimulatorError::UnknownClass(name) if name == "TravelAPI"));
    }

    #[test]
    fn test_device_state_is_shared_across_classes() {
        let config: IndexMap<String, Value> = serde_json::from_value(json!({
            "BaseApi": {"wifi": false, "logged_in": true},
            "MessageApi": {"device": {"wifi": true, "logged_in": true}}
        }))
        .unwrap();
        let mut instances = SimulatorRegistry::default()
            .instantiate(
                &["BaseApi".to_string(), "MessageApi".to_string(), "ReminderApi".to_string()],
                &config,
                &ctx(),
            )
            .unwrap();
        let send = calls(json!([
            {"send_message": {"sender_name": "Eve", "receiver_name": "Frank", "message": "hi"}}
        ]));

        // BaseApi's config wins over the message backend's own device
        assert!(execute(&send, &mut instances)[0].content().contains("Wi-Fi is turned off"));

        execute(&calls(json!([{"turn_on_wifi": {}}])), &mut instances);
        assert!(!execute(&send, &mut instances)[0].is_error());

        execute(&calls(json!([{"logout_device": {}}])), &mut instances);
        let results = execute(
            &calls(json!([{"delete_reminder": {"reminder_id": 1}}])),
            &mut instances,
        );
        assert!(results[0].content().contains("not logged in"));
        let snapshot = instances.snapshot();
        assert_eq!(snapshot["MessageApi"]["device"]["logged_in"], json!(false));
        assert_eq!(snapshot["ReminderApi"]["device"]["logged_in"], json!(false));
    }

    #[test]
    fn test_execute_call_strings() {
        let mut instances = math_instances();
        let results = execute_call_strings(
            &["add(a=1, b=2)".to_string(), "add(a=1,".to_string()],
            &mut instances,
        );
        assert_eq!(results[0], ExecutionResult::success(json!({"result": 3.0})));
        assert!(results[1].is_error());
    }
}

use std::path::PathBuf;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::{
    base_api::BaseApi,
    category::TestCategory,
    error::{ExecutionError, SimulatorError},
    execution::InstanceSet,
    math_api::MathApi,
    memory_api::MemoryApi,
    message::MessageApi,
    reminder::ReminderApi,
};

/// Value returned by a simulator method.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReturnValue {
    Image { mime_type: String, image_base64: String },
    Json(Value),
}

impl ReturnValue {
    /// Text fed back to the model and compared by the scorer. Images are
    /// replaced by a placeholder object so they never look like plain output.
    pub fn to_content_string(&self) -> String {
        match self {
            ReturnValue::Json(Value::String(s)) => s.clone(),
            ReturnValue::Json(other) => other.to_string(),
            ReturnValue::Image { .. } => self.placeholder().to_string(),
        }
    }

    pub fn placeholder(&self) -> Value {
        match self {
            ReturnValue::Image {
                mime_type,
                image_base64,
            } => serde_json::json!({
                "type": "image",
                "mime_type": mime_type,
                "data_length": image_base64.len(),
            }),
            ReturnValue::Json(v) => v.clone(),
        }
    }
}

impl From<Value> for ReturnValue {
    fn from(value: Value) -> Self {
        ReturnValue::Json(value)
    }
}

impl From<String> for ReturnValue {
    fn from(value: String) -> Self {
        ReturnValue::Json(Value::String(value))
    }
}

impl From<&str> for ReturnValue {
    fn from(value: &str) -> Self {
        ReturnValue::Json(Value::String(value.to_string()))
    }
}

/// Where an instance is being set up, for backends that persist state
/// between dependent entries.
#[derive(Clone, Debug)]
pub struct ScenarioContext {
    pub entry_id: String,
    pub category: TestCategory,
    pub snapshot_dir: PathBuf,
    /// Memory scenario, when the entry belongs to one.
    pub scenario: Option<String>,
    pub long_context: bool,
}

impl ScenarioContext {
    /// Folder holding the snapshots of this entry's memory scenario.
    pub fn scenario_snapshot_dir(&self) -> PathBuf {
        match &self.scenario {
            Some(scenario) => self.snapshot_dir.join(scenario),
            None => self.snapshot_dir.clone(),
        }
    }
}

/// Argument type for methods that take no parameters.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NoArgs {}

type BoxedHandler<S> =
    Box<dyn Fn(&mut S, Value) -> Result<ReturnValue, ExecutionError> + Send + Sync>;

/// Method name → typed handler, built once per simulator class.
pub struct DispatchTable<S> {
    methods: IndexMap<&'static str, BoxedHandler<S>>,
}

impl<S> Default for DispatchTable<S> {
    fn default() -> Self {
        DispatchTable {
            methods: IndexMap::new(),
        }
    }
}

impl<S> DispatchTable<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `name`. Arguments are deserialized into `A`; a missing,
    /// unexpected or mistyped argument becomes `InvalidArguments`.
    pub fn method<A, R, F>(mut self, name: &'static str, handler: F) -> Self
    where
        A: DeserializeOwned,
        R: Into<ReturnValue>,
        F: Fn(&mut S, A) -> Result<R, String> + Send + Sync + 'static,
    {
        let boxed: BoxedHandler<S> = Box::new(move |target, args| {
            let parsed: A =
                serde_json::from_value(args).map_err(|e| ExecutionError::InvalidArguments {
                    method: name.to_string(),
                    reason: e.to_string(),
                })?;
            handler(target, parsed)
                .map(Into::into)
                .map_err(ExecutionError::Simulator)
        });
        self.methods.insert(name, boxed);
        self
    }

    pub fn invoke(
        &self,
        target: &mut S,
        method: &str,
        arguments: &IndexMap<String, Value>,
    ) -> Result<ReturnValue, ExecutionError> {
        let Some(handler) = self.methods.get(method) else {
            return Err(ExecutionError::UnknownMethod(method.to_string()));
        };
        let args = Value::Object(
            arguments
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        );
        handler(target, args)
    }

    pub fn method_names(&self) -> Vec<&'static str> {
        self.methods.keys().copied().collect()
    }
}

/// Lifecycle contract every backend simulator implements.
pub trait Simulator: Send {
    fn class_name(&self) -> &'static str;

    fn load_scenario(
        &mut self,
        initial_config: &Value,
        ctx: &ScenarioContext,
    ) -> Result<(), SimulatorError>;

    fn method_names(&self) -> Vec<&'static str>;

    fn invoke(
        &mut self,
        method: &str,
        arguments: &IndexMap<String, Value>,
    ) -> Result<ReturnValue, ExecutionError>;

    /// Comparable state. Only the fields returned here take part in scoring.
    fn snapshot(&self) -> IndexMap<String, Value>;

    /// Wi-Fi and login state, for classes that sit on the shared device.
    fn device(&self) -> Option<&BaseApi> {
        None
    }

    fn device_mut(&mut self) -> Option<&mut BaseApi> {
        None
    }

    /// Called once after the entry's last turn.
    fn on_entry_complete(&self, _ctx: &ScenarioContext) -> Result<(), SimulatorError> {
        Ok(())
    }
}

/// Builds a full snapshot from a serializable state struct.
pub fn snapshot_fields<T: Serialize>(state: &T) -> IndexMap<String, Value> {
    match serde_json::to_value(state) {
        Ok(Value::Object(map)) => map.into_iter().collect(),
        _ => IndexMap::new(),
    }
}

/// Deserializes a class's initial config, treating `null` as "all defaults".
pub fn config_from_value<T: DeserializeOwned + Default>(
    class: &str,
    initial_config: &Value,
) -> Result<T, SimulatorError> {
    if initial_config.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(initial_config.clone()).map_err(|e| SimulatorError::InvalidConfig {
        class: class.to_string(),
        reason: e.to_string(),
    })
}

type Constructor = fn() -> Box<dyn Simulator>;

/// Class name → constructor.
pub struct SimulatorRegistry {
    constructors: IndexMap<&'static str, Constructor>,
}

impl Default for SimulatorRegistry {
    fn default() -> Self {
        let mut registry = SimulatorRegistry::empty();
        registry.register("BaseApi", || Box::new(BaseApi::default()));
        registry.register("MessageApi", || Box::new(MessageApi::default()));
        registry.register("ReminderApi", || Box::new(ReminderApi::default()));
        registry.register("MathAPI", || Box::new(MathApi));
        registry.register("MemoryAPI_kv", || Box::new(MemoryApi::default()));
        registry
    }
}

impl SimulatorRegistry {
    pub fn empty() -> Self {
        SimulatorRegistry {
            constructors: IndexMap::new(),
        }
    }

    pub fn register(&mut self, class_name: &'static str, constructor: Constructor) {
        self.constructors.insert(class_name, constructor);
    }

    pub fn contains(&self, class_name: &str) -> bool {
        self.constructors.contains_key(class_name)
    }

    /// Fresh instances for `involved_classes`, each loaded from its entry in
    /// `initial_config`.
    pub fn instantiate(
        &self,
        involved_classes: &[String],
        initial_config: &IndexMap<String, Value>,
        ctx: &ScenarioContext,
    ) -> Result<InstanceSet, SimulatorError> {
        let mut instances = InstanceSet::new();
        for class_name in involved_classes {
            let Some(constructor) = self.constructors.get(class_name.as_str()) else {
                return Err(SimulatorError::UnknownClass(class_name.clone()));
            };
            let mut instance = constructor();
            let config = initial_config.get(class_name).unwrap_or(&Value::Null);
            instance.load_scenario(config, ctx)?;
            instances.insert(class_name.clone(), instance)?;
        }
        // BaseApi's config is the device state every other class starts from
        if instances.get("BaseApi").is_some() {
            instances.share_device_from("BaseApi");
        }
        Ok(instances)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Counter {
        value: i64,
    }

    #[derive(Deserialize)]
    #[serde(deny_unknown_fields)]
    struct StepArgs {
        by: i64,
    }

    fn table() -> DispatchTable<Counter> {
        DispatchTable::new()
            .method("step", |c: &mut Counter, args: StepArgs| {
                c.value += args.by;
                Ok(json!({"value": c.value}))
            })
            .method("fail", |_: &mut Counter, _: NoArgs| Err::<Value, _>("boom".to_string()))
    }

    fn args(value: Value) -> IndexMap<String, Value> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_dispatch_table_invokes_typed_handler() {
        let mut counter = Counter { value: 1 };
        let result = table().invoke(&mut counter, "step", &args(json!({"by": 2}))).unwrap();
        assert_eq!(result, ReturnValue::Json(json!({"value": 3})));
        assert_eq!(counter.value, 3);
    }

    #[test]
    fn test_dispatch_table_errors() {
        let mut counter = Counter { value: 0 };
        let t = table();
        assert_eq!(
            t.invoke(&mut counter, "jump", &args(json!({}))),
            Err(ExecutionError::UnknownMethod("jump".to_string()))
        );
        assert!(matches!(
            t.invoke(&mut counter, "step", &args(json!({}))),
            Err(ExecutionError::InvalidArguments { .. })
        ));
        assert!(matches!(
            t.invoke(&mut counter, "step", &args(json!({"by": 1, "extra": 2}))),
            Err(ExecutionError::InvalidArguments { .. })
        ));
        assert_eq!(
            t.invoke(&mut counter, "fail", &args(json!({}))),
            Err(ExecutionError::Simulator("boom".to_string()))
        );
        assert_eq!(counter.value, 0);
    }

    #[test]
    fn test_image_placeholder_is_not_plain_text() {
        let image = ReturnValue::Image {
            mime_type: "image/png".to_string(),
            image_base64: "aGVsbG8=".to_string(),
        };
        assert_eq!(
            image.placeholder(),
            json!({"type": "image", "mime_type": "image/png", "data_length": 8})
        );
        assert_ne!(image.to_content_string(), "aGVsbG8=");
        assert_eq!(ReturnValue::from("ok").to_content_string(), "ok");
    }
}

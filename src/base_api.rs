use std::sync::LazyLock;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::{ExecutionError, SimulatorError},
    simulator::{
        DispatchTable, NoArgs, ReturnValue, ScenarioContext, Simulator, config_from_value,
        snapshot_fields,
    },
};

/// Device state - Wi-Fi and login. Embedded by MessageApi and ReminderApi;
/// when BaseApi is involved too, the instance set keeps all copies in step.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BaseApi {
    pub wifi: bool,
    pub logged_in: bool,
}

impl Default for BaseApi {
    fn default() -> Self {
        BaseApi {
            wifi: false,
            logged_in: true,
        }
    }
}

impl BaseApi {
    pub fn turn_on_wifi(&mut self) -> Result<String, String> {
        self.wifi = true;
        Ok("Wi-Fi has been turned on".to_string())
    }

    pub fn login_device(&mut self) -> Result<String, String> {
        self.logged_in = true;
        Ok("Device has been logged in".to_string())
    }

    pub fn logout_device(&mut self) -> Result<String, String> {
        if !self.logged_in {
            return Err("Device is already logged out".to_string());
        }
        self.logged_in = false;
        Ok("Device has been logged out".to_string())
    }
}

static BASE_API_METHODS: LazyLock<DispatchTable<BaseApi>> = LazyLock::new(|| {
    DispatchTable::new()
        .method("turn_on_wifi", |api: &mut BaseApi, _: NoArgs| api.turn_on_wifi())
        .method("login_device", |api: &mut BaseApi, _: NoArgs| api.login_device())
        .method("logout_device", |api: &mut BaseApi, _: NoArgs| api.logout_device())
});

impl Simulator for BaseApi {
    fn class_name(&self) -> &'static str {
        "BaseApi"
    }

    fn load_scenario(
        &mut self,
        initial_config: &Value,
        _ctx: &ScenarioContext,
    ) -> Result<(), SimulatorError> {
        *self = config_from_value(self.class_name(), initial_config)?;
        Ok(())
    }

    fn method_names(&self) -> Vec<&'static str> {
        BASE_API_METHODS.method_names()
    }

    fn invoke(
        &mut self,
        method: &str,
        arguments: &IndexMap<String, Value>,
    ) -> Result<ReturnValue, ExecutionError> {
        BASE_API_METHODS.invoke(self, method, arguments)
    }

    fn snapshot(&self) -> IndexMap<String, Value> {
        snapshot_fields(self)
    }

    fn device(&self) -> Option<&BaseApi> {
        Some(self)
    }

    fn device_mut(&mut self) -> Option<&mut BaseApi> {
        Some(self)
    }
}

use std::sync::LazyLock;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    base_api::BaseApi,
    error::{ExecutionError, SimulatorError},
    simulator::{
        DispatchTable, NoArgs, ReturnValue, ScenarioContext, Simulator, config_from_value,
        snapshot_fields,
    },
};

/// Reminder record
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reminder {
    pub reminder_id: usize,
    pub title: String,
    pub description: String,
    pub time: String, // format: "YYYY-MM-DD HH:MM"
    pub notified: bool,
}

/// Number of already-notified reminders added for long-context scenarios.
pub const LONG_CONTEXT_REMINDER_COUNT: usize = 40;

/// Reminder backend with a fixed capacity.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReminderApi {
    pub device: BaseApi,
    pub max_capacity: usize,
    pub reminder_list: IndexMap<usize, Reminder>, // key: reminder id
    pub reminder_id_counter: usize,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TitleArgs {
    pub title: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AddReminderArgs {
    pub title: String,
    pub description: String,
    pub time: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeleteReminderArgs {
    pub reminder_id: usize,
}

impl Default for ReminderApi {
    fn default() -> Self {
        let reminder_list: IndexMap<usize, Reminder> = [
            (1, "Doctor's Appointment", "Visit Dr. Smith for a checkup.", "2024-07-15 09:30"),
            (2, "Team Meeting", "Monthly project review with the team.", "2024-07-17 11:00"),
        ]
        .into_iter()
        .map(|(id, title, description, time)| {
            (
                id,
                Reminder {
                    reminder_id: id,
                    title: title.to_string(),
                    description: description.to_string(),
                    time: time.to_string(),
                    notified: false,
                },
            )
        })
        .collect();
        ReminderApi {
            device: BaseApi::default(),
            max_capacity: 6,
            reminder_list,
            reminder_id_counter: 2,
        }
    }
}

impl ReminderApi {
    pub fn view_reminder_by_title(&self, title: &str) -> Result<Value, String> {
        if !self.device.logged_in {
            return Err("The device is not logged in, so you cannot view notifications".to_string());
        }
        match self.reminder_list.values().find(|reminder| reminder.title == title) {
            Some(reminder) => serde_json::to_value(reminder).map_err(|e| e.to_string()),
            None => Err(format!("No reminder found with the title '{}'.", title)),
        }
    }

    pub fn add_reminder(&mut self, args: AddReminderArgs) -> Result<String, String> {
        if !self.device.logged_in {
            return Err("Device not logged in. Unable to add a new reminder.".to_string());
        }
        if self.reminder_list.len() >= self.max_capacity {
            return Err("Reminder capacity is full. Unable to add a new reminder.".to_string());
        }

        self.reminder_id_counter += 1;
        let reminder_id = self.reminder_id_counter;
        self.reminder_list.insert(
            reminder_id,
            Reminder {
                reminder_id,
                title: args.title.clone(),
                description: args.description,
                time: args.time,
                notified: false,
            },
        );
        Ok(format!("Reminder '{}' was successfully added.", args.title))
    }

    pub fn delete_reminder(&mut self, reminder_id: usize) -> Result<String, String> {
        if !self.device.logged_in {
            return Err("Device not logged in. Unable to delete the specified reminder.".to_string());
        }
        if self.reminder_list.shift_remove(&reminder_id).is_none() {
            return Err("Reminder ID does not exist.".to_string());
        }
        Ok(format!("Reminder ID {} was successfully deleted.", reminder_id))
    }

    /// Pads the list with past, notified reminders and raises the capacity
    /// by the same amount, so the scenario's own reminders keep their room.
    fn add_long_context_reminders(&mut self) {
        for i in 0..LONG_CONTEXT_REMINDER_COUNT {
            self.reminder_id_counter += 1;
            let reminder_id = self.reminder_id_counter;
            self.reminder_list.insert(
                reminder_id,
                Reminder {
                    reminder_id,
                    title: format!("Archived reminder {}", i + 1),
                    description: format!("Past reminder number {} kept for the record.", i + 1),
                    time: format!("2023-{:02}-{:02} 08:00", i % 12 + 1, i % 28 + 1),
                    notified: true,
                },
            );
        }
        self.max_capacity += LONG_CONTEXT_REMINDER_COUNT;
    }

    pub fn view_all_reminders(&self) -> Result<Value, String> {
        if self.reminder_list.is_empty() {
            return Err("No reminders found.".to_string());
        }
        let reminders: Vec<&Reminder> = self.reminder_list.values().collect();
        serde_json::to_value(reminders).map_err(|e| e.to_string())
    }
}

static REMINDER_API_METHODS: LazyLock<DispatchTable<ReminderApi>> = LazyLock::new(|| {
    DispatchTable::new()
        .method("view_reminder_by_title", |api: &mut ReminderApi, args: TitleArgs| {
            api.view_reminder_by_title(&args.title)
        })
        .method("add_reminder", ReminderApi::add_reminder)
        .method("delete_reminder", |api: &mut ReminderApi, args: DeleteReminderArgs| {
            api.delete_reminder(args.reminder_id)
        })
        .method("view_all_reminders", |api: &mut ReminderApi, _: NoArgs| api.view_all_reminders())
});

impl Simulator for ReminderApi {
    fn class_name(&self) -> &'static str {
        "ReminderApi"
    }

    fn load_scenario(
        &mut self,
        initial_config: &Value,
        ctx: &ScenarioContext,
    ) -> Result<(), SimulatorError> {
        *self = config_from_value(self.class_name(), initial_config)?;
        if ctx.long_context {
            self.add_long_context_reminders();
        }
        Ok(())
    }

    fn method_names(&self) -> Vec<&'static str> {
        REMINDER_API_METHODS.method_names()
    }

    fn invoke(
        &mut self,
        method: &str,
        arguments: &IndexMap<String, Value>,
    ) -> Result<ReturnValue, ExecutionError> {
        REMINDER_API_METHODS.invoke(self, method, arguments)
    }

    fn snapshot(&self) -> IndexMap<String, Value> {
        snapshot_fields(self)
    }

    fn device(&self) -> Option<&BaseApi> {
        Some(&self.device)
    }

    fn device_mut(&mut self) -> Option<&mut BaseApi> {
        Some(&mut self.device)
    }
}

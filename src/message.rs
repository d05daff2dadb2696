use std::sync::LazyLock;

use chrono::NaiveDate;
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

/// User information for MessageApi
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageUser {
    pub user_id: String,
    pub phone_number: String,
    pub occupation: String,
}

/// Message record in inbox
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub sender_id: String,
    pub receiver_id: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>, // new messages have no time
}

/// Messaging backend: users, a capacity-bounded inbox and a message id counter.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MessageApi {
    pub device: BaseApi,
    pub max_capacity: usize,
    pub user_list: IndexMap<String, MessageUser>, // key: user name (e.g., "Eve")
    pub inbox: IndexMap<String, Message>,         // key: message_id
    pub message_id_counter: usize,
}

#[derive(Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct SendMessageArgs {
    pub sender_name: String,
    pub receiver_name: String,
    pub message: String,
}

#[derive(Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct DeleteMessageArgs {
    pub message_id: usize,
}

#[derive(Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ViewMessagesBetweenUsersArgs {
    pub sender_name: String,
    pub receiver_name: String,
}

#[derive(Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct SearchMessagesArgs {
    pub user_name: String,
    pub keyword: String,
}

fn user(user_id: &str, phone_number: &str, occupation: &str) -> MessageUser {
    MessageUser {
        user_id: user_id.to_string(),
        phone_number: phone_number.to_string(),
        occupation: occupation.to_string(),
    }
}

fn message(sender_id: &str, receiver_id: &str, text: &str, time: &str) -> Message {
    Message {
        sender_id: sender_id.to_string(),
        receiver_id: receiver_id.to_string(),
        message: text.to_string(),
        time: Some(time.to_string()),
    }
}

impl Default for MessageApi {
    fn default() -> Self {
        let user_list: IndexMap<String, MessageUser> = [
            ("Eve", user("USR100", "123-456-7890", "Software Engineer")),
            ("Frank", user("USR101", "234-567-8901", "Data Scientist")),
            ("Grace", user("USR102", "345-678-9012", "Product Manager")),
            ("Helen", user("USR103", "456-789-0123", "UX Designer")),
        ]
        .into_iter()
        .map(|(name, u)| (name.to_string(), u))
        .collect();

        let inbox: IndexMap<String, Message> = [
            ("1", message("USR100", "USR101", "Hey Frank, don't forget about our meeting on 2024-06-11 at 4 PM in Conference Room 1.", "2024-06-09")),
            ("2", message("USR101", "USR102", "Can you send me the quarterly numbers before Friday?", "2024-03-09")),
            ("3", message("USR102", "USR103", "The design review moved to Thursday.", "2023-12-05")),
            ("4", message("USR103", "USR102", "No problem Grace, I can assist you.", "2024-09-09")),
        ]
        .into_iter()
        .map(|(id, m)| (id.to_string(), m))
        .collect();

        MessageApi {
            device: BaseApi {
                wifi: true,
                logged_in: true,
            },
            max_capacity: 6,
            user_list,
            inbox,
            message_id_counter: 4,
        }
    }
}

impl MessageApi {
    fn user_id(&self, name: &str) -> Option<&str> {
        self.user_list.get(name).map(|u| u.user_id.as_str())
    }

    pub fn send_message(&mut self, args: SendMessageArgs) -> Result<String, String> {
        if !self.device.logged_in {
            return Err("Device not logged in, unable to send message".to_string());
        }
        if !self.device.wifi {
            return Err("Wi-Fi is turned off, cannot send messages at this time".to_string());
        }
        if self.inbox.len() >= self.max_capacity {
            return Err(
                "Inbox capacity is full. You need to ask the user which message to delete."
                    .to_string(),
            );
        }
        let (Some(sender_id), Some(receiver_id)) =
            (self.user_id(&args.sender_name), self.user_id(&args.receiver_name))
        else {
            return Err("Sender or receiver does not exist".to_string());
        };
        let record = Message {
            sender_id: sender_id.to_string(),
            receiver_id: receiver_id.to_string(),
            message: args.message,
            time: None,
        };

        self.message_id_counter += 1;
        self.inbox.insert(self.message_id_counter.to_string(), record);
        Ok(format!("Message successfully sent to {}.", args.receiver_name))
    }

    pub fn delete_message(&mut self, args: DeleteMessageArgs) -> Result<String, String> {
        let message_id = args.message_id.to_string();
        if !self.device.logged_in {
            return Err("Device not logged in, unable to delete message".to_string());
        }
        if self.inbox.shift_remove(&message_id).is_none() {
            return Err("Message ID does not exist".to_string());
        }
        Ok(format!("Message ID {} has been successfully deleted.", message_id))
    }

    fn messages_where(&self, keep: impl Fn(&Message) -> bool) -> IndexMap<String, Message> {
        self.inbox
            .iter()
            .filter(|(_, msg)| keep(msg))
            .map(|(id, msg)| (id.clone(), msg.clone()))
            .collect()
    }

    pub fn view_messages_between_users(
        &self,
        args: ViewMessagesBetweenUsersArgs,
    ) -> Result<Value, String> {
        if !self.device.logged_in {
            return Err("Device not logged in, unable to view message information".to_string());
        }
        let (Some(sender_id), Some(receiver_id)) =
            (self.user_id(&args.sender_name), self.user_id(&args.receiver_name))
        else {
            return Err("Sender or receiver does not exist".to_string());
        };
        let messages = self.messages_where(|msg| msg.sender_id == sender_id && msg.receiver_id == receiver_id);
        if messages.is_empty() {
            return Err("No related message records found".to_string());
        }
        Ok(serde_json::json!({ "messages": messages }))
    }

    pub fn search_messages(&self, args: SearchMessagesArgs) -> Result<Value, String> {
        let Some(user_id) = self.user_id(&args.user_name) else {
            return Err("User does not exist".to_string());
        };
        let keyword = args.keyword.to_lowercase();
        let matched = self.messages_where(|msg| {
            (msg.sender_id == user_id || msg.receiver_id == user_id)
                && msg.message.to_lowercase().contains(&keyword)
        });
        if matched.is_empty() {
            return Err("No related message records found".to_string());
        }
        Ok(serde_json::json!({ "messages": matched }))
    }

    pub fn get_all_message_times_with_ids(&self) -> Result<Value, String> {
        if !self.device.logged_in {
            return Err("Device not logged in, unable to retrieve all message times and their corresponding message IDs.".to_string());
        }
        let times: IndexMap<&String, &Option<String>> =
            self.inbox.iter().map(|(id, msg)| (id, &msg.time)).collect();
        Ok(serde_json::json!({ "message_times": times }))
    }

    fn message_date(msg: &Message) -> Option<NaiveDate> {
        msg.time
            .as_deref()
            .and_then(|t| NaiveDate::parse_from_str(t, "%Y-%m-%d").ok())
    }

    pub fn get_latest_message_id(&self) -> Result<String, String> {
        if !self.device.logged_in {
            return Err("Device not logged in, unable to retrieve the latest sent message ID.".to_string());
        }
        // messages without a time sort as the earliest
        self.inbox
            .iter()
            .max_by_key(|(_, msg)| Self::message_date(msg).unwrap_or(NaiveDate::MIN))
            .map(|(id, _)| format!("The latest message ID is {}", id))
            .ok_or_else(|| "No message records found".to_string())
    }

    pub fn get_earliest_message_id(&self) -> Result<String, String> {
        if !self.device.logged_in {
            return Err("Device not logged in, unable to retrieve the earliest sent message ID.".to_string());
        }
        self.inbox
            .iter()
            .min_by_key(|(_, msg)| Self::message_date(msg).unwrap_or(NaiveDate::MAX))
            .map(|(id, _)| format!("The earliest message ID is {}", id))
            .ok_or_else(|| "No message records found".to_string())
    }
}

static MESSAGE_API_METHODS: LazyLock<DispatchTable<MessageApi>> = LazyLock::new(|| {
    DispatchTable::new()
        .method("send_message", MessageApi::send_message)
        .method("delete_message", MessageApi::delete_message)
        .method("view_messages_between_users", |api: &mut MessageApi, args| {
            api.view_messages_between_users(args)
        })
        .method("search_messages", |api: &mut MessageApi, args| api.search_messages(args))
        .method("get_all_message_times_with_ids", |api: &mut MessageApi, _: NoArgs| {
            api.get_all_message_times_with_ids()
        })
        .method("get_latest_message_id", |api: &mut MessageApi, _: NoArgs| {
            api.get_latest_message_id()
        })
        .method("get_earliest_message_id", |api: &mut MessageApi, _: NoArgs| {
            api.get_earliest_message_id()
        })
});

impl Simulator for MessageApi {
    fn class_name(&self) -> &'static str {
        "MessageApi"
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
        MESSAGE_API_METHODS.method_names()
    }

    fn invoke(
        &mut self,
        method: &str,
        arguments: &IndexMap<String, Value>,
    ) -> Result<ReturnValue, ExecutionError> {
        MESSAGE_API_METHODS.invoke(self, method, arguments)
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(value: Value) -> IndexMap<String, Value> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_send_then_delete() {
        let mut api = MessageApi::default();
        let sent = api
            .invoke(
                "send_message",
                &args(json!({"sender_name": "Eve", "receiver_name": "Frank", "message": "hi"})),
            )
            .unwrap();
        assert_eq!(sent, ReturnValue::from("Message successfully sent to Frank."));
        assert_eq!(api.inbox["5"].receiver_id, "USR101");
        assert_eq!(api.message_id_counter, 5);

        api.invoke("delete_message", &args(json!({"message_id": 1}))).unwrap();
        assert!(!api.inbox.contains_key("1"));
        assert!(api.invoke("delete_message", &args(json!({"message_id": 1}))).is_err());
    }

    #[test]
    fn test_send_requires_wifi_and_capacity() {
        let mut api = MessageApi::default();
        api.device.wifi = false;
        let send = SendMessageArgs {
            sender_name: "Eve".to_string(),
            receiver_name: "Frank".to_string(),
            message: "hello".to_string(),
        };
        assert!(api.send_message(send.clone()).is_err());
        api.device.wifi = true;
        api.max_capacity = api.inbox.len();
        assert_eq!(
            api.send_message(send),
            Err("Inbox capacity is full. You need to ask the user which message to delete.".to_string())
        );
    }

    #[test]
    fn test_latest_and_earliest() {
        let api = MessageApi::default();
        assert_eq!(api.get_latest_message_id().unwrap(), "The latest message ID is 4");
        assert_eq!(api.get_earliest_message_id().unwrap(), "The earliest message ID is 3");
    }

    #[test]
    fn test_search_is_case_insensitive() {
        let api = MessageApi::default();
        let found = api
            .search_messages(SearchMessagesArgs {
                user_name: "Frank".to_string(),
                keyword: "MEETING".to_string(),
            })
            .unwrap();
        assert_eq!(found["messages"].as_object().unwrap().len(), 1);
    }

    #[test]
    fn test_snapshot_includes_device_state() {
        let snapshot = MessageApi::default().snapshot();
        assert_eq!(snapshot["device"]["wifi"], json!(true));
        assert!(snapshot.contains_key("inbox"));
        assert!(snapshot.contains_key("message_id_counter"));
    }
}

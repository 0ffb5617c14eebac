//! Wire payloads for the three bus topics.

use serde::{Deserialize, Serialize};

pub use crate::hub::Change;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectedArgs {
    pub until: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataReceivedArgs {
    pub table: String,
    pub id: String,
    pub date: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfoErrorArgs {
    pub table: String,
    pub id: String,
    pub date: i64,
    pub message: String,
}

/// `/info` and `/info/<peer>` payloads. Internally tagged on `message`,
/// matching the wire shape `{ sender, message: "...", args: {...} }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "message", rename_all = "snake_case")]
pub enum InfoBody {
    Connected { args: ConnectedArgs },
    ConnectionLost { args: serde_json::Value },
    DataReceived { args: DataReceivedArgs },
    Error { args: InfoErrorArgs },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfoMessage {
    pub sender: String,
    #[serde(flatten)]
    pub body: InfoBody,
}

impl InfoMessage {
    pub fn connected(sender: impl Into<String>, until: i64) -> Self {
        Self {
            sender: sender.into(),
            body: InfoBody::Connected {
                args: ConnectedArgs { until },
            },
        }
    }

    pub fn connection_lost(sender: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            body: InfoBody::ConnectionLost {
                args: serde_json::json!({}),
            },
        }
    }

    pub fn data_received(sender: impl Into<String>, table: String, id: String, date: i64) -> Self {
        Self {
            sender: sender.into(),
            body: InfoBody::DataReceived {
                args: DataReceivedArgs { table, id, date },
            },
        }
    }

    pub fn error(
        sender: impl Into<String>,
        table: String,
        id: String,
        date: i64,
        message: String,
    ) -> Self {
        Self {
            sender: sender.into(),
            body: InfoBody::Error {
                args: InfoErrorArgs {
                    table,
                    id,
                    date,
                    message,
                },
            },
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn connected_round_trips() {
        let msg = InfoMessage::connected("node-a", 1700000000123);
        let encoded = serde_json::to_string(&msg).unwrap();
        assert!(encoded.contains(r#""message":"connected""#));

        let decoded: InfoMessage = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.sender, "node-a");
        match decoded.body {
            InfoBody::Connected { args } => assert_eq!(args.until, 1700000000123),
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn change_message_shape_matches_spec() {
        let change = Change {
            sender: "node-a".into(),
            table: "users".into(),
            id: "u1".into(),
            date: 1000,
            entity: None,
        };
        let encoded = serde_json::to_string(&change).unwrap();
        assert!(encoded.contains(r#""entity":null"#));
    }
}

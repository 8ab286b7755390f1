//! Envelope types exchanged between clients and the relay.

use serde::{Deserialize, Serialize};

use crate::types::{Annotation, SharedTab, TabPayload};

/// Messages sent FROM a client TO the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Liveness ping; answered with `pong`.
    Heartbeat,
    JoinGroup {
        group_id: String,
    },
    LeaveGroup {
        group_id: String,
    },
    /// Share a tab into every group the connection has joined.
    ShareTab {
        data: TabPayload,
    },
    AnnotationCreated {
        data: serde_json::Value,
    },
    /// Relay-only cluster update; never stored by the relay.
    AiClusterUpdate {
        data: serde_json::Value,
    },
}

/// Messages sent FROM the relay TO a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// First message on every connection.
    Welcome {
        client_id: String,
    },
    GroupJoined {
        group_id: String,
        member_count: usize,
    },
    /// Full snapshot of a group's history and annotation log.
    GroupData {
        #[serde(default)]
        group_id: String,
        shared_tabs: Vec<SharedTab>,
        annotations: Vec<Annotation>,
    },
    MemberJoined {
        client_id: String,
        member_count: usize,
    },
    MemberLeft {
        client_id: String,
        member_count: usize,
    },
    TabShared {
        data: SharedTab,
    },
    AnnotationUpdate {
        data: Annotation,
        created_by: String,
    },
    AiClusterUpdate {
        data: serde_json::Value,
        updated_by: String,
    },
    Pong,
}

impl ServerMessage {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Welcome { .. } => "welcome",
            Self::GroupJoined { .. } => "group_joined",
            Self::GroupData { .. } => "group_data",
            Self::MemberJoined { .. } => "member_joined",
            Self::MemberLeft { .. } => "member_left",
            Self::TabShared { .. } => "tab_shared",
            Self::AnnotationUpdate { .. } => "annotation_update",
            Self::AiClusterUpdate { .. } => "ai_cluster_update",
            Self::Pong => "pong",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_message_wire_format() {
        let msg: ClientMessage =
            serde_json::from_value(json!({"type": "join_group", "groupId": "Team-A"})).unwrap();
        assert_eq!(
            msg,
            ClientMessage::JoinGroup {
                group_id: "Team-A".into()
            }
        );

        let msg: ClientMessage = serde_json::from_value(json!({"type": "heartbeat"})).unwrap();
        assert_eq!(msg, ClientMessage::Heartbeat);
    }

    #[test]
    fn test_share_tab_payload_parses() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "share_tab",
            "data": {"title": "Docs", "url": "https://docs.rs/", "timestamp": 42}
        }))
        .unwrap();
        match msg {
            ClientMessage::ShareTab { data } => {
                assert_eq!(data.url, "https://docs.rs/");
                assert_eq!(data.summary, None);
                assert_eq!(data.timestamp, 42);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_server_message_field_names() {
        let json = serde_json::to_value(ServerMessage::GroupJoined {
            group_id: "g".into(),
            member_count: 2,
        })
        .unwrap();
        assert_eq!(json, json!({"type": "group_joined", "groupId": "g", "memberCount": 2}));

        let json = serde_json::to_value(ServerMessage::Pong).unwrap();
        assert_eq!(json, json!({"type": "pong"}));
    }

    #[test]
    fn test_group_data_without_group_id() {
        let msg: ServerMessage = serde_json::from_value(json!({
            "type": "group_data",
            "sharedTabs": [],
            "annotations": []
        }))
        .unwrap();
        assert!(matches!(msg, ServerMessage::GroupData { ref group_id, .. } if group_id.is_empty()));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let result = serde_json::from_value::<ClientMessage>(json!({"type": "self_destruct"}));
        assert!(result.is_err());
    }
}

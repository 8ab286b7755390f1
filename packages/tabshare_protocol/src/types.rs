//! Record types carried inside envelopes.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch, the unit of every timestamp on the wire.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Tab data as submitted by a client in `share_tab`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabPayload {
    pub title: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Local time at which the client shared the tab.
    pub timestamp: i64,
}

/// A tab as recorded in a group's history.
///
/// Carries both the client's local share time and the relay's broadcast time.
/// Records are never updated in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedTab {
    pub title: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Connection id of the sharer. Empty for a local record not yet echoed.
    #[serde(default)]
    pub shared_by: String,
    pub group_id: String,
    /// Client-stamped share time.
    pub timestamp: i64,
    /// Relay-stamped broadcast time, absent until the relay has seen the record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_at: Option<i64>,
}

impl SharedTab {
    /// Record a tab the local client is about to share, before any echo.
    pub fn local(payload: &TabPayload, group_id: &str) -> Self {
        Self {
            title: payload.title.clone(),
            url: payload.url.clone(),
            summary: payload.summary.clone(),
            shared_by: String::new(),
            group_id: group_id.to_string(),
            timestamp: payload.timestamp,
            shared_at: None,
        }
    }

    /// Stamp an inbound payload with group and relay metadata.
    pub fn stamped(payload: TabPayload, shared_by: &str, group_id: &str, shared_at: i64) -> Self {
        Self {
            title: payload.title,
            url: payload.url,
            summary: payload.summary,
            shared_by: shared_by.to_string(),
            group_id: group_id.to_string(),
            timestamp: payload.timestamp,
            shared_at: Some(shared_at),
        }
    }

    /// Timestamp used when comparing two records of the same URL.
    ///
    /// Relay time when known, otherwise the local share time.
    pub fn dedup_timestamp(&self) -> i64 {
        self.shared_at.unwrap_or(self.timestamp)
    }
}

/// An entry in a group's append-only annotation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Annotation {
    pub data: serde_json::Value,
    pub created_by: String,
    pub group_id: String,
    pub created_at: i64,
}

/// A named subset of a group's shared tabs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    pub name: String,
    pub theme: String,
    pub tabs: Vec<SharedTab>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> TabPayload {
        TabPayload {
            title: "Rust".into(),
            url: "https://www.rust-lang.org/".into(),
            summary: None,
            timestamp: 1_000,
        }
    }

    #[test]
    fn test_local_record_uses_local_time_for_dedup() {
        let tab = SharedTab::local(&payload(), "g1");
        assert_eq!(tab.dedup_timestamp(), 1_000);
        assert!(tab.shared_by.is_empty());
    }

    #[test]
    fn test_stamped_record_prefers_relay_time() {
        let tab = SharedTab::stamped(payload(), "conn-1", "g1", 1_450);
        assert_eq!(tab.dedup_timestamp(), 1_450);
        assert_eq!(tab.timestamp, 1_000);
        assert_eq!(tab.shared_by, "conn-1");
    }

    #[test]
    fn test_shared_tab_wire_names() {
        let tab = SharedTab::stamped(payload(), "conn-1", "g1", 2_000);
        let json = serde_json::to_value(&tab).unwrap();
        assert_eq!(json["sharedBy"], "conn-1");
        assert_eq!(json["groupId"], "g1");
        assert_eq!(json["sharedAt"], 2_000);
        assert!(json.get("summary").is_none());
    }
}

//! Per-group state: membership, bounded tab history, annotation log.

use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, VecDeque};
use tabshare_protocol::{Annotation, ServerMessage, SharedTab};

/// Default number of shared tabs retained per group.
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

#[derive(Debug)]
pub struct Group {
    pub group_id: String,
    pub created_at: DateTime<Utc>,
    members: BTreeSet<String>,
    history: VecDeque<SharedTab>,
    history_capacity: usize,
    annotations: Vec<Annotation>,
}

impl Group {
    pub fn new(group_id: String, created_at: DateTime<Utc>, history_capacity: usize) -> Self {
        Self {
            group_id,
            created_at,
            members: BTreeSet::new(),
            history: VecDeque::with_capacity(history_capacity),
            history_capacity,
            annotations: Vec::new(),
        }
    }

    /// Returns true if the connection was not already a member.
    pub fn add_member(&mut self, connection_id: &str) -> bool {
        self.members.insert(connection_id.to_string())
    }

    /// Returns true if the connection was a member.
    pub fn remove_member(&mut self, connection_id: &str) -> bool {
        self.members.remove(connection_id)
    }

    pub fn has_member(&self, connection_id: &str) -> bool {
        self.members.contains(connection_id)
    }

    pub fn members(&self) -> impl Iterator<Item = &str> {
        self.members.iter().map(String::as_str)
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Append to history, evicting the oldest records past capacity (FIFO).
    pub fn push_tab(&mut self, tab: SharedTab) {
        while self.history.len() >= self.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(tab);
    }

    pub fn push_annotation(&mut self, annotation: Annotation) {
        self.annotations.push(annotation);
    }

    pub fn history(&self) -> impl Iterator<Item = &SharedTab> {
        self.history.iter()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn annotations(&self) -> &[Annotation] {
        &self.annotations
    }

    /// Full snapshot envelope of this group's state.
    pub fn snapshot(&self) -> ServerMessage {
        ServerMessage::GroupData {
            group_id: self.group_id.clone(),
            shared_tabs: self.history.iter().cloned().collect(),
            annotations: self.annotations.clone(),
        }
    }

    /// Whether the sweeper may drop this group at `now`.
    pub fn is_reclaimable(&self, now: DateTime<Utc>, grace: chrono::Duration) -> bool {
        self.is_empty() && now - self.created_at > grace
    }
}

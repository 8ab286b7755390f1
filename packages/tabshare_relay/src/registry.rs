//! Connection and group registries.
//!
//! A connection's group set and each group's member set are kept as inverses
//! of each other; every mutation goes through `join`/`leave`/`remove_connection`
//! which update both sides together.

use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use tabshare_protocol::ServerMessage;
use tokio::sync::mpsc;

use crate::group::Group;

/// A live transport connection.
#[derive(Debug)]
pub struct Connection {
    /// Outbound queue drained by the connection's writer task.
    pub tx: mpsc::Sender<ServerMessage>,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    groups: BTreeSet<String>,
}

impl Connection {
    pub fn groups(&self) -> impl Iterator<Item = &str> {
        self.groups.iter().map(String::as_str)
    }
}

/// Result of a `join` on a known connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinOutcome {
    /// False when the connection was already a member (re-join).
    pub newly_joined: bool,
    pub member_count: usize,
}

#[derive(Debug)]
pub struct Registry {
    connections: HashMap<String, Connection>,
    groups: HashMap<String, Group>,
    history_capacity: usize,
}

impl Registry {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            connections: HashMap::new(),
            groups: HashMap::new(),
            history_capacity,
        }
    }

    pub fn register(
        &mut self,
        connection_id: String,
        tx: mpsc::Sender<ServerMessage>,
        now: DateTime<Utc>,
    ) {
        self.connections.insert(
            connection_id,
            Connection {
                tx,
                connected_at: now,
                last_seen: now,
                groups: BTreeSet::new(),
            },
        );
    }

    pub fn connection(&self, connection_id: &str) -> Option<&Connection> {
        self.connections.get(connection_id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn group(&self, group_id: &str) -> Option<&Group> {
        self.groups.get(group_id)
    }

    pub fn group_mut(&mut self, group_id: &str) -> Option<&mut Group> {
        self.groups.get_mut(group_id)
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Groups the connection belongs to, or empty for an unknown connection.
    pub fn groups_of(&self, connection_id: &str) -> Vec<String> {
        self.connections
            .get(connection_id)
            .map(|c| c.groups.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Refresh a connection's liveness. Returns false for an unknown connection.
    pub fn touch(&mut self, connection_id: &str, now: DateTime<Utc>) -> bool {
        match self.connections.get_mut(connection_id) {
            Some(conn) => {
                conn.last_seen = now;
                true
            }
            None => false,
        }
    }

    /// Add a connection to a group, creating the group lazily.
    ///
    /// Returns `None` (and creates nothing) for an unknown connection.
    pub fn join(
        &mut self,
        connection_id: &str,
        group_id: &str,
        now: DateTime<Utc>,
    ) -> Option<JoinOutcome> {
        let conn = self.connections.get_mut(connection_id)?;
        let capacity = self.history_capacity;
        let group = self
            .groups
            .entry(group_id.to_string())
            .or_insert_with(|| Group::new(group_id.to_string(), now, capacity));

        let newly_joined = group.add_member(connection_id);
        conn.groups.insert(group_id.to_string());
        Some(JoinOutcome {
            newly_joined,
            member_count: group.member_count(),
        })
    }

    /// Remove a connection from a group. The group itself is kept even when
    /// it becomes empty; reclamation is the sweeper's job.
    ///
    /// Returns the remaining member count, or `None` if the connection was
    /// not a member.
    pub fn leave(&mut self, connection_id: &str, group_id: &str) -> Option<usize> {
        let group = self.groups.get_mut(group_id)?;
        let was_member = group.remove_member(connection_id);
        if let Some(conn) = self.connections.get_mut(connection_id) {
            conn.groups.remove(group_id);
        }
        was_member.then(|| group.member_count())
    }

    /// Drop the connection record. Callers leave its groups first.
    pub fn remove_connection(&mut self, connection_id: &str) -> Option<Connection> {
        let conn = self.connections.remove(connection_id)?;
        for group_id in &conn.groups {
            if let Some(group) = self.groups.get_mut(group_id) {
                group.remove_member(connection_id);
            }
        }
        Some(conn)
    }

    /// Connections whose last liveness signal is older than `timeout`.
    pub fn stale_connections(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> Vec<String> {
        self.connections
            .iter()
            .filter(|(_, c)| now - c.last_seen > timeout)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Drop every empty group older than `grace`; returns the dropped ids.
    pub fn reclaim_groups(&mut self, now: DateTime<Utc>, grace: chrono::Duration) -> Vec<String> {
        let reclaimable: Vec<String> = self
            .groups
            .values()
            .filter(|g| g.is_reclaimable(now, grace))
            .map(|g| g.group_id.clone())
            .collect();
        for group_id in &reclaimable {
            self.groups.remove(group_id);
        }
        reclaimable
    }

    /// True when every connection↔group edge is present on both sides.
    pub fn is_symmetric(&self) -> bool {
        let forward = self.connections.iter().all(|(conn_id, conn)| {
            conn.groups
                .iter()
                .all(|g| self.groups.get(g).is_some_and(|group| group.has_member(conn_id)))
        });
        let backward = self.groups.iter().all(|(group_id, group)| {
            group.members().all(|m| {
                self.connections
                    .get(m)
                    .is_some_and(|conn| conn.groups.contains(group_id))
            })
        });
        forward && backward
    }
}

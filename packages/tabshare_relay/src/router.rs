//! Message router and broadcaster.
//!
//! Every handler takes the registry lock, mutates, queues its outbound
//! envelopes with `try_send`, and releases the lock. A recipient whose queue
//! is full or closed is logged and skipped; the rest of the fan-out proceeds.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tabshare_protocol::{Annotation, ClientMessage, ServerMessage, SharedTab, TabPayload};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use crate::config::LivenessConfig;
use crate::metrics::RelayMetrics;
use crate::registry::Registry;

/// What a sweep pass removed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub evicted: Vec<String>,
    pub reclaimed: Vec<String>,
}

pub struct Relay {
    registry: Mutex<Registry>,
    metrics: Arc<RelayMetrics>,
}

impl Relay {
    pub fn new(history_capacity: usize, metrics: Arc<RelayMetrics>) -> Self {
        Self {
            registry: Mutex::new(Registry::new(history_capacity)),
            metrics,
        }
    }

    pub fn metrics(&self) -> &Arc<RelayMetrics> {
        &self.metrics
    }

    /// Register a new connection and greet it with its id.
    pub async fn connect(&self, tx: mpsc::Sender<ServerMessage>) -> String {
        let connection_id = uuid::Uuid::new_v4().to_string();
        let mut reg = self.registry.lock().await;
        reg.register(connection_id.clone(), tx, Utc::now());
        self.send(
            &reg,
            &connection_id,
            ServerMessage::Welcome {
                client_id: connection_id.clone(),
            },
        );
        info!(conn_id = %connection_id, connections = reg.connection_count(), "connection registered");
        connection_id
    }

    /// Route one inbound envelope from `connection_id`.
    pub async fn dispatch(&self, connection_id: &str, msg: ClientMessage) {
        self.metrics.message_received();
        match msg {
            ClientMessage::Heartbeat => self.heartbeat(connection_id).await,
            ClientMessage::JoinGroup { group_id } => self.join(connection_id, &group_id).await,
            ClientMessage::LeaveGroup { group_id } => self.leave(connection_id, &group_id).await,
            ClientMessage::ShareTab { data } => self.share_tab(connection_id, data).await,
            ClientMessage::AnnotationCreated { data } => self.annotate(connection_id, data).await,
            ClientMessage::AiClusterUpdate { data } => {
                self.cluster_update(connection_id, data).await
            }
        }
    }

    pub async fn heartbeat(&self, connection_id: &str) {
        let mut reg = self.registry.lock().await;
        if reg.touch(connection_id, Utc::now()) {
            self.send(&reg, connection_id, ServerMessage::Pong);
        }
    }

    pub async fn join(&self, connection_id: &str, group_id: &str) {
        let mut reg = self.registry.lock().await;
        let Some(outcome) = reg.join(connection_id, group_id, Utc::now()) else {
            debug!(conn_id = %connection_id, group = %group_id, "join from unknown connection ignored");
            return;
        };
        let Some(group) = reg.group(group_id) else {
            return;
        };
        let snapshot = group.snapshot();

        self.send(
            &reg,
            connection_id,
            ServerMessage::GroupJoined {
                group_id: group_id.to_string(),
                member_count: outcome.member_count,
            },
        );
        self.send(&reg, connection_id, snapshot);

        if outcome.newly_joined {
            self.broadcast(
                &reg,
                group_id,
                ServerMessage::MemberJoined {
                    client_id: connection_id.to_string(),
                    member_count: outcome.member_count,
                },
                Some(connection_id),
            );
            info!(
                conn_id = %connection_id,
                group = %group_id,
                members = outcome.member_count,
                "joined group"
            );
        }
    }

    pub async fn leave(&self, connection_id: &str, group_id: &str) {
        let mut reg = self.registry.lock().await;
        self.leave_locked(&mut reg, connection_id, group_id);
    }

    /// Implicit leave of every group, then purge the connection record.
    pub async fn disconnect(&self, connection_id: &str) {
        let mut reg = self.registry.lock().await;
        if self.disconnect_locked(&mut reg, connection_id) {
            info!(conn_id = %connection_id, connections = reg.connection_count(), "connection removed");
        }
    }

    /// Stamp and store the tab in each of the sender's groups, then echo it
    /// (sender included) along with a fresh snapshot.
    pub async fn share_tab(&self, connection_id: &str, payload: TabPayload) {
        let mut reg = self.registry.lock().await;
        let now = Utc::now().timestamp_millis();
        for group_id in reg.groups_of(connection_id) {
            let Some(group) = reg.group_mut(&group_id) else {
                continue;
            };
            let tab = SharedTab::stamped(payload.clone(), connection_id, &group_id, now);
            group.push_tab(tab.clone());
            let snapshot = group.snapshot();
            self.metrics.tab_shared();
            debug!(conn_id = %connection_id, group = %group_id, url = %tab.url, "tab shared");

            self.broadcast(&reg, &group_id, ServerMessage::TabShared { data: tab }, None);
            self.broadcast(&reg, &group_id, snapshot, None);
        }
    }

    pub async fn annotate(&self, connection_id: &str, data: serde_json::Value) {
        let mut reg = self.registry.lock().await;
        let now = Utc::now().timestamp_millis();
        for group_id in reg.groups_of(connection_id) {
            let Some(group) = reg.group_mut(&group_id) else {
                continue;
            };
            let annotation = Annotation {
                data: data.clone(),
                created_by: connection_id.to_string(),
                group_id: group_id.clone(),
                created_at: now,
            };
            group.push_annotation(annotation.clone());
            self.broadcast(
                &reg,
                &group_id,
                ServerMessage::AnnotationUpdate {
                    data: annotation,
                    created_by: connection_id.to_string(),
                },
                Some(connection_id),
            );
        }
    }

    /// Relay-only: forwarded to the other members, never stored.
    pub async fn cluster_update(&self, connection_id: &str, data: serde_json::Value) {
        let reg = self.registry.lock().await;
        for group_id in reg.groups_of(connection_id) {
            self.broadcast(
                &reg,
                &group_id,
                ServerMessage::AiClusterUpdate {
                    data: data.clone(),
                    updated_by: connection_id.to_string(),
                },
                Some(connection_id),
            );
        }
    }

    /// Evict silent connections, then reclaim old empty groups.
    pub async fn sweep(&self, liveness: &LivenessConfig) -> SweepReport {
        self.sweep_at(Utc::now(), liveness).await
    }

    pub async fn sweep_at(&self, now: DateTime<Utc>, liveness: &LivenessConfig) -> SweepReport {
        let timeout = to_chrono(liveness.connection_timeout);
        let grace = to_chrono(liveness.group_grace);

        let mut reg = self.registry.lock().await;
        let evicted = reg.stale_connections(now, timeout);
        for connection_id in &evicted {
            warn!(conn_id = %connection_id, "evicting connection after liveness timeout");
            self.disconnect_locked(&mut reg, connection_id);
            self.metrics.connection_evicted();
        }

        let reclaimed = reg.reclaim_groups(now, grace);
        for group_id in &reclaimed {
            info!(group = %group_id, "reclaimed empty group");
            self.metrics.group_reclaimed();
        }

        SweepReport { evicted, reclaimed }
    }

    pub async fn connection_count(&self) -> usize {
        self.registry.lock().await.connection_count()
    }

    pub async fn group_count(&self) -> usize {
        self.registry.lock().await.group_count()
    }

    /// Run `f` against the registry under the lock.
    pub async fn with_registry<R>(&self, f: impl FnOnce(&Registry) -> R) -> R {
        let reg = self.registry.lock().await;
        f(&reg)
    }

    fn leave_locked(&self, reg: &mut Registry, connection_id: &str, group_id: &str) {
        let Some(remaining) = reg.leave(connection_id, group_id) else {
            return;
        };
        self.broadcast(
            reg,
            group_id,
            ServerMessage::MemberLeft {
                client_id: connection_id.to_string(),
                member_count: remaining,
            },
            None,
        );
        info!(conn_id = %connection_id, group = %group_id, members = remaining, "left group");
    }

    fn disconnect_locked(&self, reg: &mut Registry, connection_id: &str) -> bool {
        for group_id in reg.groups_of(connection_id) {
            self.leave_locked(reg, connection_id, &group_id);
        }
        reg.remove_connection(connection_id).is_some()
    }

    fn send(&self, reg: &Registry, connection_id: &str, msg: ServerMessage) {
        let Some(conn) = reg.connection(connection_id) else {
            return;
        };
        let kind = msg.kind();
        match conn.tx.try_send(msg) {
            Ok(()) => self.metrics.message_sent(),
            Err(e) => {
                self.metrics.send_failed();
                warn!(conn_id = %connection_id, kind, "dropping outbound message: {}", e);
            }
        }
    }

    fn broadcast(&self, reg: &Registry, group_id: &str, msg: ServerMessage, exclude: Option<&str>) {
        let Some(group) = reg.group(group_id) else {
            return;
        };
        for member in group.members() {
            if Some(member) == exclude {
                continue;
            }
            self.send(reg, member, msg.clone());
        }
    }
}

fn to_chrono(d: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

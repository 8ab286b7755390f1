//! Glue between the relay client, the reconciler and the coordinator.
//!
//! The agent task is the only owner of the [`TabReconciler`]. Local shares
//! are recorded before they are sent so their echo is dropped, every change
//! to a group's tab set is handed to the coordinator, and each semantic
//! partition it publishes is relayed to peers as `ai_cluster_update`.

use std::sync::Arc;
use tabshare_protocol::{ServerMessage, TabPayload, now_millis};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::classifier::Classifier;
use crate::coordinator::{ClusterCoordinator, PartitionSource, PublishedView};
use crate::error::ClientError;
use crate::reconciler::{Reconciled, TabReconciler};
use crate::relay_client::RelayHandle;
use crate::session::ConnectionState;
use crate::store::TabStore;

/// What the agent reports to its observers.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    Reconciled(Reconciled),
    /// A peer's semantic partition. Shown, never adopted.
    PeerClusters {
        data: serde_json::Value,
        updated_by: String,
    },
    Members {
        member_count: usize,
    },
}

enum AgentCommand {
    Share {
        payload: TabPayload,
        reply: oneshot::Sender<Result<Reconciled, ClientError>>,
    },
    Shutdown,
}

#[derive(Clone)]
pub struct AgentHandle {
    cmd_tx: mpsc::Sender<AgentCommand>,
    events_tx: broadcast::Sender<AgentEvent>,
}

impl AgentHandle {
    /// Share a tab into the current group, stamped with the local time.
    ///
    /// A URL already held for the group yields [`Reconciled::Duplicate`] (or
    /// [`Reconciled::Echo`] inside the echo window) and nothing is sent.
    pub async fn share(
        &self,
        title: impl Into<String>,
        url: impl Into<String>,
        summary: Option<String>,
    ) -> Result<Reconciled, ClientError> {
        let payload = TabPayload {
            title: title.into(),
            url: url.into(),
            summary,
            timestamp: now_millis(),
        };
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(AgentCommand::Share { payload, reply })
            .await
            .map_err(|_| ClientError::Closed)?;
        rx.await.map_err(|_| ClientError::Closed)?
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.events_tx.subscribe()
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(AgentCommand::Shutdown).await;
    }
}

pub struct TabAgent<C: Classifier> {
    relay: RelayHandle,
    reconciler: TabReconciler,
    coordinator: Arc<ClusterCoordinator<C>>,
}

impl<C: Classifier> TabAgent<C> {
    pub fn new(
        relay: RelayHandle,
        store: Arc<dyn TabStore>,
        coordinator: Arc<ClusterCoordinator<C>>,
    ) -> Self {
        Self {
            relay,
            reconciler: TabReconciler::new(store),
            coordinator,
        }
    }

    pub fn spawn(self) -> (AgentHandle, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (events_tx, _) = broadcast::channel(256);
        let handle = AgentHandle {
            cmd_tx,
            events_tx: events_tx.clone(),
        };
        // Subscribed before the task starts so nothing sent after spawn is missed.
        let inbound = self.relay.subscribe();
        let views = self.coordinator.subscribe();
        let task = tokio::spawn(self.run(cmd_rx, events_tx, inbound, views));
        (handle, task)
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<AgentCommand>,
        events_tx: broadcast::Sender<AgentEvent>,
        mut inbound: broadcast::Receiver<ServerMessage>,
        mut views: watch::Receiver<PublishedView>,
    ) {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(AgentCommand::Share { payload, reply }) => {
                        let result = self.share(payload).await;
                        if let Ok(outcome) = &result {
                            let _ = events_tx.send(AgentEvent::Reconciled(outcome.clone()));
                        }
                        let _ = reply.send(result);
                    }
                    Some(AgentCommand::Shutdown) | None => break,
                },
                msg = inbound.recv() => match msg {
                    Ok(msg) => {
                        if let Some(event) = self.handle_inbound(msg) {
                            let _ = events_tx.send(event);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Agent lagged behind relay by {} messages", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                changed = views.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let view = views.borrow_and_update().clone();
                    self.relay_semantic(view).await;
                }
            }
        }
        debug!("Tab agent stopped");
    }

    async fn share(&mut self, payload: TabPayload) -> Result<Reconciled, ClientError> {
        let status = self.relay.status();
        let group_id = status.group_id.ok_or(ClientError::NoGroup)?;
        if status.state != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }
        let outcome = self.reconciler.record_local_share(&payload, &group_id);
        if !matches!(outcome, Reconciled::Appended(_)) {
            return Ok(outcome);
        }
        if let Err(e) = self.relay.share_tab(payload.clone()).await {
            warn!(url = %payload.url, "Share did not reach the relay: {}", e);
            self.reconciler.forget_local_share(&payload, &group_id);
            return Err(e);
        }
        self.resubmit(&group_id);
        Ok(outcome)
    }

    fn handle_inbound(&mut self, msg: ServerMessage) -> Option<AgentEvent> {
        match msg {
            ServerMessage::AiClusterUpdate { data, updated_by } => {
                Some(AgentEvent::PeerClusters { data, updated_by })
            }
            ServerMessage::GroupJoined { member_count, .. }
            | ServerMessage::MemberJoined { member_count, .. }
            | ServerMessage::MemberLeft { member_count, .. } => {
                Some(AgentEvent::Members { member_count })
            }
            other => {
                let outcome = self.reconciler.apply(&other);
                match &outcome {
                    Reconciled::Appended(tab) => self.resubmit(&tab.group_id),
                    Reconciled::Replaced { group_id, .. } => self.resubmit(group_id),
                    Reconciled::Ignored | Reconciled::Echo => return None,
                    _ => {}
                }
                Some(AgentEvent::Reconciled(outcome))
            }
        }
    }

    fn resubmit(&mut self, group_id: &str) {
        if self.relay.status().group_id.as_deref() != Some(group_id) {
            return;
        }
        let tabs = self.reconciler.tabs(group_id).to_vec();
        self.coordinator.submit(tabs);
    }

    async fn relay_semantic(&self, view: PublishedView) {
        if view.source != PartitionSource::Semantic {
            return;
        }
        let data = match serde_json::to_value(&view.clusters) {
            Ok(data) => data,
            Err(e) => {
                warn!("Failed to encode clusters: {}", e);
                return;
            }
        };
        match self.relay.publish_clusters(data).await {
            Ok(()) => info!(clusters = view.clusters.len(), "Shared semantic clusters with the group"),
            Err(e) => debug!("Not sharing clusters: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::HttpClassifier;
    use crate::config::{ClassifierConfig, RelayClientConfig};
    use crate::relay_client::spawn_relay_client;
    use crate::session::SessionStatus;
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn agent_with(relay: RelayHandle) -> (AgentHandle, Arc<MemoryStore>) {
        let classifier = HttpClassifier::new(&ClassifierConfig {
            endpoint: None,
            api_key: None,
            timeout: Duration::from_secs(1),
        })
        .unwrap();
        let coordinator = Arc::new(ClusterCoordinator::new(
            Arc::new(classifier),
            Duration::from_secs(1),
        ));
        let store = Arc::new(MemoryStore::new());
        let (agent, _task) = TabAgent::new(relay, store.clone(), coordinator).spawn();
        (agent, store)
    }

    fn offline_agent() -> (AgentHandle, RelayHandle, Arc<MemoryStore>) {
        let (relay, _task) = spawn_relay_client(RelayClientConfig {
            url: "ws://127.0.0.1:9/ws".into(),
            heartbeat_interval: Duration::from_secs(25),
            reconnect_backoff: Duration::from_secs(60),
            reconnect_cooldown: Duration::from_secs(1),
        });
        let (agent, store) = agent_with(relay.clone());
        (agent, relay, store)
    }

    #[tokio::test]
    async fn test_share_requires_group() {
        let (agent, _relay, _store) = offline_agent();
        let err = agent.share("Rust", "https://rust-lang.org/", None).await.unwrap_err();
        assert!(matches!(err, ClientError::NoGroup));
    }

    #[tokio::test]
    async fn test_share_while_offline_records_nothing() {
        let (agent, relay, store) = offline_agent();
        relay.join("g1").await.unwrap();
        relay
            .watch_status()
            .wait_for(|s| s.group_id.is_some())
            .await
            .unwrap();

        let err = agent.share("Rust", "https://rust-lang.org/", None).await.unwrap_err();
        assert!(matches!(err, ClientError::NotConnected));
        assert!(store.load_group("g1").unwrap().shared_tabs.is_empty());
    }

    #[tokio::test]
    async fn test_failed_send_rolls_back_local_share() {
        // Looks connected, but the actor is gone: the send fails after the
        // status check passed.
        let relay = RelayHandle::detached(SessionStatus {
            state: ConnectionState::Connected,
            client_id: Some("c1".into()),
            group_id: Some("g1".into()),
            member_count: Some(1),
        });
        let (agent, store) = agent_with(relay);

        let err = agent.share("Rust", "https://rust-lang.org/", None).await.unwrap_err();
        assert!(matches!(err, ClientError::Closed));
        assert!(store.load_group("g1").unwrap().shared_tabs.is_empty());

        // The retry is attempted again rather than judged an echo.
        let err = agent.share("Rust", "https://rust-lang.org/", None).await.unwrap_err();
        assert!(matches!(err, ClientError::Closed));
        assert!(store.load_group("g1").unwrap().shared_tabs.is_empty());
    }
}

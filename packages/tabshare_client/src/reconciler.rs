//! Tab Event Reconciler
//!
//! Merges relayed `tab_shared` and `group_data` events into the locally held
//! tab history of each group. The relay echoes every share back to its sender,
//! so an incoming record is compared against existing records of the same URL
//! and group:
//!
//! - timestamps within [`ECHO_WINDOW_MS`]: the echo of a share already held,
//!   dropped silently;
//! - timestamps further apart: the same page shared again, rejected with a
//!   duplicate notice and the original kept;
//! - no match: appended.
//!
//! Snapshots replace a group's tabs and annotations wholesale.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tabshare_protocol::{Annotation, ServerMessage, SharedTab, TabPayload};
use tracing::{debug, info, warn};

use crate::store::{GroupState, TabStore};

/// Maximum timestamp distance at which a record is treated as an echo.
pub const ECHO_WINDOW_MS: i64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    New,
    Echo,
    Duplicate,
}

/// Classify `incoming` against the records already held.
pub fn judge(existing: &[SharedTab], incoming: &SharedTab) -> Verdict {
    let Some(held) = existing
        .iter()
        .find(|t| t.url == incoming.url && t.group_id == incoming.group_id)
    else {
        return Verdict::New;
    };
    let delta = (held.dedup_timestamp() - incoming.dedup_timestamp()).abs();
    if delta <= ECHO_WINDOW_MS {
        Verdict::Echo
    } else {
        Verdict::Duplicate
    }
}

/// Result of feeding one event through the reconciler.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciled {
    Appended(SharedTab),
    Echo,
    /// Same URL shared again; carries the record that was kept.
    Duplicate(SharedTab),
    Replaced { group_id: String, tabs: usize },
    Annotated(Annotation),
    Ignored,
}

impl Reconciled {
    /// Whether the reconciled tab set of some group changed.
    pub fn tabs_changed(&self) -> bool {
        matches!(self, Self::Appended(_) | Self::Replaced { .. })
    }
}

/// Keep the first record of each URL, in arrival order.
///
/// The relay stores re-shares, so its snapshots can hold the same URL more
/// than once.
fn first_per_url(tabs: &[SharedTab]) -> Vec<SharedTab> {
    let mut seen = HashSet::new();
    tabs.iter()
        .filter(|t| seen.insert((t.url.as_str(), t.group_id.as_str())))
        .cloned()
        .collect()
}

pub struct TabReconciler {
    store: Arc<dyn TabStore>,
    groups: HashMap<String, GroupState>,
}

impl TabReconciler {
    pub fn new(store: Arc<dyn TabStore>) -> Self {
        Self {
            store,
            groups: HashMap::new(),
        }
    }

    pub fn tabs(&mut self, group_id: &str) -> &[SharedTab] {
        &self.group(group_id).shared_tabs
    }

    pub fn annotations(&mut self, group_id: &str) -> &[Annotation] {
        &self.group(group_id).annotations
    }

    /// Record a tab the local client is about to share so its echo is
    /// recognised.
    pub fn record_local_share(&mut self, payload: &TabPayload, group_id: &str) -> Reconciled {
        self.merge(SharedTab::local(payload, group_id))
    }

    /// Undo [`record_local_share`](Self::record_local_share) for a share that
    /// never reached the relay.
    pub fn forget_local_share(&mut self, payload: &TabPayload, group_id: &str) {
        let state = self.group(group_id);
        let before = state.shared_tabs.len();
        state.shared_tabs.retain(|t| {
            !(t.url == payload.url && t.shared_at.is_none() && t.timestamp == payload.timestamp)
        });
        if state.shared_tabs.len() != before {
            self.persist(group_id);
        }
    }

    pub fn apply(&mut self, msg: &ServerMessage) -> Reconciled {
        match msg {
            ServerMessage::TabShared { data } => self.merge(data.clone()),
            ServerMessage::GroupData {
                group_id,
                shared_tabs,
                annotations,
            } => {
                if group_id.is_empty() {
                    debug!("Snapshot without group id, ignoring");
                    return Reconciled::Ignored;
                }
                let tabs = first_per_url(shared_tabs);
                let count = tabs.len();
                if count < shared_tabs.len() {
                    debug!(
                        group = %group_id,
                        dropped = shared_tabs.len() - count,
                        "Snapshot carried re-shared URLs, keeping the originals"
                    );
                }
                let state = self.group(group_id);
                state.shared_tabs = tabs;
                state.annotations = annotations.clone();
                self.persist(group_id);
                debug!(group = %group_id, tabs = count, "Replaced group from snapshot");
                Reconciled::Replaced {
                    group_id: group_id.clone(),
                    tabs: count,
                }
            }
            ServerMessage::AnnotationUpdate { data, .. } => {
                self.group(&data.group_id).annotations.push(data.clone());
                self.persist(&data.group_id);
                Reconciled::Annotated(data.clone())
            }
            _ => Reconciled::Ignored,
        }
    }

    fn merge(&mut self, incoming: SharedTab) -> Reconciled {
        let group_id = incoming.group_id.clone();
        let state = self.group(&group_id);
        match judge(&state.shared_tabs, &incoming) {
            Verdict::Echo => {
                debug!(url = %incoming.url, "Dropping echo of a held share");
                Reconciled::Echo
            }
            Verdict::Duplicate => {
                info!(url = %incoming.url, group = %group_id, "Tab already shared in this group");
                let kept = state
                    .shared_tabs
                    .iter()
                    .find(|t| t.url == incoming.url)
                    .cloned()
                    .unwrap_or(incoming);
                Reconciled::Duplicate(kept)
            }
            Verdict::New => {
                state.shared_tabs.push(incoming.clone());
                self.persist(&group_id);
                Reconciled::Appended(incoming)
            }
        }
    }

    fn group(&mut self, group_id: &str) -> &mut GroupState {
        let store = &self.store;
        self.groups.entry(group_id.to_string()).or_insert_with(|| {
            store.load_group(group_id).unwrap_or_else(|e| {
                warn!(group = %group_id, "Failed to load local state: {}", e);
                GroupState::default()
            })
        })
    }

    fn persist(&self, group_id: &str) {
        let Some(state) = self.groups.get(group_id) else {
            return;
        };
        if let Err(e) = self.store.save_group(group_id, state) {
            warn!(group = %group_id, "Failed to persist local state: {}", e);
        }
    }
}

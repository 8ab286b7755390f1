//! Cluster Coordinator
//!
//! Every submitted tab set is published at once as a host-based fallback
//! partition, then classified in the background. Results land in a single
//! published slot tagged with the submission's sequence number; a result
//! whose number is no longer current is discarded.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tabshare_protocol::{Cluster, SharedTab};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::classifier::Classifier;
use crate::error::ClassifyError;
use crate::partition::{describe, fallback_partition, validate_partition};
use crate::store::TabStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionSource {
    Fallback,
    Semantic,
}

/// The currently authoritative partition.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedView {
    pub seq: u64,
    pub source: PartitionSource,
    pub clusters: Vec<Cluster>,
    /// Soft warning from a failed classification of this tab set.
    pub warning: Option<String>,
}

impl Default for PublishedView {
    fn default() -> Self {
        Self {
            seq: 0,
            source: PartitionSource::Fallback,
            clusters: Vec::new(),
            warning: None,
        }
    }
}

/// Handle on one submission.
pub struct Submitted {
    pub seq: u64,
    /// Background classification, absent for an empty tab set.
    pub classification: Option<JoinHandle<()>>,
}

pub struct ClusterCoordinator<C: Classifier> {
    classifier: Arc<C>,
    timeout: Duration,
    next_seq: AtomicU64,
    view_tx: watch::Sender<PublishedView>,
    store: Option<Arc<dyn TabStore>>,
}

impl<C: Classifier> ClusterCoordinator<C> {
    pub fn new(classifier: Arc<C>, timeout: Duration) -> Self {
        let (view_tx, _) = watch::channel(PublishedView::default());
        Self {
            classifier,
            timeout,
            next_seq: AtomicU64::new(0),
            view_tx,
            store: None,
        }
    }

    /// Persist every published partition to `store`.
    pub fn with_store(mut self, store: Arc<dyn TabStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn current(&self) -> PublishedView {
        self.view_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PublishedView> {
        self.view_tx.subscribe()
    }

    /// Publish the fallback for `tabs` and start classifying them.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn submit(&self, tabs: Vec<SharedTab>) -> Submitted {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let fallback = fallback_partition(&tabs);
        persist(self.store.as_deref(), &fallback);
        self.view_tx.send_replace(PublishedView {
            seq,
            source: PartitionSource::Fallback,
            clusters: fallback,
            warning: None,
        });
        debug!(seq, tabs = tabs.len(), "Published fallback partition");

        if tabs.is_empty() {
            return Submitted {
                seq,
                classification: None,
            };
        }

        let classifier = self.classifier.clone();
        let view_tx = self.view_tx.clone();
        let store = self.store.clone();
        let timeout = self.timeout;
        let task = tokio::spawn(async move {
            let descriptors = describe(&tabs);
            let classified = tokio::time::timeout(timeout, classifier.classify(&descriptors)).await;
            let result = match classified {
                // Nothing usable: keep the current partition.
                Ok(Ok(response)) if response.clusters.is_empty() => {
                    Err(ClassifyError::Malformed("no clusters returned".into()))
                }
                Ok(Ok(response)) => Ok(validate_partition(&tabs, response)),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(ClassifyError::Timeout),
            };

            match result {
                Ok(clusters) => {
                    let mut published = None;
                    let applied = view_tx.send_if_modified(|view| {
                        if view.seq != seq {
                            return false;
                        }
                        view.source = PartitionSource::Semantic;
                        view.clusters = clusters;
                        view.warning = None;
                        published = Some(view.clusters.clone());
                        true
                    });
                    match published {
                        Some(clusters) => {
                            info!(seq, clusters = clusters.len(), "Published semantic partition");
                            persist(store.as_deref(), &clusters);
                        }
                        None => debug!(seq, applied, "Discarding stale classification"),
                    }
                }
                Err(e) => {
                    warn!(seq, "Classification failed, keeping fallback: {}", e);
                    view_tx.send_if_modified(|view| {
                        if view.seq != seq {
                            return false;
                        }
                        view.warning = Some(e.to_string());
                        true
                    });
                }
            }
        });

        Submitted {
            seq,
            classification: Some(task),
        }
    }

    /// Up to three discussion questions for `cluster`.
    pub async fn discussion_questions(
        &self,
        cluster: &Cluster,
    ) -> Result<Vec<String>, ClassifyError> {
        tokio::time::timeout(self.timeout, self.classifier.discussion_questions(cluster))
            .await
            .map_err(|_| ClassifyError::Timeout)?
    }
}

fn persist(store: Option<&dyn TabStore>, clusters: &[Cluster]) {
    let Some(store) = store else {
        return;
    };
    if let Err(e) = store.save_clusters(clusters) {
        warn!("Failed to persist clusters: {}", e);
    }
}

//! Client side of tabshare.
//!
//! A [`relay_client`] keeps one resilient connection to the relay, the
//! [`reconciler`] merges relayed tab events into local state without
//! duplicates, and the [`coordinator`] keeps a partition of the group's tabs
//! published, host-based first and semantic once the classifier answers.
//! [`agent`] wires the three together.

pub mod agent;
pub mod classifier;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod partition;
pub mod reconciler;
pub mod relay_client;
pub mod session;
pub mod store;

pub use agent::{AgentEvent, AgentHandle, TabAgent};
pub use classifier::{Classifier, HttpClassifier};
pub use config::{ClassifierConfig, ClientConfig, RelayClientConfig};
pub use coordinator::{ClusterCoordinator, PartitionSource, PublishedView};
pub use error::{ClassifyError, ClientError, StoreError};
pub use reconciler::{Reconciled, TabReconciler};
pub use relay_client::{RelayHandle, spawn_relay_client};
pub use session::{ConnectionState, SessionStatus};
pub use store::{JsonFileStore, MemoryStore, TabStore};

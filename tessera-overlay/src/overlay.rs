//! Overlay of known storage nodes
//!
//! Tracks contact state and network location per node and picks
//! replacement nodes for repair uploads. Selection spreads the chosen
//! nodes across distinct `last_net` networks, preferring networks that
//! hold none of the segment's existing pieces.

use crate::reputation::ReputationTracker;
use chrono::{DateTime, TimeDelta, Utc};
use metrics::counter;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tessera_core::NodeId;
use thiserror::Error;
use tracing::{debug, warn};

/// Overlay errors
#[derive(Error, Debug)]
pub enum OverlayError {
    #[error("Insufficient nodes: requested {requested}, eligible {available}")]
    InsufficientNodes { requested: usize, available: usize },

    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),
}

pub type Result<T> = std::result::Result<T, OverlayError>;

/// Overlay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    /// A node is online if its last successful contact is within this window
    pub online_window_secs: u64,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            online_window_secs: 4 * 60 * 60,
        }
    }
}

impl OverlayConfig {
    pub fn online_window(&self) -> Duration {
        Duration::from_secs(self.online_window_secs)
    }
}

/// Registration details a node reports about itself
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub node_id: NodeId,
    pub address: String,
    /// Network the node's address belongs to (e.g. its /24)
    pub last_net: String,
}

/// Everything the overlay knows about a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDossier {
    pub node_id: NodeId,
    pub address: String,
    pub last_net: String,
    pub last_contact_success: Option<DateTime<Utc>>,
    pub last_contact_failure: Option<DateTime<Utc>>,
}

impl NodeDossier {
    /// Last contact succeeded, and recently enough
    pub fn is_online(&self, now: DateTime<Utc>, window: Duration) -> bool {
        let Some(success) = self.last_contact_success else {
            return false;
        };
        if self.last_contact_failure.is_some_and(|failure| failure > success) {
            return false;
        }
        let window = TimeDelta::from_std(window).unwrap_or(TimeDelta::MAX);
        now.signed_duration_since(success) <= window
    }
}

/// Registry of storage nodes and replacement selection
pub struct OverlayService {
    config: OverlayConfig,
    nodes: RwLock<HashMap<NodeId, NodeDossier>>,
    reputation: Arc<ReputationTracker>,
}

impl OverlayService {
    pub fn new(config: OverlayConfig, reputation: Arc<ReputationTracker>) -> Self {
        Self {
            config,
            nodes: RwLock::new(HashMap::new()),
            reputation,
        }
    }

    pub fn reputation(&self) -> &Arc<ReputationTracker> {
        &self.reputation
    }

    /// Register a node or refresh its address; counts as a successful contact
    pub fn upsert_node(&self, info: NodeInfo, now: DateTime<Utc>) {
        let mut nodes = self.nodes.write();
        let dossier = nodes.entry(info.node_id).or_insert_with(|| NodeDossier {
            node_id: info.node_id,
            address: String::new(),
            last_net: String::new(),
            last_contact_success: None,
            last_contact_failure: None,
        });
        dossier.address = info.address;
        dossier.last_net = info.last_net;
        dossier.last_contact_success = Some(now);
    }

    /// Record a successful contact
    pub fn record_contact(&self, node_id: &NodeId, now: DateTime<Utc>) -> Result<()> {
        let mut nodes = self.nodes.write();
        let dossier = nodes
            .get_mut(node_id)
            .ok_or(OverlayError::NodeNotFound(*node_id))?;
        dossier.last_contact_success = Some(now);
        Ok(())
    }

    /// Record a failed contact; the node is offline until it is contacted again
    pub fn mark_offline(&self, node_id: &NodeId, now: DateTime<Utc>) -> Result<()> {
        let mut nodes = self.nodes.write();
        let dossier = nodes
            .get_mut(node_id)
            .ok_or(OverlayError::NodeNotFound(*node_id))?;
        dossier.last_contact_failure = Some(now);
        debug!(node = %node_id, "Node marked offline");
        Ok(())
    }

    pub fn get(&self, node_id: &NodeId) -> Option<NodeDossier> {
        self.nodes.read().get(node_id).cloned()
    }

    /// Dial address of a node
    pub fn address(&self, node_id: &NodeId) -> Option<String> {
        self.nodes.read().get(node_id).map(|d| d.address.clone())
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subset of `ids` that are known, online and in good standing
    pub fn reliable(&self, ids: &[NodeId]) -> HashSet<NodeId> {
        let now = Utc::now();
        let window = self.config.online_window();
        let nodes = self.nodes.read();
        ids.iter()
            .filter(|id| nodes.get(*id).is_some_and(|d| d.is_online(now, window)))
            .filter(|id| self.reputation.is_reliable(id))
            .copied()
            .collect()
    }

    /// Pick `count` nodes for new pieces
    ///
    /// Eligible nodes are online, not in `exclude`, neither disqualified nor
    /// suspended, and have an audit score of at least `min_reputation_score`.
    pub fn select_replacement(
        &self,
        count: usize,
        exclude: &HashSet<NodeId>,
        min_reputation_score: f64,
    ) -> Result<Vec<NodeId>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let window = self.config.online_window();
        let nodes = self.nodes.read();

        let mut eligible: Vec<&NodeDossier> = nodes
            .values()
            .filter(|d| !exclude.contains(&d.node_id))
            .filter(|d| d.is_online(now, window))
            .filter(|d| self.reputation.is_reliable(&d.node_id))
            .filter(|d| self.reputation.audit_score(&d.node_id) >= min_reputation_score)
            .collect();

        if eligible.len() < count {
            warn!(
                requested = count,
                available = eligible.len(),
                "Not enough eligible nodes for selection"
            );
            counter!("overlay_selection_failures_total").increment(1);
            return Err(OverlayError::InsufficientNodes {
                requested: count,
                available: eligible.len(),
            });
        }

        eligible.shuffle(&mut rand::thread_rng());

        let used_nets: HashSet<&str> = exclude
            .iter()
            .filter_map(|id| nodes.get(id))
            .map(|d| d.last_net.as_str())
            .collect();

        let mut selected = Vec::with_capacity(count);
        let mut taken: HashSet<NodeId> = HashSet::with_capacity(count);
        let mut taken_nets: HashSet<&str> = HashSet::new();

        // Networks holding none of the existing pieces first
        for dossier in &eligible {
            if selected.len() == count {
                break;
            }
            let net = dossier.last_net.as_str();
            if !used_nets.contains(net) && taken_nets.insert(net) {
                taken.insert(dossier.node_id);
                selected.push(dossier.node_id);
            }
        }

        // Then any network not yet chosen
        for dossier in &eligible {
            if selected.len() == count {
                break;
            }
            if !taken.contains(&dossier.node_id) && taken_nets.insert(dossier.last_net.as_str()) {
                taken.insert(dossier.node_id);
                selected.push(dossier.node_id);
            }
        }

        // Then whatever remains
        for dossier in &eligible {
            if selected.len() == count {
                break;
            }
            if taken.insert(dossier.node_id) {
                selected.push(dossier.node_id);
            }
        }

        debug!(
            requested = count,
            eligible = eligible.len(),
            networks = taken_nets.len(),
            "Selected replacement nodes"
        );
        Ok(selected)
    }
}

//! Node and datacenter selection for a single top-level call
//!
//! Selection inside a datacenter is round-robin over insertion order. The
//! rotation counter lives on the [`Datacenter`](crate::topology::Datacenter)
//! and is shared by every caller; what is failed is remembered only by the
//! [`NodeSelector`] of the current call.

use crate::topology::{Deployment, Node};
use std::collections::{HashMap, HashSet};

/// Failover round over a deployment
pub struct NodeSelector<'a> {
    deployment: &'a Deployment,
    failed: HashMap<usize, HashSet<&'a str>>,
}

impl<'a> NodeSelector<'a> {
    pub fn new(deployment: &'a Deployment) -> Self {
        Self {
            deployment,
            failed: HashMap::new(),
        }
    }

    /// Next selectable datacenter after `current` (or the first one when `None`)
    pub fn next_datacenter(&self, current: Option<usize>) -> Option<usize> {
        let start = current.map_or(0, |i| i + 1);
        self.deployment
            .datacenters()
            .iter()
            .enumerate()
            .skip(start)
            .find(|(_, dc)| dc.is_selectable())
            .map(|(i, _)| i)
    }

    /// Pick the next node of a datacenter, skipping nodes failed in this round.
    ///
    /// Returns `None` once every node of the datacenter has failed.
    pub fn select_node(&self, datacenter: usize) -> Option<&'a Node> {
        let dc = self.deployment.datacenter_at(datacenter);
        let nodes = dc.nodes();
        if nodes.is_empty() {
            return None;
        }

        let failed = self.failed.get(&datacenter);
        let healthy = |n: &Node| failed.map_or(true, |f| !f.contains(n.id()));
        if !nodes.iter().any(healthy) {
            return None;
        }

        let start = dc.next_rotation() % nodes.len();
        (0..nodes.len())
            .map(|offset| &nodes[(start + offset) % nodes.len()])
            .find(|n| healthy(*n))
    }

    /// Remember that a node failed during this round
    pub fn mark_failed(&mut self, datacenter: usize, node: &'a Node) {
        self.failed.entry(datacenter).or_default().insert(node.id());
    }

    /// Whether a node was marked failed in this round
    pub fn is_failed(&self, datacenter: usize, node_id: &str) -> bool {
        self.failed
            .get(&datacenter)
            .is_some_and(|f| f.contains(node_id))
    }
}

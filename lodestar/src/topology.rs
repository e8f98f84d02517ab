//! Deployment topology: datacenters and the nodes they contain
//!
//! A [`Deployment`] is an ordered list of [`Datacenter`]s. The order is the
//! failover priority and never changes after construction. Each datacenter
//! owns the token provider for its authentication realm and an insertion
//! ordered set of [`Node`]s.

use crate::auth::TokenProvider;
use crate::error::{Error, Result};
use reqwest::Url;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// One reachable service instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    id: String,
    endpoint: Url,
    health_check_url: Url,
}

impl Node {
    /// Create a node, validating both URLs
    pub fn new(
        id: impl Into<String>,
        endpoint: &str,
        health_check_url: &str,
    ) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(Error::InvalidArgument("node id must not be empty".to_string()));
        }
        Ok(Self {
            endpoint: parse_url(&id, "endpoint", endpoint)?,
            health_check_url: parse_url(&id, "health check URL", health_check_url)?,
            id,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Endpoint without a trailing slash, ready for path concatenation
    pub fn base_url(&self) -> &str {
        self.endpoint.as_str().trim_end_matches('/')
    }

    /// Health check URL (metadata for callers, never polled by the client)
    pub fn health_check_url(&self) -> &Url {
        &self.health_check_url
    }
}

fn parse_url(node_id: &str, what: &str, raw: &str) -> Result<Url> {
    Url::parse(raw).map_err(|e| {
        Error::InvalidArgument(format!("Invalid {} '{}' for node {}: {}", what, raw, node_id, e))
    })
}

/// A group of nodes sharing one authentication realm
pub struct Datacenter {
    id: String,
    token_provider: Arc<dyn TokenProvider>,
    nodes: Vec<Node>,
    rotation: AtomicUsize,
}

impl Datacenter {
    /// Create an empty datacenter. It is not selectable until a node is added.
    pub fn new(id: impl Into<String>, token_provider: Arc<dyn TokenProvider>) -> Self {
        Self {
            id: id.into(),
            token_provider,
            nodes: Vec::new(),
            rotation: AtomicUsize::new(0),
        }
    }

    /// Add a node, consuming and returning the datacenter
    pub fn with_node(mut self, node: Node) -> Result<Self> {
        self.add_node(node)?;
        Ok(self)
    }

    /// Add a node. Node ids are unique within a datacenter.
    pub fn add_node(&mut self, node: Node) -> Result<()> {
        if self.nodes.iter().any(|n| n.id == node.id) {
            return Err(Error::InvalidArgument(format!(
                "Node {} already exists in datacenter {}",
                node.id, self.id
            )));
        }
        self.nodes.push(node);
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn token_provider(&self) -> &Arc<dyn TokenProvider> {
        &self.token_provider
    }

    /// Nodes in insertion order
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// A datacenter without nodes is never selected
    pub fn is_selectable(&self) -> bool {
        !self.nodes.is_empty()
    }

    /// Advance the shared rotation counter and return the starting offset
    pub(crate) fn next_rotation(&self) -> usize {
        self.rotation.fetch_add(1, Ordering::Relaxed)
    }
}

impl fmt::Debug for Datacenter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Datacenter")
            .field("id", &self.id)
            .field("nodes", &self.nodes)
            .finish_non_exhaustive()
    }
}

/// Ordered topology used for failover
#[derive(Debug)]
pub struct Deployment {
    datacenters: Vec<Datacenter>,
}

impl Deployment {
    /// Create a deployment. Order of `datacenters` is the failover order.
    pub fn new(datacenters: Vec<Datacenter>) -> Result<Self> {
        if datacenters.is_empty() {
            return Err(Error::InvalidArgument(
                "deployment needs at least one datacenter".to_string(),
            ));
        }
        for (i, dc) in datacenters.iter().enumerate() {
            if datacenters[..i].iter().any(|other| other.id == dc.id) {
                return Err(Error::InvalidArgument(format!(
                    "Datacenter {} is declared twice",
                    dc.id
                )));
            }
        }
        Ok(Self { datacenters })
    }

    /// Single-datacenter deployment, the common local setup
    pub fn single(datacenter: Datacenter) -> Result<Self> {
        Self::new(vec![datacenter])
    }

    pub fn datacenters(&self) -> &[Datacenter] {
        &self.datacenters
    }

    pub fn datacenter(&self, id: &str) -> Option<&Datacenter> {
        self.datacenters.iter().find(|dc| dc.id == id)
    }

    pub(crate) fn datacenter_at(&self, index: usize) -> &Datacenter {
        &self.datacenters[index]
    }

    /// Every node with its datacenter, in failover order
    pub fn nodes(&self) -> impl Iterator<Item = (&Datacenter, &Node)> {
        self.datacenters
            .iter()
            .flat_map(|dc| dc.nodes.iter().map(move |n| (dc, n)))
    }

    /// Total node count across datacenters
    pub fn node_count(&self) -> usize {
        self.datacenters.iter().map(|dc| dc.nodes.len()).sum()
    }
}

//! Connection pools
//!
//! A pool owns the set of known endpoints and answers one question for
//! the transport: which connection should carry the next request. Two
//! implementations exist: `NodePool` for multi-endpoint clusters with
//! health tracking and resurrection, and `CloudPool` for managed
//! single-endpoint deployments.

mod base;
mod cloud;
mod node;

pub use base::{parse_sniff_nodes, PoolCore};
pub use cloud::{parse_cloud_url, CloudPool};
pub use node::NodePool;

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

use crate::config::NodeConfig;
use crate::connection::Connection;
use crate::error::Result;
use crate::events::EventSink;
use crate::selector::{NodeFilterFn, NodeSelector};

/// Wall-clock time in Unix milliseconds
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Per-call inputs for connection selection
pub struct SelectionOptions<'a> {
    pub filter: &'a NodeFilterFn,
    pub selector: &'a dyn NodeSelector,
    pub now_ms: u64,
    pub request_id: &'a str,
    pub name: &'a str,
}

/// The pool capability the transport drives
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    /// Pick a connection for the next request, or None when no
    /// eligible node is alive
    fn get_connection(&self, opts: SelectionOptions<'_>) -> Option<Arc<Connection>>;

    fn mark_alive(&self, connection: &Arc<Connection>);

    fn mark_dead(&self, connection: &Arc<Connection>, now_ms: u64);

    /// Replace pool membership, preserving connections whose id or URL
    /// is retained
    fn update(&self, nodes: Vec<NodeConfig>) -> Result<()>;

    /// Add nodes; a duplicate id or URL is an error
    fn add(&self, nodes: Vec<NodeConfig>) -> Result<()>;

    /// Drop a node by id
    fn remove(&self, id: &str) -> Result<()>;

    /// Close every connection and clear the pool
    async fn empty(&self);

    fn connections(&self) -> Vec<Arc<Connection>>;

    fn size(&self) -> usize;

    /// Attach the transport's event sink
    fn set_event_sink(&self, sink: EventSink);
}

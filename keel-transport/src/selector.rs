//! Endpoint selection
//!
//! A selector picks one connection out of the alive, filter-approved
//! candidates. The filter decides which nodes are eligible at all; by
//! default master-only nodes are excluded from request traffic.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::Rng;

use crate::connection::Connection;

/// Chooses one connection from a non-empty candidate list
pub trait NodeSelector: Send + Sync {
    /// Return the index of the chosen connection
    fn select(&self, connections: &[Arc<Connection>]) -> usize;
}

/// Cycles through the candidates, visiting each one once per window
pub struct RoundRobinSelector {
    cursor: AtomicUsize,
}

impl RoundRobinSelector {
    pub fn new() -> Self {
        // pre-incremented on first use, so selection starts at index 0
        Self {
            cursor: AtomicUsize::new(usize::MAX),
        }
    }
}

impl Default for RoundRobinSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeSelector for RoundRobinSelector {
    fn select(&self, connections: &[Arc<Connection>]) -> usize {
        let len = connections.len();
        if len == 0 {
            return 0;
        }
        let advance = |cur: usize| {
            let next = cur.wrapping_add(1);
            if next >= len {
                0
            } else {
                next
            }
        };
        match self
            .cursor
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |cur| Some(advance(cur)))
        {
            Ok(previous) => advance(previous),
            Err(_) => 0,
        }
    }
}

/// Picks uniformly at random
pub struct RandomSelector;

impl NodeSelector for RandomSelector {
    fn select(&self, connections: &[Arc<Connection>]) -> usize {
        rand::thread_rng().gen_range(0..connections.len())
    }
}

/// Adapter turning a closure into a selector
pub struct FnSelector<F>(pub F);

impl<F> NodeSelector for FnSelector<F>
where
    F: Fn(&[Arc<Connection>]) -> usize + Send + Sync,
{
    fn select(&self, connections: &[Arc<Connection>]) -> usize {
        (self.0)(connections)
    }
}

/// Predicate deciding whether a node may serve requests
pub type NodeFilterFn = Arc<dyn Fn(&Connection) -> bool + Send + Sync>;

/// Exclude nodes that carry only the master role
pub fn default_node_filter(connection: &Connection) -> bool {
    !connection.roles().master_only()
}

/// The default filter as a shareable handle
pub fn default_filter() -> NodeFilterFn {
    Arc::new(default_node_filter)
}

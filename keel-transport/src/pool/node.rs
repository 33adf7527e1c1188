//! Standard multi-endpoint pool with health tracking
//!
//! Dead nodes go on a list ordered by ascending resurrection deadline.
//! Each selection pass gives the longest-dead node a chance to come
//! back, either by probing it (`ping`) or by fiat (`optimistic`).
//! A pool holding a single node with discovery disabled never declares
//! that node dead: with no alternative, the next request should try it
//! regardless.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use reqwest::Method;
use tracing::{debug, info};

use crate::config::{NodeConfig, PoolConfig, ResurrectStrategy};
use crate::connection::{Connection, ConnectionDefaults, ConnectionRequest};
use crate::error::Result;
use crate::events::{emit, EventSink, ResurrectEvent, TransportEvent};
use crate::http::HttpTransport;
use crate::metrics;
use crate::pool::{now_ms, ConnectionPool, PoolCore, SelectionOptions};

pub struct NodePool {
    inner: Arc<NodePoolInner>,
}

struct NodePoolInner {
    core: PoolCore,
    /// Ids of dead connections, ordered by ascending resurrect deadline
    dead: Mutex<Vec<String>>,
    config: PoolConfig,
    events: RwLock<Option<EventSink>>,
}

impl NodePool {
    pub fn new(config: PoolConfig) -> Self {
        let defaults = ConnectionDefaults {
            auth: config.auth.clone(),
            tls: config.tls.clone(),
            http: None,
        };
        Self::with_defaults(config, defaults)
    }

    /// Build a pool whose connections share an injected HTTP layer
    pub fn with_http_transport(config: PoolConfig, http: Arc<dyn HttpTransport>) -> Self {
        let defaults = ConnectionDefaults {
            auth: config.auth.clone(),
            tls: config.tls.clone(),
            http: Some(http),
        };
        Self::with_defaults(config, defaults)
    }

    fn with_defaults(config: PoolConfig, defaults: ConnectionDefaults) -> Self {
        Self {
            inner: Arc::new(NodePoolInner {
                core: PoolCore::new(defaults),
                dead: Mutex::new(Vec::new()),
                config,
                events: RwLock::new(None),
            }),
        }
    }

    /// Ids currently on the dead list, in resurrection order
    pub fn dead_ids(&self) -> Vec<String> {
        self.inner.dead.lock().clone()
    }

    /// Give the longest-dead node a resurrection chance. The ping
    /// probe runs in the background; its outcome is observed by the
    /// next selection pass.
    pub fn resurrect(&self, now: u64, request_id: &str, name: &str) {
        let strategy = self.inner.config.resurrect_strategy;
        if strategy == ResurrectStrategy::None {
            return;
        }

        let candidate = {
            let dead = self.inner.dead.lock();
            dead.first().cloned()
        };
        let conn = match candidate.and_then(|id| self.inner.core.get_by_id(&id)) {
            Some(conn) => conn,
            None => return,
        };
        if conn.resurrect_timeout() > now {
            return;
        }

        match strategy {
            ResurrectStrategy::Optimistic => {
                // revive without touching the failure counters; a real
                // failure will push the node straight back with a
                // longer backoff
                {
                    let id = conn.id();
                    self.inner.dead.lock().retain(|d| *d != id);
                }
                conn.revive();
                info!("Optimistically resurrected connection {}", conn.id());
                metrics::record_resurrect(strategy.as_str(), true);
                self.inner.emit_resurrect(strategy, name, request_id, true, &conn);
            }
            ResurrectStrategy::Ping => {
                let inner = Arc::clone(&self.inner);
                let conn = Arc::clone(&conn);
                let request_id = request_id.to_string();
                let name = name.to_string();
                let timeout = self.inner.config.ping_timeout();
                let handle = match tokio::runtime::Handle::try_current() {
                    Ok(handle) => handle,
                    Err(_) => return,
                };
                handle.spawn(async move {
                    let is_alive = ping(&conn, timeout).await;
                    if is_alive {
                        info!("Resurrected connection {}", conn.id());
                        inner.mark_alive(&conn);
                    } else {
                        debug!("Resurrection ping failed for {}", conn.id());
                        inner.mark_dead(&conn, now_ms());
                    }
                    metrics::record_resurrect("ping", is_alive);
                    inner.emit_resurrect(
                        ResurrectStrategy::Ping,
                        &name,
                        &request_id,
                        is_alive,
                        &conn,
                    );
                });
            }
            ResurrectStrategy::None => unreachable!(),
        }
    }
}

/// HEAD probe against the node root; gateway errors count as dead
async fn ping(conn: &Arc<Connection>, timeout: Duration) -> bool {
    let request = ConnectionRequest {
        method: Method::HEAD,
        path: "/".to_string(),
        querystring: None,
        body: None,
        headers: None,
        timeout,
    };
    match conn.request(request).await {
        Ok(response) => !matches!(response.status, 502 | 503 | 504),
        Err(_) => false,
    }
}

impl NodePoolInner {
    /// One alternative-less node with discovery off is never declared
    /// dead
    fn immortal(&self) -> bool {
        self.core.size() == 1 && !self.config.sniff_enabled
    }

    fn mark_alive(&self, conn: &Arc<Connection>) {
        if self.immortal() {
            return;
        }
        let id = conn.id();
        self.dead.lock().retain(|d| *d != id);
        conn.mark_alive();
        metrics::update_node_state(&id, true);
    }

    fn mark_dead(&self, conn: &Arc<Connection>, now: u64) {
        if self.immortal() {
            return;
        }
        conn.mark_dead(now);
        let id = conn.id();
        let mut dead = self.dead.lock();
        if !dead.iter().any(|d| *d == id) {
            dead.push(id.clone());
        }
        let deadline = |id: &String| {
            self.core
                .get_by_id(id)
                .map(|c| c.resurrect_timeout())
                .unwrap_or(u64::MAX)
        };
        dead.sort_by_key(deadline);
        metrics::update_node_state(&id, false);
    }

    fn emit_resurrect(
        &self,
        strategy: ResurrectStrategy,
        name: &str,
        request_id: &str,
        is_alive: bool,
        conn: &Arc<Connection>,
    ) {
        emit(
            &self.events.read(),
            TransportEvent::Resurrect(ResurrectEvent {
                strategy,
                name: name.to_string(),
                request_id: request_id.to_string(),
                is_alive,
                connection_id: conn.id(),
            }),
        );
    }
}

#[async_trait]
impl ConnectionPool for NodePool {
    fn get_connection(&self, opts: SelectionOptions<'_>) -> Option<Arc<Connection>> {
        self.resurrect(opts.now_ms, opts.request_id, opts.name);

        let alive: Vec<Arc<Connection>> = self
            .inner
            .core
            .connections()
            .into_iter()
            .filter(|c| c.is_alive() && (opts.filter)(c))
            .collect();
        if alive.is_empty() {
            return None;
        }
        let index = opts.selector.select(&alive);
        alive.get(index).cloned()
    }

    fn mark_alive(&self, connection: &Arc<Connection>) {
        self.inner.mark_alive(connection);
    }

    fn mark_dead(&self, connection: &Arc<Connection>, now: u64) {
        self.inner.mark_dead(connection, now);
    }

    fn update(&self, nodes: Vec<NodeConfig>) -> Result<()> {
        self.inner.core.update(nodes)?;
        // everything the update preserved is alive again
        let mut dead = self.inner.dead.lock();
        dead.retain(|id| {
            self.inner
                .core
                .get_by_id(id)
                .map(|c| !c.is_alive())
                .unwrap_or(false)
        });
        Ok(())
    }

    fn add(&self, nodes: Vec<NodeConfig>) -> Result<()> {
        self.inner.core.add(nodes)
    }

    fn remove(&self, id: &str) -> Result<()> {
        self.inner.core.remove(id)?;
        self.inner.dead.lock().retain(|d| d != id);
        Ok(())
    }

    async fn empty(&self) {
        self.inner.core.empty().await;
        self.inner.dead.lock().clear();
    }

    fn connections(&self) -> Vec<Arc<Connection>> {
        self.inner.core.connections()
    }

    fn size(&self) -> usize {
        self.inner.core.size()
    }

    fn set_event_sink(&self, sink: EventSink) {
        *self.inner.events.write() = Some(sink);
    }
}

//! Single-endpoint pool for managed cloud deployments
//!
//! Cloud clusters sit behind one load-balanced endpoint, encoded in a
//! cloud id of the form `name:<base64 of host$cluster$kibana>`. With
//! nowhere else to route, the pool hands out its one connection even
//! when it has been marked dead.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use parking_lot::RwLock;
use tracing::debug;
use url::Url;

use crate::config::{Auth, NodeConfig, TlsConfig, TlsVersion};
use crate::connection::{Connection, ConnectionDefaults};
use crate::error::{Result, TransportError};
use crate::events::EventSink;
use crate::http::HttpTransport;
use crate::pool::{ConnectionPool, PoolCore, SelectionOptions};

pub struct CloudPool {
    core: PoolCore,
    cached: RwLock<Option<Arc<Connection>>>,
}

impl CloudPool {
    /// Build a pool from a cloud id; the endpoint always speaks HTTPS
    /// with a TLSv1.2 floor
    pub fn new(cloud_id: &str, auth: Option<Auth>) -> Result<Self> {
        Self::with_defaults(cloud_id, auth, None)
    }

    /// Test hook: share an injected HTTP layer
    pub fn with_http_transport(
        cloud_id: &str,
        auth: Option<Auth>,
        http: Arc<dyn HttpTransport>,
    ) -> Result<Self> {
        Self::with_defaults(cloud_id, auth, Some(http))
    }

    fn with_defaults(
        cloud_id: &str,
        auth: Option<Auth>,
        http: Option<Arc<dyn HttpTransport>>,
    ) -> Result<Self> {
        let url = parse_cloud_url(cloud_id)?;
        let defaults = ConnectionDefaults {
            auth,
            tls: Some(TlsConfig {
                min_version: Some(TlsVersion::Tls12),
                ..Default::default()
            }),
            http,
        };
        let pool = Self {
            core: PoolCore::new(defaults),
            cached: RwLock::new(None),
        };
        pool.update(vec![NodeConfig::new(url)])?;
        Ok(pool)
    }

}

/// Decode a cloud id into its endpoint URL.
///
/// The payload after the label is base64 of `host$cluster_id$kibana_id`;
/// the endpoint is `https://<cluster_id>.<host>`.
pub fn parse_cloud_url(cloud_id: &str) -> Result<Url> {
    let invalid = || TransportError::Configuration(format!("invalid cloud id '{}'", cloud_id));

    let (_, payload) = cloud_id.split_once(':').ok_or_else(invalid)?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(payload)
        .map_err(|_| invalid())?;
    let decoded = String::from_utf8(decoded).map_err(|_| invalid())?;

    let mut parts = decoded.split('$');
    let host = parts.next().filter(|s| !s.is_empty()).ok_or_else(invalid)?;
    let cluster_id = parts.next().filter(|s| !s.is_empty()).ok_or_else(invalid)?;

    Url::parse(&format!("https://{}.{}", cluster_id, host)).map_err(|_| invalid())
}

#[async_trait]
impl ConnectionPool for CloudPool {
    /// Always returns the cached connection; with a single endpoint
    /// there is nothing to select between
    fn get_connection(&self, _opts: SelectionOptions<'_>) -> Option<Arc<Connection>> {
        self.cached.read().clone()
    }

    fn mark_alive(&self, _connection: &Arc<Connection>) {}

    fn mark_dead(&self, _connection: &Arc<Connection>, _now_ms: u64) {}

    fn update(&self, nodes: Vec<NodeConfig>) -> Result<()> {
        self.core.update(nodes)?;
        let first = self.core.connections().into_iter().next();
        *self.cached.write() = first;
        Ok(())
    }

    fn add(&self, nodes: Vec<NodeConfig>) -> Result<()> {
        self.core.add(nodes)
    }

    fn remove(&self, id: &str) -> Result<()> {
        self.core.remove(id)
    }

    async fn empty(&self) {
        self.cached.write().take();
        self.core.empty().await;
        debug!("Cloud pool emptied");
    }

    fn connections(&self) -> Vec<Arc<Connection>> {
        self.core.connections()
    }

    fn size(&self) -> usize {
        self.core.size()
    }

    fn set_event_sink(&self, _sink: EventSink) {}
}

//! Shared pool mechanics: construction, membership updates, discovery
//! record parsing
//!
//! `PoolCore` owns the ordered connection list and the identity rules
//! that keep connections stable across cluster discovery: an incoming
//! node is matched to an existing connection first by id, then by URL
//! (discovery sometimes re-keys a known endpoint), and only then
//! created fresh.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::config::{NodeConfig, NodeRoles};
use crate::connection::{Connection, ConnectionDefaults};
use crate::error::{Result, TransportError};

pub struct PoolCore {
    connections: RwLock<Vec<Arc<Connection>>>,
    defaults: ConnectionDefaults,
}

impl PoolCore {
    pub fn new(defaults: ConnectionDefaults) -> Self {
        Self {
            connections: RwLock::new(Vec::new()),
            defaults,
        }
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.read().clone()
    }

    pub fn size(&self) -> usize {
        self.connections.read().len()
    }

    pub fn get_by_id(&self, id: &str) -> Option<Arc<Connection>> {
        self.connections.read().iter().find(|c| c.id() == id).cloned()
    }

    /// Construct a connection with the pool defaults applied
    pub fn build_connection(&self, config: NodeConfig) -> Result<Arc<Connection>> {
        Ok(Arc::new(Connection::new(config, &self.defaults)?))
    }

    /// Append nodes; duplicate id or URL is an error
    pub fn add(&self, nodes: Vec<NodeConfig>) -> Result<()> {
        let mut list = self.connections.write();
        for node in nodes {
            let conn = Arc::new(Connection::new(node, &self.defaults)?);
            if list.iter().any(|c| c.id() == conn.id()) {
                return Err(TransportError::Configuration(format!(
                    "connection with id '{}' is already present",
                    conn.id()
                )));
            }
            if list.iter().any(|c| c.url().as_str() == conn.url().as_str()) {
                return Err(TransportError::Configuration(format!(
                    "connection with url '{}' is already present",
                    conn.url()
                )));
            }
            list.push(conn);
        }
        Ok(())
    }

    /// Replace membership with `nodes`, preserving the identity of
    /// connections whose id or URL is retained. Survivors are marked
    /// alive; everything else is closed and dropped.
    pub fn update(&self, nodes: Vec<NodeConfig>) -> Result<()> {
        let mut list = self.connections.write();

        let mut kept: HashSet<String> = HashSet::new();
        let mut fresh: Vec<Arc<Connection>> = Vec::new();

        for node in nodes {
            let stripped = strip_userinfo(&node.url);
            let node_id = node
                .id
                .clone()
                .unwrap_or_else(|| stripped.to_string());

            if let Some(existing) = list.iter().find(|c| c.id() == node_id) {
                existing.mark_alive();
                kept.insert(node_id);
            } else if let Some(existing) = list
                .iter()
                .find(|c| c.url().as_str() == stripped.as_str())
            {
                // same endpoint, new id from discovery
                debug!(
                    "Re-keying connection {} as {}",
                    existing.id(),
                    node_id
                );
                existing.set_id(node_id.clone());
                existing.mark_alive();
                kept.insert(node_id);
            } else {
                let conn = Arc::new(Connection::new(node, &self.defaults)?);
                if kept.contains(&conn.id()) || fresh.iter().any(|c| c.id() == conn.id()) {
                    return Err(TransportError::Configuration(format!(
                        "duplicate connection id '{}' in update",
                        conn.id()
                    )));
                }
                kept.insert(conn.id());
                fresh.push(conn);
            }
        }

        let mut survivors = Vec::with_capacity(kept.len());
        let mut dropped = Vec::new();
        for conn in list.iter() {
            if kept.contains(&conn.id()) {
                survivors.push(Arc::clone(conn));
            } else {
                dropped.push(Arc::clone(conn));
            }
        }
        survivors.extend(fresh);
        *list = survivors;
        drop(list);

        for conn in dropped {
            debug!("Dropping connection {} after update", conn.id());
            close_in_background(conn);
        }

        Ok(())
    }

    /// Drop one node by id, closing its connection
    pub fn remove(&self, id: &str) -> Result<()> {
        let removed = {
            let mut list = self.connections.write();
            let before = list.len();
            let mut removed = None;
            list.retain(|c| {
                if c.id() == id {
                    removed = Some(Arc::clone(c));
                    false
                } else {
                    true
                }
            });
            if list.len() == before {
                return Err(TransportError::Configuration(format!(
                    "no connection with id '{}'",
                    id
                )));
            }
            removed
        };
        if let Some(conn) = removed {
            close_in_background(conn);
        }
        Ok(())
    }

    /// Close every connection, wait for them to quiesce, and clear the
    /// pool
    pub async fn empty(&self) {
        let drained: Vec<Arc<Connection>> = {
            let mut list = self.connections.write();
            std::mem::take(&mut *list)
        };
        futures::future::join_all(drained.iter().map(|c| c.close())).await;
        debug!("Connection pool emptied ({} closed)", drained.len());
    }
}

fn close_in_background(conn: Arc<Connection>) {
    // outside a runtime there is nothing in flight to wait for
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(async move { conn.close().await });
    }
}

fn strip_userinfo(url: &Url) -> Url {
    let mut stripped = url.clone();
    let _ = stripped.set_username("");
    let _ = stripped.set_password(None);
    stripped
}

#[derive(Debug, Deserialize)]
struct SniffResponse {
    nodes: HashMap<String, SniffNode>,
}

#[derive(Debug, Deserialize)]
struct SniffNode {
    http: Option<SniffHttp>,
    #[serde(default)]
    roles: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SniffHttp {
    publish_address: String,
}

/// Convert a cluster discovery payload into node descriptors.
///
/// `publish_address` comes in two forms: `host:port` and
/// `fqdn/ip:port`; in the second form the name before the slash is the
/// hostname and the port comes from the suffix. Addresses without a
/// scheme get `scheme` prefixed.
pub fn parse_sniff_nodes(body: &Value, scheme: &str) -> Result<Vec<NodeConfig>> {
    let response: SniffResponse = serde_json::from_value(body.clone())
        .map_err(|e| TransportError::Deserialization(format!("malformed nodes payload: {}", e)))?;

    let mut hosts = Vec::with_capacity(response.nodes.len());
    for (id, node) in response.nodes {
        let http = match node.http {
            Some(http) => http,
            None => {
                warn!("Discovery record {} has no http address, skipping", id);
                continue;
            }
        };
        let url = parse_publish_address(&http.publish_address, scheme)?;
        hosts.push(
            NodeConfig::new(url)
                .with_id(id)
                .with_roles(NodeRoles::from_names(&node.roles)),
        );
    }
    Ok(hosts)
}

fn parse_publish_address(address: &str, scheme: &str) -> Result<Url> {
    let bad = |why: &str| {
        TransportError::Deserialization(format!(
            "invalid publish_address '{}': {}",
            address, why
        ))
    };

    if address.contains("://") {
        return Url::parse(address).map_err(|e| bad(&e.to_string()));
    }

    let authority = match address.split_once('/') {
        Some((fqdn, rest)) => {
            let (_, port) = rest.rsplit_once(':').ok_or_else(|| bad("missing port"))?;
            format!("{}:{}", fqdn, port)
        }
        None => address.to_string(),
    };

    Url::parse(&format!("{}://{}", scheme, authority)).map_err(|e| bad(&e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn core() -> PoolCore {
        PoolCore::new(ConnectionDefaults::default())
    }

    fn node(url: &str) -> NodeConfig {
        NodeConfig::from_url_str(url).unwrap()
    }

    #[test]
    fn test_add_rejects_duplicate_id() {
        let core = core();
        core.add(vec![node("http://a:9200")]).unwrap();
        let err = core.add(vec![node("http://a:9200")]).unwrap_err();
        assert_eq!(err.error_type(), "configuration");
    }

    #[test]
    fn test_add_rejects_duplicate_url_under_new_id() {
        let core = core();
        core.add(vec![node("http://a:9200")]).unwrap();
        let err = core
            .add(vec![node("http://a:9200").with_id("other")])
            .unwrap_err();
        assert!(err.to_string().contains("url"));
    }

    #[test]
    fn test_update_preserves_identity_by_id() {
        let core = core();
        core.add(vec![node("http://a:9200").with_id("node-a")])
            .unwrap();
        let before = core.get_by_id("node-a").unwrap();
        before.mark_dead(1_000);

        core.update(vec![
            node("http://a:9200").with_id("node-a"),
            node("http://b:9200").with_id("node-b"),
        ])
        .unwrap();

        let after = core.get_by_id("node-a").unwrap();
        assert!(Arc::ptr_eq(&before, &after));
        // survivors come back alive
        assert!(after.is_alive());
        assert_eq!(core.size(), 2);
    }

    #[test]
    fn test_update_rekeys_on_url_match() {
        let core = core();
        core.add(vec![node("http://a:9200")]).unwrap();
        let before = core.connections()[0].clone();

        core.update(vec![node("http://a:9200").with_id("discovered-id")])
            .unwrap();

        assert_eq!(core.size(), 1);
        let after = core.get_by_id("discovered-id").unwrap();
        assert!(Arc::ptr_eq(&before, &after));
    }

    #[test]
    fn test_update_drops_absent_nodes() {
        let core = core();
        core.add(vec![
            node("http://a:9200").with_id("a"),
            node("http://b:9200").with_id("b"),
        ])
        .unwrap();

        core.update(vec![node("http://b:9200").with_id("b")]).unwrap();

        assert_eq!(core.size(), 1);
        assert!(core.get_by_id("a").is_none());
        assert!(core.get_by_id("b").is_some());
    }

    #[test]
    fn test_update_keeps_existing_order_and_appends_new() {
        let core = core();
        core.add(vec![
            node("http://a:9200").with_id("a"),
            node("http://b:9200").with_id("b"),
        ])
        .unwrap();

        core.update(vec![
            node("http://c:9200").with_id("c"),
            node("http://b:9200").with_id("b"),
            node("http://a:9200").with_id("a"),
        ])
        .unwrap();

        let ids: Vec<String> = core.connections().iter().map(|c| c.id()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_empty_clears_pool() {
        let core = core();
        core.add(vec![node("http://a:9200"), node("http://b:9200")])
            .unwrap();
        core.empty().await;
        assert_eq!(core.size(), 0);
    }

    #[test]
    fn test_remove_unknown_id_is_error() {
        let core = core();
        assert!(core.remove("ghost").is_err());
    }

    #[test]
    fn test_parse_sniff_nodes_plain_address() {
        let body = json!({
            "nodes": {
                "node-1": {
                    "http": { "publish_address": "127.0.0.1:9200" },
                    "roles": ["master", "data", "ingest"]
                }
            }
        });
        let hosts = parse_sniff_nodes(&body, "http").unwrap();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].url.as_str(), "http://127.0.0.1:9200/");
        assert_eq!(hosts[0].id.as_deref(), Some("node-1"));
        let roles = hosts[0].roles.unwrap();
        assert!(roles.master && roles.data && roles.ingest && !roles.ml);
    }

    #[test]
    fn test_parse_sniff_nodes_fqdn_form() {
        let body = json!({
            "nodes": {
                "node-1": {
                    "http": { "publish_address": "search.example.com/10.0.0.3:9200" },
                    "roles": ["data"]
                }
            }
        });
        let hosts = parse_sniff_nodes(&body, "https").unwrap();
        assert_eq!(hosts[0].url.as_str(), "https://search.example.com:9200/");
        let roles = hosts[0].roles.unwrap();
        assert!(!roles.master && roles.data);
    }

    #[test]
    fn test_parse_sniff_nodes_skips_records_without_http() {
        let body = json!({
            "nodes": {
                "node-1": { "roles": ["master"] },
                "node-2": {
                    "http": { "publish_address": "10.0.0.2:9200" },
                    "roles": ["data"]
                }
            }
        });
        let hosts = parse_sniff_nodes(&body, "http").unwrap();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].id.as_deref(), Some("node-2"));
    }

    #[test]
    fn test_parse_sniff_nodes_rejects_malformed_payload() {
        let err = parse_sniff_nodes(&json!({"nodes": 42}), "http").unwrap_err();
        assert_eq!(err.error_type(), "deserialization");
    }
}

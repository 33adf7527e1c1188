//! keel-transport - Node-aware HTTP transport for clustered search services
//!
//! Given a pool of candidate endpoints, the transport performs one
//! logical request by selecting a live node, serializing the payload,
//! executing the HTTP exchange, interpreting status codes, and - on
//! specific failure classes - marking nodes dead, resurrecting them
//! later, optionally re-discovering the cluster ("sniffing"), and
//! retrying.
//!
//! # Architecture
//!
//! - **Serializer**: pure codec for JSON, newline-delimited JSON, and
//!   URL query strings
//! - **Connection**: one endpoint with identity, role set, health
//!   counters, and its own HTTP client
//! - **Pools**: `NodePool` with dead-list tracking and resurrection;
//!   `CloudPool` for single-endpoint managed deployments
//! - **Transport**: the orchestrator driving selection, encoding,
//!   compression, retries, sniffing, and response classification
//! - **Selectors/filters**: pluggable endpoint choice (round-robin,
//!   random, custom) and node filtering (master-only nodes excluded by
//!   default)
//!
//! # Example
//!
//! ```ignore
//! use keel_transport::{NodeConfig, NodePool, PoolConfig, Transport, TransportConfig};
//! use keel_transport::{RequestOptions, RequestParams};
//! use std::sync::Arc;
//!
//! let pool = Arc::new(NodePool::new(PoolConfig::default()));
//! pool.update(vec![NodeConfig::from_url_str("http://localhost:9200")?])?;
//!
//! let transport = Transport::new(pool, TransportConfig::default())?;
//! let response = transport
//!     .request(
//!         RequestParams::new(reqwest::Method::GET, "/_cat/indices"),
//!         RequestOptions::default(),
//!     )
//!     .await?;
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod http;
pub mod metrics;
pub mod pool;
pub mod selector;
pub mod serializer;
pub mod types;

mod connection;
mod transport;

pub use config::{
    Auth, NodeConfig, NodeRoles, PoolConfig, ResurrectStrategy, TlsConfig, TlsVersion,
    TransportConfig,
};
pub use connection::{
    Connection, ConnectionDefaults, ConnectionRequest, NodeStatus, RESURRECT_TIMEOUT_BASE_MS,
    RESURRECT_TIMEOUT_CUTOFF,
};
pub use error::{Result, TransportError};
pub use events::{
    EventSink, RequestEvent, ResponseEvent, ResurrectEvent, SniffEvent, TransportEvent,
};
pub use http::{HttpBody, HttpRequest, HttpTransport, RawResponse, ReqwestTransport};
pub use pool::{parse_cloud_url, ConnectionPool, CloudPool, NodePool, SelectionOptions};
pub use selector::{
    default_node_filter, FnSelector, NodeFilterFn, NodeSelector, RandomSelector,
    RoundRobinSelector,
};
pub use transport::{RequestHandle, RequestIdGenerator, Transport, TransportBuilder};
pub use types::{
    BodyStream, RequestBody, RequestMeta, RequestOptions, RequestParams, Response, ResponseBody,
    SniffMeta, SniffReason,
};

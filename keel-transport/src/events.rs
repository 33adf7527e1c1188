//! Transport lifecycle events
//!
//! Events are delivered over a tokio broadcast channel. The sink is
//! optional; with no sink (or no subscribers) every emit is a no-op.
//! Subscribers must not assume a specific task context.

use tokio::sync::broadcast;

use crate::config::ResurrectStrategy;
use crate::types::SniffReason;

/// Sink for transport lifecycle events
pub type EventSink = broadcast::Sender<TransportEvent>;

/// Events emitted around the request lifecycle
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Fired just before a request attempt hits the wire
    Request(RequestEvent),
    /// Fired after the terminal outcome of a request
    Response(ResponseEvent),
    /// Fired after a cluster discovery attempt
    Sniff(SniffEvent),
    /// Fired after a dead node resurrection attempt
    Resurrect(ResurrectEvent),
}

#[derive(Debug, Clone)]
pub struct RequestEvent {
    pub request_id: String,
    pub name: String,
    pub attempts: u32,
    pub connection_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResponseEvent {
    pub request_id: String,
    pub name: String,
    pub status_code: Option<u16>,
    /// Error label when the request failed
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SniffEvent {
    pub reason: SniffReason,
    /// Number of hosts the cluster reported
    pub hosts: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResurrectEvent {
    pub strategy: ResurrectStrategy,
    pub name: String,
    pub request_id: String,
    pub is_alive: bool,
    pub connection_id: String,
}

/// Send an event, ignoring the absence of sink or subscribers
pub fn emit(sink: &Option<EventSink>, event: TransportEvent) {
    if let Some(sink) = sink {
        let _ = sink.send(event);
    }
}

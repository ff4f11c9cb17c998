// ==============
// crates/backend-lib/src/metrics.rs

//! Central place for metric keys
pub const WS_CONNECTION: &str = "ws.connection";
pub const WS_AUTH_REJECTED: &str = "ws.auth_rejected";
pub const HUB_CONNECTIONS: &str = "hub.connections";
pub const HUB_ADMITTED: &str = "hub.admitted";
pub const HUB_RETIRED: &str = "hub.retired";
pub const HUB_RETIRE_FAILED: &str = "hub.retire_failed";
pub const HUB_EVICTED: &str = "hub.evicted";
pub const HUB_ROUTED: &str = "hub.routed";
pub const HUB_ROUTE_DROPPED: &str = "hub.route_dropped";
pub const HUB_RESTARTS: &str = "hub.restarts";
pub const MESSAGE_REJECTED: &str = "message.rejected";
pub const MESSAGE_PERSIST_FAILED: &str = "message.persist_failed";
pub const PRESENCE_FAILURES: &str = "presence.failures";
pub const WS_CLOSED: &str = "ws.closed";

#![deny(unsafe_code)]

//! noticemq is a self-contained message-push server: an authenticated HTTP
//! webhook fans notifications out to MQTT subscribers through an embedded
//! broker (raw TCP and WebSocket), per-tenant message history is kept in a
//! local KV store, and authentication failures are rate limited per IP.

pub mod api;
pub mod broker;
pub mod logger;
pub mod ratelimit;
pub mod server;
pub mod settings;
pub mod store;

pub type Result<T> = anyhow::Result<T>;

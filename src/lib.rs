//! Server-side core of a realtime collaborative Markdown editor: a
//! conflict-free replicated sequence plus the session machinery that
//! multiplexes WebSocket connections per document, applies and fans out
//! operations, and debounces persistence. See `SPEC_FULL.md` for the
//! full requirements this crate implements.

pub mod auth;
pub mod codec;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod crdt;
pub mod error;
pub mod persist;
pub mod room;
pub mod store;
pub mod telemetry;
pub mod ws;

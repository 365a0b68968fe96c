//! cmdgate - command dispatch gateway for intermittently connected agents.
//!
//! Producers submit commands over HTTP. Agents either hold a WebSocket open
//! and receive commands as they are created, or poll for their oldest pending
//! ones. Results come back through per-category ingestion endpoints and are
//! correlated onto the originating command and its incident.

pub mod api;
pub mod client;
pub mod command;
pub mod config;
pub mod dispatch;
pub mod incident;
pub mod ingest;
pub mod protocol;
pub mod queue;
pub mod reaper;
pub mod registry;
pub mod store;

//! ferry relay library
//!
//! Brokers file commands between browser clients and on-site agents over a
//! duplex WebSocket channel: the connection registry, the command relay, the
//! file command protocol, the identity gate, and the agent runtime.

pub mod agent;
pub mod auth;
pub mod cli;
pub mod config;
pub mod logging;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod server;
pub mod storage;

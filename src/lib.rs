//! clawdbot gateway library
//!
//! Core functionality for the clawdbot gateway: the hub WebSocket plane,
//! per-agent session state, node routing, and the gated exec engine.

pub mod agent;
pub mod approvals;
pub mod auth;
pub mod cli;
pub mod config;
pub mod exec;
pub mod gateway;
pub mod logging;
pub mod net;
pub mod nodes;
pub mod server;
pub mod sessions;

//! ptyrelay - run commands in pseudo-terminals on behalf of remote callers.
//!
//! Two transports share one process model: terminal sessions over WebSocket
//! (one master, any number of read-only listeners) and one-shot invocations
//! over HTTP that report back through a retried callback.

// ============================================================================
// Core Infrastructure
// ============================================================================

pub mod build_info;
pub mod config;
pub mod http_client;

// ============================================================================
// Server & HTTP
// ============================================================================

pub mod handlers;
pub mod server;

// ============================================================================
// Domain
// ============================================================================

pub mod framer;
pub mod invoke;
pub mod join;
pub mod process;
pub mod sink;
pub mod status;
pub mod terminal;

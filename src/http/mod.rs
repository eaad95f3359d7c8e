//! HTTP layer for the git receive service.
//!
//! This module provides the axum-based HTTP server that speaks the git smart
//! HTTP protocol: it routes and authenticates requests, runs `git` as a
//! stateless RPC per request and streams its output back with packet-line
//! framing.

pub mod handler;
pub mod pktline;
pub mod router;

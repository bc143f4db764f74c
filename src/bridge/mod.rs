// Event bridge - ingress for out-of-band worker events

//! # Event Bridge Module
//!
//! External worker processes (spawned by running modules) report progress by
//! POSTing JSON events to a small HTTP ingress. The bridge:
//!
//! - validates the wire schema and stamps `server_time`
//! - de-duplicates by event id over a bounded FIFO window
//! - routes to in-process subscribers keyed by normalized module id
//! - buffers pre-subscription arrivals in a bounded per-module backlog
//! - bounds every subscriber queue, preserving critical events on overflow
//!
//! Layout:
//! - `config`: [`config::BridgeConfig`] with defaults and environment overrides
//! - `router`: [`router::EventRouter`] and [`router::Subscription`]
//! - `server`: [`server::BridgeServer`], the axum HTTP ingress

pub mod config;
pub mod router;
pub mod server;

//! Subtrace demo services
//!
//! A two-hop call chain (gateway → dataplane) that exercises subtrace
//! assignment end to end: each service runs its own tracing pipeline, so
//! one distributed trace ends up with two subtrace ids — one per hop —
//! while the trace id stays shared through W3C `traceparent` propagation.
//!
//! The services themselves are demonstration scaffolding: request
//! validation, a mock database with an N+1 query pattern, and a payment
//! chain that fails on a deep child span at a configurable rate.

pub mod config;
pub mod dataplane;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod middleware;
pub mod telemetry;

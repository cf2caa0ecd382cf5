//! Pipeline components and their wiring.
//!
//! ## Structure
//!
//! - [`store`] - durable SQLite store, row-locked counter store, dead letters.
//! - [`task`] - creation tasks, their state machine, retry policy and the
//!   single-attempt creation worker.
//! - [`pool`] - bounded worker pool with backpressure and retry scheduling.
//! - [`reconciler`] - incremental and authoritative cached-count maintenance.
//! - [`search`] - search index, best-effort indexer and reindex sweep.
//! - [`service`] - the boundary exposed to request handlers.
//! - [`config`] / [`telemetry`] - process configuration and observability.

pub mod config;
pub mod pool;
pub mod reconciler;
pub mod search;
pub mod service;
pub mod store;
pub mod task;
pub mod telemetry;

#[cfg(test)]
mod tests;

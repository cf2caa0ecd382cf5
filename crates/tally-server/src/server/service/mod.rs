//! The boundary exposed to request handlers and operator commands.
//!
//! ## Structure
//!
//! - [`handler`] - [`PipelineService`](handler::PipelineService): allocation
//!   on the request path, task submission, and the maintenance operations.
//! - [`gaps`] - detection of allocated numbers that never became rows.

pub mod gaps;
pub mod handler;

//! Deduplicated evaluation task sets for ewb.
//!
//! A [`TaskGraph`] is a flat, ordered set of independent [`Task`]s, one per
//! distinct cache key. Evaluations never depend on one another, so the graph
//! carries no edges; what it guarantees is that every key appears once and
//! that two different requests never silently share a key.
//!
//! # Key Types
//!
//! - [`Task`]: A request tagged with its cache key and an optional priority
//! - [`TaskGraph`]: The deduplicated task set
//! - [`RequestMatrix`]: Cross product of models, events, variables and parameter sets
//!
//! # Example
//!
//! ```ignore
//! use ewb_task_graph::{RequestMatrix, TaskGraph};
//!
//! let matrix = RequestMatrix::new()
//!     .event_types(["heat_wave"])
//!     .model_ids(["hres", "aifs"])
//!     .variables(["surface_air_temperature"]);
//! let graph = TaskGraph::build(matrix.requests())?;
//! assert_eq!(graph.len(), 2);
//! ```

mod error;
mod graph;
mod matrix;

pub use error::{Error, Result};
pub use graph::{Task, TaskGraph};
pub use matrix::RequestMatrix;

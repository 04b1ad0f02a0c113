//! Flow Annealed Importance Sampling Bootstrap: a normalizing flow trained on AIS samples
//! that start at the flow and are annealed towards the target.

pub mod ais;
pub mod checkpoint;
pub mod config;
pub mod distributions;
pub mod error;
pub mod evaluation;
pub mod flow;
pub mod io;
pub mod logger;
pub mod model;
pub mod replay_buffer;
pub mod schedule;
pub mod stats;
pub mod targets;
pub mod trainer;
pub mod transition;

pub use error::{EvaluationError, FabError, Result};

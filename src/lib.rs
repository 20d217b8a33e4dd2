pub mod analyzers;
pub mod cli;
pub mod config;
pub mod error;
pub mod extract;
pub mod models;
pub mod orchestrator;
pub mod store;
pub mod transform;
pub mod utils;
pub mod warehouse;

pub use error::{PipelineError, Result};

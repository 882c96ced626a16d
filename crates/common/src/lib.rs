pub mod config;
pub mod datetime;
pub mod error;
pub mod types;

pub use error::{Result, WorkerError};

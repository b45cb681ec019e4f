//! stem-splitter library crate.
//!
//! Asynchronous audio stem separation: uploads are validated and stored, a
//! job is created for each, and a supervised pipeline drives it through the
//! separation engine and into a downloadable zip archive.

pub mod config;
pub mod error;
pub mod jobs;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod services;
pub mod store;
pub mod upload;
pub mod utils;

pub use error::{Error, Result};

pub mod config;
pub mod domain;
pub mod error;
pub mod feedback;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod registry;
pub mod review;
pub mod server;
pub mod storage;

pub use error::{Result, ScraperError};

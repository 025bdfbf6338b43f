pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod fusion;
pub mod ingest;
mod metrics;
pub mod model;
pub mod provider;
pub mod query;
pub mod retry;
pub mod schema;
pub mod server;
pub mod store;
pub mod utils;

pub use config::Opts;
pub use context::{AppContext, Context};
pub use error::{Error, Result};
pub use query::QueryEngine;

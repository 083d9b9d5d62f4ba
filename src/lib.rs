pub mod config;
pub mod error;
pub mod execution;
pub mod extractor;
pub mod gate;
pub mod ledger;
pub mod pricing;
pub mod rollout;
pub mod routes;
mod upstream;
pub mod usage;

pub use routes::{api_routes, app, AppServices};

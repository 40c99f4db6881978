pub mod agent;
pub mod ci;
pub mod config;
pub mod dedup;
pub mod git;
pub mod hosting;
pub mod ledger;
pub mod merge;
pub mod pipeline;
pub mod poller;
pub mod processed;
pub mod sentry;
pub mod types;
pub mod workspace;

pub use types::*;

//! Shared plumbing for the live stream forwarder: configuration, logging
//! and the user-agent policy applied to every upstream request.

pub mod config;
pub mod logging;
pub mod user_agent;

pub use config::Config;
pub use user_agent::UserAgent;

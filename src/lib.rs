pub mod build_log;
pub mod cache;
pub mod config;
pub mod constants;
pub mod context;
pub mod error;
pub mod graph;
pub mod hasher;
pub mod loader;
pub mod logging;
pub mod report;
pub mod rule;
pub mod rules;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod stage;

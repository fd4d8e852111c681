// Shared library for the scrape scheduler and review poller

pub mod bootstrap;
pub mod config;
pub mod db;
pub mod dedup;
pub mod errors;
pub mod lock;
pub mod models;
pub mod persistence;
pub mod poller;
pub mod queue;
pub mod scheduler;
pub mod telemetry;

// Public API - the runner is the entry point the CLI uses
pub mod runner;

// Building blocks, organized by subsystem
mod chunker;
mod config;
mod convert;
mod db;
mod formats;
mod loader;
mod schema;
mod telemetry;

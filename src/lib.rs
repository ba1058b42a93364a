// Library crate for integration tests.
// main.rs has its own mod declarations; this re-exports all modules.

pub mod cache;
pub mod config;
pub mod cpid;
pub mod error;
pub mod gzio;
pub mod locations;
pub mod lock;
pub mod pagedata;
pub mod queue;
pub mod routes;
pub mod server;
pub mod settings;
pub mod state;
pub mod testers;
pub mod testid;

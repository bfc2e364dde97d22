//! Storage Layer
//!
//! Handles all data persistence: the SQLite board store and the JSON config.

pub mod config;
pub mod database;
pub mod task_store;

pub use config::*;
pub use database::*;
pub use task_store::*;

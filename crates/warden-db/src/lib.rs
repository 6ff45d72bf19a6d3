//! PostgreSQL persistence for the device directory.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;

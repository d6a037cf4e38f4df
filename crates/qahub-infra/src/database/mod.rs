//! Postgres persistence for webhook configs and deliveries

pub mod migrations;
pub mod pool;
mod rows;
pub mod store;

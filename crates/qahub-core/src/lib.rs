//! Core types and configuration shared by the qahub webhook services

pub mod clock;
pub mod config;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::*;
pub use types::*;

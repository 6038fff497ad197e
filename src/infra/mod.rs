//! Infrastructure adapters and runtime bootstrap.

pub mod data_service;
pub mod error;
pub mod telemetry;

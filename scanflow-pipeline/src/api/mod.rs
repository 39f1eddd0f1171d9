//! HTTP API for scanflow-pipeline
//!
//! Only a health endpoint: the pipeline's real interface is the broker.

pub mod health;

pub use health::health_routes;

mod annotation;
mod error;
mod ort_service;
mod retention;
mod routes;
mod telemetry;

pub mod app;
pub mod artifacts;
pub mod config;
pub mod detection;
pub mod model_service;
pub mod pipeline;
pub mod server;

pub use app::start_app;
pub use telemetry::Metrics;

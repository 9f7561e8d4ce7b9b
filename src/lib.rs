mod routes;
mod server;

pub mod app;
pub mod bounding_box;
pub mod config;
pub mod normalizer;
pub mod prediction;
pub mod protocol;
pub mod ranking;
pub mod session;
pub mod stroke;
pub mod telemetry;

pub use app::start_app;

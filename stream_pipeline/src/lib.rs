mod font;
mod routes;

pub mod annotate;
pub mod app;
pub mod buffer;
pub mod config;
pub mod frame;
pub mod framing;
pub mod inference;
pub mod pipeline;
pub mod publisher;
pub mod server;
pub mod source;
pub mod stats;
pub mod stream;
pub mod telemetry;

pub use app::start_app;

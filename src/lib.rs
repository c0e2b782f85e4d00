pub mod config;
pub mod context;
pub mod error;
pub mod logging;
pub mod plugin;
pub mod server;
pub mod smtp;

pub use tracing;

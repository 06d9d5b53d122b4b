pub mod config;
pub mod identity;
pub mod logging;

pub use tracing;

pub mod adapters;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod monitor;
pub mod providers;
pub mod server;
pub mod streaming;
pub mod transform;
pub mod upstream;
pub mod usage;

#[cfg(test)]
mod tests;

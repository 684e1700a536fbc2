pub mod cache;
pub mod client;
pub mod core;
pub mod metrics;
pub mod pipelines;
pub mod rate_limiter;
#[cfg(test)]
mod testing;
pub mod types;

pub use self::core::BuildkiteProvider;

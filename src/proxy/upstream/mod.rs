pub mod client;

pub use client::{GenerateBackend, UpstreamClient, UpstreamResponse};

//! Shared HTTP plumbing: the engine-wide client factory and the Netscape
//! cookie file loader.

pub mod client;
pub mod cookies;

pub use client::build_client;

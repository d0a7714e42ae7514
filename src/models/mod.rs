//! Data models for the proxy pool

pub mod instance;
pub mod network;
pub mod rotation;

pub use instance::*;
pub use network::*;
pub use rotation::*;

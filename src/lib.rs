//! Snap Proxy - rotating pool of address-pinned forward proxies
//!
//! Each proxy instance is a local engine process bound to its own IPv6 egress
//! address. The pool reserves those addresses on the host interface, keeps the
//! engines healthy and rotates them onto fresh addresses.
//!
//! ## Features
//!
//! - Collision-free address allocation inside a configured prefix
//! - Simple and graceful (drain then switch) rotation, per instance or as a batch
//! - Interval rotation schedule
//! - Batched privileged interface changes with rollback
//! - JSON persistence of instance descriptors and the selected interface
//! - Authenticated control API with a rotation event stream

pub mod api;
pub mod config;
pub mod error;
pub mod models;
pub mod pool;
pub mod repository;
pub mod services;

pub use config::Config;
pub use error::{Result, SnapError};

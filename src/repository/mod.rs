//! Persistence of proxy descriptors and the selected network interface

pub mod config_store;

pub use config_store::{ConfigStore, JsonConfigStore};

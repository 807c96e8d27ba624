//! oms-core: models, configuration and inventory store for oms
//!
//! Shared by the transport and server crates. Nothing here talks SSH.

pub mod config;
pub mod error;
pub mod models;
pub mod store;

pub use error::{ConfigError, OmsError, StoreError, ValidationError};
pub use store::{Inventory, SqliteStore};

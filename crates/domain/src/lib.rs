//! Shared domain types for the Switchyard gateway.
//!
//! Everything here is plain data: the config tree, the channel message
//! contract, tool/runtime descriptors, the shared error enum, and trace
//! events. No IO, no async.

pub mod channel;
pub mod config;
pub mod error;
pub mod tool;
pub mod trace;

pub use error::{Error, Result};

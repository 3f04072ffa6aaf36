//! Core types, error handling, wire protocol, and configuration shared by
//! every other crate in the orchestration server.

pub mod config;
pub mod error;
pub mod protocol;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use protocol::*;
pub use types::*;

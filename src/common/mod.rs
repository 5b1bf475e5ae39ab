//! Common utilities shared by the runner and its workers

pub mod config;
pub mod error;
pub mod logging;
pub mod paths;

pub use error::{Error, RemoteError, Result};

//! shroud-core: Core abstractions and configuration for shroud
//!
//! This crate provides the error taxonomy, configuration structures and the
//! physical connection trait shared by the multiplexer and its callers.

pub mod config;
pub mod error;
pub mod traits;

pub use config::{MuxConfig, ValveConfig};
pub use error::{ConfigError, SessionError, ShroudError, StreamError};
pub use traits::Connection;

//! layerfs - union filesystem over two directories plus an in-memory layer
//!
//! Lookups consult a primary directory first and a fallback directory second.
//! Files and directories created through the mount live in memory for the
//! lifetime of the mount and never reach either backing directory.

pub mod config;
pub mod error;
pub mod fs;

pub use config::Config;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::fs::overlay::{Dispatcher, Passthrough, Resolution};
    pub use crate::fs::OverlayFs;
}

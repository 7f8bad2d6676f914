//! Aggregates the `quicmux` workspace into a single dependency.

pub use quicmux_config as config;
pub use quicmux_core::*;

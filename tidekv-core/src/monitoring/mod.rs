//! Logging bootstrap and server introspection

pub mod info;
pub mod logging;

pub use info::*;
pub use logging::*;

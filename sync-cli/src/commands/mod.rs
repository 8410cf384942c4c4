//! CLI command implementations.

pub mod demo;
pub mod resolve;
pub mod room;
pub mod settings;
pub mod status;

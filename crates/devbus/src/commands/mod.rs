//! Command handlers: bridge CLI args to the runtime crates and output
//! formatting.

pub mod config_cmd;
pub mod prop;
pub mod resolve;

//! CLI command modules.

pub mod http;
pub mod reload;
pub mod status;

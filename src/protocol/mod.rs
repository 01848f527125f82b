//! JSON-RPC 2.0 envelope types

mod messages;

pub use messages::*;

/// JSON-RPC version carried in every envelope
pub const JSONRPC_VERSION: &str = "2.0";

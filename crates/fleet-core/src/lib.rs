//! Shared types and error taxonomy for the mcp-fleet workspace.

pub mod error;
pub mod types;

pub use error::{ErrorKind, FleetError, detect_missing_dependency};
pub use types::{
    ConnectionSnapshot, ConnectionState, RecordedError, ServerState, ToolDescriptor,
    qualify_tool_name, split_tool_name, tool_list_digest,
};

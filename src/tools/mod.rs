//! Tools: stateless capabilities invoked directly by name.

pub mod builtin;
pub mod registry;
pub mod tool;

pub use registry::ToolRegistry;
pub use tool::{Tool, ToolDefinition, optional_i64, require_str};

//! Built-in tools available to every registry.

mod echo;
mod time;

use std::sync::Arc;

pub use echo::EchoTool;
pub use time::TimeTool;

use crate::tools::ToolRegistry;

/// Register the built-in tools.
pub fn register_builtins(registry: &ToolRegistry) {
    registry.register_sync(Arc::new(EchoTool));
    registry.register_sync(Arc::new(TimeTool));
}

pub mod handler;
pub mod registry;

pub use handler::{ToolDef, ToolExecutor};
pub use registry::ToolRegistry;

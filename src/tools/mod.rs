//! Tool registry, parameter validation, and project-scoped dispatch.

pub mod database;
pub mod http;
pub mod registry;
pub mod system_info;

pub use registry::{dispatch, DataSourceRequirement, SideEffectClass, Tool, ToolExecutionContext, ToolRegistry};

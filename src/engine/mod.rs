// Execution Engine
//
// Consumes continuation events from the broker and advances each
// execution by exactly one node per event.

pub mod executor;
pub mod registry;
pub mod template;

pub use executor::ExecutionEngine;
pub use registry::{HandlerContext, HandlerRegistry, HandlerResult, NodeHandler};
pub use template::resolve_parameters;

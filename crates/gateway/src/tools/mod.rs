//! Tool surface: the router, native tools, and the async-exec tracker.

pub mod exec;
pub mod native;
pub mod router;

pub use router::{CallRoute, InvokeOutcome, ToolRouter};

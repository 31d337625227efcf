//! Application-level orchestration.
//!
//! This module owns the worker and session lifecycles as the host application sees
//! them (start on launch, one aggregation at a time, stop on every exit path) and
//! post-session processing such as summaries and exports. CLI layers call into
//! this module to keep responsibilities separated.

mod controller;
mod post_process;
mod session_task;

pub use controller::{AppCommand, AppEvent, Controller};
pub use post_process::{export_json, summarize};
pub(crate) use post_process::summarize_parts;
pub use session_task::{run_session, Readiness};

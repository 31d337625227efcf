pub mod cli;
pub mod client;
pub mod error;
pub mod logging;
pub mod model;
pub mod orchestrator;
pub mod session;
pub mod supervisor;
mod text_summary;

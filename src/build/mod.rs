//! Per-build state: the context threaded through the pipeline and its log sink.

pub mod context;
pub mod log;

pub use context::{BuildContext, BuildOptions};
pub use log::BuildLog;

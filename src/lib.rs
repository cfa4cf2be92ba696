//! stationiso library exports.
//!
//! The binary in `main.rs` is a thin CLI over these modules; integration
//! tests drive the pipeline through them with a fake host.

pub mod backup;
pub mod build;
pub mod cache;
pub mod clean;
pub mod common;
pub mod component;
pub mod config;
pub mod error;
pub mod host;
pub mod image;
pub mod installer;
pub mod interrupt;
pub mod manifest;
pub mod pipeline;
pub mod preflight;
pub mod preseed;
pub mod process;
pub mod release;
pub mod repack;
pub mod station;
pub mod timing;

pub use error::{BuildError, Result};

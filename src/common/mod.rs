//! Shared utilities across stationiso modules.

pub mod files;

pub use files::{copy_tree, join_under, write_file_mode, write_file_with_dirs};

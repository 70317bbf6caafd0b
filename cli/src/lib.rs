//! imagemerge CLI - merge container images into one.

pub mod commands;
pub mod output;

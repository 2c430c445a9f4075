//! Tracks what you are working on. A daemon periodically captures the screens, has a local
//! vision model describe them and a text model classify the description into one of your own
//! activity types, then appends the result to a per-day log that the cli can report on.

pub mod cli;
pub mod config;
pub mod daemon;
pub mod environment;
pub mod fs;
pub mod inference;
pub mod pipeline;
pub mod storage;
pub mod taxonomy;
pub mod utils;

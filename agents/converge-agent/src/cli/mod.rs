//! CLI support module
//!
//! Configuration loading and logging setup for the agent binary.

pub mod config;
pub mod logging;

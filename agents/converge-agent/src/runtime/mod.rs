//! Runtime module
//!
//! This module provides local execution primitives: the CommandRunner
//! trait with its process implementation, output chunking, and policy
//! archive extraction.

pub mod adapter;
pub mod archive;
pub mod chunker;
pub mod process;

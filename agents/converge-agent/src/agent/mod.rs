//! Agent module
//!
//! This module contains the synchronization cycle and everything that drives
//! it: cycle state, the filesystem synchronizer, output reporting, the
//! scheduler and process lifecycle handling.

pub mod cycle;
pub mod lifecycle;
pub mod model;
pub mod reporter;
pub mod scheduler;
pub mod state;
pub mod sync;

//! Connection module
//!
//! This module handles all communication with the control service,
//! including the HTTP client, document types and the retry policy.

pub mod client;
pub mod protocol;
pub mod retry;

//! Reliability patterns shared by the broker and the workflow engine
//!
//! This module provides:
//! - [`RetryPolicy`] - Configurable retry with exponential backoff

mod retry;

pub use retry::RetryPolicy;

//! # Utility Modules
//!
//! Supporting utilities for logging, metrics and timing.
//!
//! ## Components
//! - **Logging**: `tracing-subscriber` setup for embedding applications
//! - **Metrics**: per-instance atomic counters
//! - **Timeout**: async timeout wrappers and default bounds

pub mod logging;
pub mod metrics;
pub mod timeout;

pub use metrics::{Metrics, MetricsSnapshot};

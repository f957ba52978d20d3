//! # Utility Modules
//!
//! Supporting utilities shared by every layer.
//!
//! ## Components
//! - **Logging**: tracing-subscriber setup driven by [`LoggingConfig`](crate::config::LoggingConfig)
//! - **Metrics**: Thread-safe observability counters
//! - **Timeout**: Deadline wrapper mapping expiry to `ProtocolError::Timeout`

pub mod logging;
pub mod metrics;
pub mod timeout;

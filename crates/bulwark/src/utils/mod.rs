//! Common utility functions
//!
//! - **[`serde`]**: serialization helpers for durations

pub mod serde;

// Re-export commonly used items for convenience
pub use self::serde::{duration_millis, duration_str, format_duration, parse_duration};

//! Prelude module - commonly used types for convenient import.

pub use crate::{
    FileRotation, LogConfig, LogFormat, LogTarget, TelemetryError, TelemetryResult,
    setup_default_logging, setup_logging,
};

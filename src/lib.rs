// src/lib.rs
pub mod codec;
pub mod config;
pub mod consumers;
pub mod container;
pub mod coordinator;
pub mod core;
pub mod events;
pub mod recorder;
pub mod retention;
pub mod rtsp;
pub mod testing;

// Re-export the most used types
pub use config::Config;
pub use coordinator::{Coordinator, CoordinatorHandle, RunReport, StopReason};
pub use crate::core::timestamp::utc_ns_now;
pub use crate::core::{Component, ComponentLogger, LogContext, StopSignal};
pub use events::{CleanStatus, CleanedRecord, RecognizedRecord, SegmentRecord};

pub mod error;
pub mod lock;
pub mod logging;
pub mod shutdown;
pub mod timestamp;

pub use error::{ConfigError, MuxError, RtspError};
pub use logging::{ComponentLogger, LogContext};
pub use shutdown::StopSignal;
pub use timestamp::*;

/// Capability set shared by every long-running part of the pipeline.
///
/// `start` must return only after the component is ready to accept input;
/// `stop` must return only after its worker has fully exited.
pub trait Component: Send {
    fn name(&self) -> &str;
    fn start(&mut self) -> anyhow::Result<()>;
    fn stop(&mut self) -> anyhow::Result<()>;
}

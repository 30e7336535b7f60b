//! Frame sources: the hardware bus reader and the drive-cycle simulator.
//!
//! Both implement [`FrameSource`], a blocking read bounded by a timeout, so the
//! capture loop never branches on which one is active.

pub mod catalog;
pub mod clock;
pub mod frame;
pub mod hardware;
pub mod simulator;
#[cfg(all(target_os = "linux", feature = "hardware-socketcan"))]
pub mod socketcan;
pub mod stats;

use std::time::Duration;
use thiserror::Error;

pub use clock::CaptureClock;
pub use frame::CanFrame;
pub use hardware::{BusDriver, BusHandle, BusSettings, FrameFilter, HardwareSource, OpenPolicy};
pub use simulator::SimulatedSource;
pub use stats::{SharedSourceStats, SourceStats, SourceStatsSnapshot};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to open bus on '{interface}': {reason}")]
    Open { interface: String, reason: String },

    #[error("source is closed")]
    Closed,
}

/// Result of one bounded read.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome {
    Frame(CanFrame),
    /// Nothing arrived before the timeout elapsed.
    Timeout,
    /// The source will never produce another frame (finite simulations).
    EndOfStream,
}

/// Blocking read with timeout, bounded by a bus handle lifecycle.
pub trait FrameSource: Send {
    /// Wait at most `timeout` for the next frame.
    ///
    /// Transient bus trouble is handled inside the source; an `Err` means the
    /// source cannot be used any more.
    fn read(&mut self, timeout: Duration) -> Result<ReadOutcome, SourceError>;

    /// Release the bus handle. Reads after `close` return [`SourceError::Closed`].
    fn close(&mut self);

    /// Counters shared with the health monitor.
    fn stats(&self) -> SharedSourceStats;

    /// Human-readable description used in logs.
    fn describe(&self) -> String;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn read(&mut self, timeout: Duration) -> Result<ReadOutcome, SourceError> {
        (**self).read(timeout)
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn stats(&self) -> SharedSourceStats {
        (**self).stats()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

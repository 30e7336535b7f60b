use super::frame::{CanFrame, MAX_ARBITRATION_ID};
use super::stats::SharedSourceStats;
use super::{CaptureClock, FrameSource, ReadOutcome, SourceError};
use crate::backoff::Backoff;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Extended-frame-format flag carried in kernel CAN ids and masks (`CAN_EFF_FLAG`).
pub const CAN_EFF_FLAG: u32 = 0x8000_0000;

/// Acceptance filter installed on the bus handle: a frame passes when
/// `frame_id & mask == id & mask` and its id format (11-bit or 29-bit)
/// matches `extended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameFilter {
    pub id: u32,
    pub mask: u32,
    #[serde(default)]
    pub extended: bool,
}

impl FrameFilter {
    /// `(can_id, can_mask)` for a kernel filter. The EFF flag is always in
    /// the mask, so a standard filter never accepts extended frames and the
    /// other way round.
    pub fn kernel_id_mask(&self) -> (u32, u32) {
        let format = if self.extended { CAN_EFF_FLAG } else { 0 };
        (self.id | format, self.mask | CAN_EFF_FLAG)
    }

    /// Same decision the kernel makes for a frame with this id and format.
    pub fn matches(&self, arbitration_id: u32, extended: bool) -> bool {
        let (id, mask) = self.kernel_id_mask();
        let raw = arbitration_id | if extended { CAN_EFF_FLAG } else { 0 };
        raw & mask == id & mask
    }

    pub fn is_valid(&self) -> bool {
        let limit = if self.extended { MAX_ARBITRATION_ID } else { 0x7FF };
        self.id <= limit && self.mask <= limit
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusSettings {
    pub interface: String,
    pub bitrate: u32,
    pub fd: bool,
    pub filters: Vec<FrameFilter>,
}

/// A frame as delivered by the driver, before it is stamped and attributed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub arbitration_id: u32,
    pub data_length_code: u8,
    pub payload: Vec<u8>,
    pub is_error_frame: bool,
}

#[derive(Debug, Error)]
pub enum BusError {
    /// The link is gone (bus-off, device removed). The handle must be reopened.
    #[error("bus link error: {0}")]
    Link(String),

    /// One bad read (malformed frame, parity glitch). The handle stays usable.
    #[error("frame read error: {0}")]
    Frame(String),
}

/// An open bus handle.
pub trait BusHandle: Send {
    /// Wait at most `timeout` for a frame; `Ok(None)` means the wait expired.
    fn recv(&mut self, timeout: Duration) -> Result<Option<RawFrame>, BusError>;

    fn close(&mut self) {}
}

/// Opens bus handles. Implemented by the SocketCAN driver and by test fakes.
pub trait BusDriver: Send {
    /// Open the interface and install `settings.filters` on the new handle.
    fn open(&mut self, settings: &BusSettings) -> Result<Box<dyn BusHandle>, BusError>;
}

/// What to do when the very first open fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenPolicy {
    /// Fail immediately. Used by dry-run to validate wiring.
    Strict,
    /// Enter the reconnect loop. Used by unattended capture.
    Retry,
}

/// Link state of the hardware reader. There is no terminal
/// failure state: reconnection is retried forever.
enum LinkState {
    Connected(Box<dyn BusHandle>),
    Reconnecting { attempt: u32, next_attempt_at: Instant },
    Closed,
}

pub struct HardwareSource {
    driver: Box<dyn BusDriver>,
    settings: BusSettings,
    reconnect: Backoff,
    state: LinkState,
    stats: SharedSourceStats,
    clock: CaptureClock,
    vehicle_id: Arc<str>,
}

impl HardwareSource {
    pub fn open(
        mut driver: Box<dyn BusDriver>,
        settings: BusSettings,
        reconnect: Backoff,
        policy: OpenPolicy,
        stats: SharedSourceStats,
        clock: CaptureClock,
        vehicle_id: Arc<str>,
    ) -> Result<Self, SourceError> {
        info!(
            interface = %settings.interface,
            bitrate = settings.bitrate,
            fd = settings.fd,
            filters = settings.filters.len(),
            "Opening CAN bus"
        );

        let state = match driver.open(&settings) {
            Ok(handle) => {
                stats.set_connected(true);
                info!(interface = %settings.interface, "Connected to CAN bus");
                LinkState::Connected(handle)
            }
            Err(e) => match policy {
                OpenPolicy::Strict => {
                    return Err(SourceError::Open {
                        interface: settings.interface.clone(),
                        reason: e.to_string(),
                    });
                }
                OpenPolicy::Retry => {
                    let delay = reconnect.delay(1);
                    warn!(
                        interface = %settings.interface,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Initial bus open failed, will keep retrying"
                    );
                    LinkState::Reconnecting {
                        attempt: 1,
                        next_attempt_at: Instant::now() + delay,
                    }
                }
            },
        };

        Ok(Self {
            driver,
            settings,
            reconnect,
            state,
            stats,
            clock,
            vehicle_id,
        })
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, LinkState::Connected(_))
    }

    /// Current reconnect attempt, if the link is down.
    pub fn reconnect_attempt(&self) -> Option<u32> {
        match self.state {
            LinkState::Reconnecting { attempt, .. } => Some(attempt),
            _ => None,
        }
    }

    fn enter_reconnect(&mut self, attempt: u32) {
        if let LinkState::Connected(handle) = &mut self.state {
            handle.close();
        }
        self.stats.set_connected(false);
        let delay = self.reconnect.delay(attempt);
        warn!(
            interface = %self.settings.interface,
            attempt,
            retry_in_ms = delay.as_millis() as u64,
            "CAN link down, reconnecting"
        );
        self.state = LinkState::Reconnecting {
            attempt,
            next_attempt_at: Instant::now() + delay,
        };
    }

    fn try_reconnect(&mut self, attempt: u32) {
        match self.driver.open(&self.settings) {
            Ok(handle) => {
                self.stats.record_reconnect();
                self.stats.set_connected(true);
                info!(
                    interface = %self.settings.interface,
                    attempts = attempt,
                    "Reconnected to CAN bus"
                );
                self.state = LinkState::Connected(handle);
            }
            Err(e) => {
                debug!(interface = %self.settings.interface, error = %e, "Reconnect attempt failed");
                self.enter_reconnect(attempt.saturating_add(1));
            }
        }
    }

    fn stamp(&self, raw: RawFrame) -> CanFrame {
        CanFrame::new(
            self.clock.now_ns(),
            raw.arbitration_id,
            raw.data_length_code,
            raw.payload,
            Arc::clone(&self.vehicle_id),
        )
    }
}

impl FrameSource for HardwareSource {
    fn read(&mut self, timeout: Duration) -> Result<ReadOutcome, SourceError> {
        let deadline = Instant::now() + timeout;

        loop {
            let now = Instant::now();
            if now >= deadline && !matches!(self.state, LinkState::Connected(_)) {
                return Ok(ReadOutcome::Timeout);
            }
            let remaining = deadline.saturating_duration_since(now);

            match &mut self.state {
                LinkState::Closed => return Err(SourceError::Closed),
                LinkState::Reconnecting {
                    attempt,
                    next_attempt_at,
                } => {
                    let attempt = *attempt;
                    if now < *next_attempt_at {
                        let wait = next_attempt_at.saturating_duration_since(now).min(remaining);
                        std::thread::sleep(wait);
                        continue;
                    }
                    self.try_reconnect(attempt);
                }
                LinkState::Connected(handle) => match handle.recv(remaining) {
                    Ok(Some(raw)) if raw.is_error_frame => {
                        self.stats.record_bus_error();
                        debug!(arbitration_id = raw.arbitration_id, "Error frame on bus");
                        if Instant::now() >= deadline {
                            return Ok(ReadOutcome::Timeout);
                        }
                    }
                    Ok(Some(raw)) => {
                        self.stats.record_frame();
                        return Ok(ReadOutcome::Frame(self.stamp(raw)));
                    }
                    Ok(None) => return Ok(ReadOutcome::Timeout),
                    Err(BusError::Frame(reason)) => {
                        self.stats.record_read_error();
                        debug!(reason = %reason, "Skipping unreadable frame");
                        if Instant::now() >= deadline {
                            return Ok(ReadOutcome::Timeout);
                        }
                    }
                    Err(BusError::Link(reason)) => {
                        self.stats.record_bus_error();
                        error!(interface = %self.settings.interface, reason = %reason, "CAN bus-off or device lost");
                        self.enter_reconnect(1);
                    }
                },
            }
        }
    }

    fn close(&mut self) {
        if let LinkState::Connected(handle) = &mut self.state {
            handle.close();
            info!(interface = %self.settings.interface, "CAN bus closed");
        }
        self.stats.set_connected(false);
        self.state = LinkState::Closed;
    }

    fn stats(&self) -> SharedSourceStats {
        Arc::clone(&self.stats)
    }

    fn describe(&self) -> String {
        format!(
            "can:{}@{}{}",
            self.settings.interface,
            self.settings.bitrate,
            if self.settings.fd { " fd" } else { "" }
        )
    }
}

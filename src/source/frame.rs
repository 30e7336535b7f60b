use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;

/// Largest arbitration id an extended (29-bit) CAN identifier can carry.
pub const MAX_ARBITRATION_ID: u32 = 0x1FFF_FFFF;

/// Classic CAN payload ceiling.
pub const CLASSIC_MAX_DLC: u8 = 8;

/// CAN-FD payload ceiling.
pub const FD_MAX_DLC: u8 = 64;

/// One CAN bus event as captured by a frame source.
///
/// Frames are immutable once produced. The payload is stored exactly as it
/// came off the bus, even when its length disagrees with `data_length_code`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanFrame {
    /// Capture instant in UNIX nanoseconds (see [`super::clock::CaptureClock`]).
    pub timestamp_ns: i64,
    pub arbitration_id: u32,
    pub data_length_code: u8,
    pub payload: Vec<u8>,
    /// Capturing device. Shared across all frames of a session.
    pub vehicle_id: Arc<str>,
}

impl CanFrame {
    pub fn new(
        timestamp_ns: i64,
        arbitration_id: u32,
        data_length_code: u8,
        payload: Vec<u8>,
        vehicle_id: Arc<str>,
    ) -> Self {
        Self {
            timestamp_ns,
            arbitration_id,
            data_length_code,
            payload,
            vehicle_id,
        }
    }

    /// Capture instant as a calendar timestamp.
    pub fn captured_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(self.timestamp_ns)
    }

    /// True when the declared length code and the payload length agree.
    ///
    /// Informational only; mismatched frames are still recorded.
    pub fn length_consistent(&self) -> bool {
        self.payload.len() == self.data_length_code as usize
    }

    pub fn payload_hex(&self) -> String {
        self.payload.iter().map(|b| format!("{:02X}", b)).collect()
    }
}

impl fmt::Display for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.arbitration_id > 0x7FF {
            write!(f, "0x{:08X}", self.arbitration_id)?;
        } else {
            write!(f, "0x{:03X}", self.arbitration_id)?;
        }
        write!(f, " [{}] {}", self.data_length_code, self.payload_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(id: u32, dlc: u8, payload: Vec<u8>) -> CanFrame {
        CanFrame::new(1_700_000_000_000_000_000, id, dlc, payload, Arc::from("veh-1"))
    }

    #[test]
    fn test_display_standard_and_extended_ids() {
        assert_eq!(frame(0x1A0, 2, vec![0xDE, 0xAD]).to_string(), "0x1A0 [2] DEAD");
        assert_eq!(
            frame(0x18FEF100, 1, vec![0x01]).to_string(),
            "0x18FEF100 [1] 01"
        );
    }

    #[test]
    fn test_length_mismatch_is_reported_not_rejected() {
        let f = frame(0x100, 8, vec![1, 2, 3]);
        assert!(!f.length_consistent());
        assert_eq!(f.payload.len(), 3);
    }

    #[test]
    fn test_captured_at() {
        let f = frame(0x100, 0, vec![]);
        assert_eq!(f.captured_at().timestamp(), 1_700_000_000);
    }
}

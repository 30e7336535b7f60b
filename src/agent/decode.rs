use crate::source::catalog::{self, DecodedSignal};
use crate::source::CanFrame;

/// Turns raw frames into physical signal values for decode-live mode.
pub trait FrameDecoder: Send {
    /// `None` when the arbitration id is unknown to this decoder.
    fn decode(&self, frame: &CanFrame) -> Option<Vec<DecodedSignal>>;

    fn name(&self) -> &str;
}

/// Decoder for the built-in message catalog, the same one the simulator packs.
#[derive(Debug, Default, Clone, Copy)]
pub struct CatalogDecoder;

impl FrameDecoder for CatalogDecoder {
    fn decode(&self, frame: &CanFrame) -> Option<Vec<DecodedSignal>> {
        catalog::decode(frame.arbitration_id, &frame.payload)
    }

    fn name(&self) -> &str {
        "built-in catalog"
    }
}

/// `[12:00:01.250] VehicleSpeed.speed = 42.5 km/h`
pub fn format_signal(frame: &CanFrame, signal: &DecodedSignal) -> String {
    let line = format!(
        "[{}] {}.{} = {}",
        frame.captured_at().format("%H:%M:%S%.3f"),
        signal.message,
        signal.name,
        signal.value
    );
    if signal.unit.is_empty() {
        line
    } else {
        format!("{} {}", line, signal.unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::catalog::{VehicleState, VEHICLE_SPEED_ID};
    use std::sync::Arc;

    #[test]
    fn test_catalog_decoder_round_trips_simulator_frames() {
        let state = VehicleState {
            speed_kph: 42.5,
            ..VehicleState::default()
        };
        let payload = catalog::encode(VEHICLE_SPEED_ID, &state).unwrap().to_vec();
        let frame = CanFrame::new(0, VEHICLE_SPEED_ID, 8, payload, Arc::from("v"));

        let signals = CatalogDecoder.decode(&frame).unwrap();
        let speed = signals.iter().find(|s| s.message == "VehicleSpeed").unwrap();
        assert!((speed.value - 42.5).abs() < 0.1, "{:?}", speed);
        assert!(format_signal(&frame, speed).starts_with("[00:00:00.000] VehicleSpeed."));
    }

    #[test]
    fn test_unknown_id_is_not_decoded() {
        let frame = CanFrame::new(0, 0x7FF, 2, vec![1, 2], Arc::from("v"));
        assert!(CatalogDecoder.decode(&frame).is_none());
    }
}

//! Built-in message catalog shared by the simulator (encode) and the
//! decode-live collaborator (decode).
//!
//! All signals are little-endian, classic 8-byte frames, unused bytes zero.

use serde::Serialize;

pub const ENGINE_STATUS_ID: u32 = 0x0C0;
pub const VEHICLE_SPEED_ID: u32 = 0x1A0;
pub const BATTERY_STATUS_ID: u32 = 0x3B0;

/// Identifiers in emission order.
pub const MESSAGE_IDS: [u32; 3] = [ENGINE_STATUS_ID, VEHICLE_SPEED_ID, BATTERY_STATUS_ID];

/// Physical vehicle state from which every catalog message is packed.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct VehicleState {
    pub engine_rpm: f64,
    pub coolant_temp_c: f64,
    pub throttle_pct: f64,
    pub speed_kph: f64,
    pub phase_code: u8,
    pub soc_pct: f64,
    pub pack_voltage_v: f64,
    pub pack_current_a: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodedSignal {
    pub message: &'static str,
    pub name: &'static str,
    pub value: f64,
    pub unit: &'static str,
}

pub fn message_name(arbitration_id: u32) -> Option<&'static str> {
    match arbitration_id {
        ENGINE_STATUS_ID => Some("EngineStatus"),
        VEHICLE_SPEED_ID => Some("VehicleSpeed"),
        BATTERY_STATUS_ID => Some("BatteryStatus"),
        _ => None,
    }
}

fn scaled_u16(value: f64, resolution: f64) -> [u8; 2] {
    let raw = (value / resolution).round().clamp(0.0, u16::MAX as f64) as u16;
    raw.to_le_bytes()
}

fn scaled_i16(value: f64, resolution: f64) -> [u8; 2] {
    let raw = (value / resolution)
        .round()
        .clamp(i16::MIN as f64, i16::MAX as f64) as i16;
    raw.to_le_bytes()
}

/// Pack the catalog message `arbitration_id` from `state`.
pub fn encode(arbitration_id: u32, state: &VehicleState) -> Option<[u8; 8]> {
    let mut data = [0u8; 8];
    match arbitration_id {
        ENGINE_STATUS_ID => {
            data[0..2].copy_from_slice(&scaled_u16(state.engine_rpm, 0.25));
            data[2] = (state.coolant_temp_c + 40.0).round().clamp(0.0, 255.0) as u8;
            data[3] = (state.throttle_pct / 0.5).round().clamp(0.0, 200.0) as u8;
        }
        VEHICLE_SPEED_ID => {
            data[0..2].copy_from_slice(&scaled_u16(state.speed_kph, 0.01));
            data[2] = state.phase_code;
        }
        BATTERY_STATUS_ID => {
            data[0..2].copy_from_slice(&scaled_u16(state.soc_pct, 0.01));
            data[2..4].copy_from_slice(&scaled_u16(state.pack_voltage_v, 0.1));
            data[4..6].copy_from_slice(&scaled_i16(state.pack_current_a, 0.1));
        }
        _ => return None,
    }
    Some(data)
}

fn u16_at(payload: &[u8], offset: usize) -> Option<u16> {
    Some(u16::from_le_bytes([*payload.get(offset)?, *payload.get(offset + 1)?]))
}

fn i16_at(payload: &[u8], offset: usize) -> Option<i16> {
    Some(i16::from_le_bytes([*payload.get(offset)?, *payload.get(offset + 1)?]))
}

/// Unpack a catalog message. `None` for unknown ids or short payloads.
pub fn decode(arbitration_id: u32, payload: &[u8]) -> Option<Vec<DecodedSignal>> {
    let message = message_name(arbitration_id)?;
    let signal = |name, value, unit| DecodedSignal {
        message,
        name,
        value,
        unit,
    };

    let signals = match arbitration_id {
        ENGINE_STATUS_ID => vec![
            signal("EngineRPM", u16_at(payload, 0)? as f64 * 0.25, "rpm"),
            signal("CoolantTemp", *payload.get(2)? as f64 - 40.0, "degC"),
            signal("ThrottlePosition", *payload.get(3)? as f64 * 0.5, "%"),
        ],
        VEHICLE_SPEED_ID => vec![
            signal("VehicleSpeed", u16_at(payload, 0)? as f64 * 0.01, "km/h"),
            signal("DrivePhase", *payload.get(2)? as f64, ""),
        ],
        BATTERY_STATUS_ID => vec![
            signal("StateOfCharge", u16_at(payload, 0)? as f64 * 0.01, "%"),
            signal("PackVoltage", u16_at(payload, 2)? as f64 * 0.1, "V"),
            signal("PackCurrent", i16_at(payload, 4)? as f64 * 0.1, "A"),
        ],
        _ => return None,
    };
    Some(signals)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> VehicleState {
        VehicleState {
            engine_rpm: 2150.25,
            coolant_temp_c: 87.0,
            throttle_pct: 22.5,
            speed_kph: 98.76,
            phase_code: 2,
            soc_pct: 81.23,
            pack_voltage_v: 388.4,
            pack_current_a: -42.5,
        }
    }

    fn value(signals: &[DecodedSignal], name: &str) -> f64 {
        signals.iter().find(|s| s.name == name).unwrap().value
    }

    #[test]
    fn test_engine_status_layout() {
        let data = encode(ENGINE_STATUS_ID, &sample_state()).unwrap();
        assert_eq!(u16::from_le_bytes([data[0], data[1]]), 8601);
        assert_eq!(data[2], 127);
        assert_eq!(data[3], 45);
        assert_eq!(&data[4..], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_battery_decode_recovers_signed_current() {
        let data = encode(BATTERY_STATUS_ID, &sample_state()).unwrap();
        let signals = decode(BATTERY_STATUS_ID, &data).unwrap();
        assert!((value(&signals, "PackCurrent") + 42.5).abs() < 0.05);
        assert!((value(&signals, "PackVoltage") - 388.4).abs() < 0.05);
        assert!((value(&signals, "StateOfCharge") - 81.23).abs() < 0.005);
    }

    #[test]
    fn test_unknown_and_short_frames() {
        assert!(encode(0x7FF, &sample_state()).is_none());
        assert!(decode(0x7FF, &[0; 8]).is_none());
        assert!(decode(VEHICLE_SPEED_ID, &[0x10]).is_none());
    }

    #[test]
    fn test_out_of_range_values_saturate() {
        let state = VehicleState {
            engine_rpm: -100.0,
            speed_kph: 1.0e9,
            ..VehicleState::default()
        };
        let engine = encode(ENGINE_STATUS_ID, &state).unwrap();
        assert_eq!(&engine[0..2], &[0, 0]);
        let speed = encode(VEHICLE_SPEED_ID, &state).unwrap();
        assert_eq!(&speed[0..2], &[0xFF, 0xFF]);
    }
}

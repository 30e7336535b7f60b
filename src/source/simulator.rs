use super::catalog::{self, VehicleState, MESSAGE_IDS};
use super::frame::CanFrame;
use super::stats::SharedSourceStats;
use super::{CaptureClock, FrameSource, ReadOutcome, SourceError};
use crate::config::types::{DrivePhase, PhaseSpan, SimulationConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::PI;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

const CRUISE_SPEED_KPH: f64 = 100.0;
const IDLE_RPM: f64 = 800.0;

/// Signal-driven frame source with no bus handle.
///
/// Frame `k` is always message `MESSAGE_IDS[k % 3]` generated at simulated
/// time `k / frame_rate_hz`, with noise drawn from an RNG seeded by the
/// config, so a seed reproduces the exact payload sequence. Frames are paced
/// against the wall clock and obey the same read/timeout contract as the
/// hardware reader.
pub struct SimulatedSource {
    cycle: Vec<PhaseSpan>,
    cycle_secs: f64,
    frame_rate_hz: f64,
    run_for: Option<Duration>,
    rng: StdRng,
    emitted: u64,
    started: Instant,
    closed: bool,
    finished_logged: bool,
    stats: SharedSourceStats,
    clock: CaptureClock,
    vehicle_id: Arc<str>,
}

impl SimulatedSource {
    pub fn new(
        config: &SimulationConfig,
        stats: SharedSourceStats,
        clock: CaptureClock,
        vehicle_id: Arc<str>,
    ) -> Self {
        let cycle = if config.cycle.is_empty() {
            SimulationConfig::default_cycle()
        } else {
            config.cycle.clone()
        };
        let cycle_secs = cycle
            .iter()
            .map(|span| span.duration.as_secs_f64())
            .sum::<f64>()
            .max(f64::EPSILON);

        info!(
            frame_rate_hz = config.frame_rate_hz,
            seed = config.seed,
            phases = cycle.len(),
            cycle_secs,
            "Initializing simulated CAN source"
        );
        stats.set_connected(true);

        Self {
            cycle,
            cycle_secs,
            frame_rate_hz: config.frame_rate_hz.max(1) as f64,
            run_for: config.duration,
            rng: StdRng::seed_from_u64(config.seed),
            emitted: 0,
            started: Instant::now(),
            closed: false,
            finished_logged: false,
            stats,
            clock,
            vehicle_id,
        }
    }

    pub fn frames_emitted(&self) -> u64 {
        self.emitted
    }

    /// Simulated seconds at which frame `k` is due.
    fn sim_time(&self, k: u64) -> f64 {
        k as f64 / self.frame_rate_hz
    }

    fn phase_at(&self, t: f64) -> (DrivePhase, f64) {
        let mut offset = t % self.cycle_secs;
        for span in &self.cycle {
            let len = span.duration.as_secs_f64();
            if offset < len {
                return (span.phase, if len > 0.0 { offset / len } else { 0.0 });
            }
            offset -= len;
        }
        (DrivePhase::Idle, 0.0)
    }

    fn noise(&mut self, amplitude: f64) -> f64 {
        if amplitude <= 0.0 {
            return 0.0;
        }
        self.rng.gen_range(-amplitude..amplitude)
    }

    /// Physically plausible state at simulated time `t`.
    pub fn state_at(&mut self, t: f64) -> VehicleState {
        let (phase, progress) = self.phase_at(t);

        let (speed, throttle, current): (f64, f64, f64) = match phase {
            DrivePhase::Idle => (0.0, 0.0, 4.0),
            DrivePhase::Acceleration => (CRUISE_SPEED_KPH * progress, 55.0, 180.0),
            DrivePhase::Cruise => (
                CRUISE_SPEED_KPH + 3.0 * (2.0 * PI * t / 30.0).sin(),
                18.0,
                60.0,
            ),
            DrivePhase::Deceleration => (CRUISE_SPEED_KPH * (1.0 - progress), 0.0, -45.0),
        };

        let speed_kph = (speed + self.noise(0.5)).max(0.0);
        let throttle_pct = (throttle + self.noise(1.0)).clamp(0.0, 100.0);
        let engine_rpm = (IDLE_RPM + speed_kph * 22.0 + throttle_pct * 10.0 + self.noise(25.0))
            .clamp(0.0, 8000.0);
        let coolant_temp_c = 20.0 + 70.0 * (t / 300.0).tanh() + self.noise(0.4);
        let soc_pct = (95.0 - t / 360.0).max(5.0);
        let pack_current_a = current + self.noise(current.abs() * 0.05);
        let pack_voltage_v = 350.0 + soc_pct * 0.5 - pack_current_a * 0.05 + self.noise(0.3);

        VehicleState {
            engine_rpm,
            coolant_temp_c,
            throttle_pct,
            speed_kph,
            phase_code: phase.code(),
            soc_pct,
            pack_voltage_v,
            pack_current_a,
        }
    }

    fn next_frame(&mut self) -> CanFrame {
        let k = self.emitted;
        let t = self.sim_time(k);
        let arbitration_id = MESSAGE_IDS[(k % MESSAGE_IDS.len() as u64) as usize];
        let state = self.state_at(t);
        let payload = catalog::encode(arbitration_id, &state)
            .map(|data| data.to_vec())
            .unwrap_or_default();

        self.emitted += 1;
        if self.emitted % 10_000 == 0 {
            debug!(frames = self.emitted, sim_secs = t, "Simulated frames");
        }

        CanFrame::new(
            self.clock.now_ns(),
            arbitration_id,
            payload.len() as u8,
            payload,
            Arc::clone(&self.vehicle_id),
        )
    }
}

impl FrameSource for SimulatedSource {
    fn read(&mut self, timeout: Duration) -> Result<ReadOutcome, SourceError> {
        if self.closed {
            return Err(SourceError::Closed);
        }

        let t = self.sim_time(self.emitted);
        if let Some(limit) = self.run_for {
            if t >= limit.as_secs_f64() {
                if !self.finished_logged {
                    info!(frames = self.emitted, sim_secs = t, "Simulation duration reached");
                    self.finished_logged = true;
                }
                return Ok(ReadOutcome::EndOfStream);
            }
        }

        let due = self.started + Duration::from_secs_f64(t);
        let now = Instant::now();
        if due > now {
            let wait = due - now;
            if wait > timeout {
                std::thread::sleep(timeout);
                return Ok(ReadOutcome::Timeout);
            }
            std::thread::sleep(wait);
        }

        let frame = self.next_frame();
        self.stats.record_frame();
        Ok(ReadOutcome::Frame(frame))
    }

    fn close(&mut self) {
        if !self.closed {
            info!(frames = self.emitted, "Simulated CAN source closed");
        }
        self.closed = true;
        self.stats.set_connected(false);
    }

    fn stats(&self) -> SharedSourceStats {
        Arc::clone(&self.stats)
    }

    fn describe(&self) -> String {
        format!("simulator@{}Hz", self.frame_rate_hz)
    }
}

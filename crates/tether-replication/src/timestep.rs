//! Fixed-timestep accumulator driving server and client ticks.
//!
//! Real elapsed time accumulates; every whole tick duration in the
//! accumulator is one engine tick. A frame that would run more than
//! `max_ticks_per_frame` ticks drops the rest of its backlog instead of
//! trying to catch up.

use tether_config::SimulationConfig;
use tracing::warn;

/// Accumulator state for a fixed tick rate.
#[derive(Debug, Clone)]
pub struct FixedTimestep {
    tick_duration: f64,
    max_ticks_per_frame: u32,
    accumulator: f64,
    tick_count: u64,
    dropped_ticks: u64,
}

impl FixedTimestep {
    /// A timestep of `tick_rate` ticks per second, running at most
    /// `max_ticks_per_frame` ticks per frame.
    pub fn new(tick_rate: u32, max_ticks_per_frame: u32) -> Self {
        Self {
            tick_duration: 1.0 / f64::from(tick_rate.max(1)),
            max_ticks_per_frame: max_ticks_per_frame.max(1),
            accumulator: 0.0,
            tick_count: 0,
            dropped_ticks: 0,
        }
    }

    pub fn from_config(config: &SimulationConfig) -> Self {
        Self::new(config.tick_rate, config.max_ticks_per_frame)
    }

    /// Seconds per tick.
    pub fn tick_duration(&self) -> f64 {
        self.tick_duration
    }

    /// Adds `frame_time` seconds and returns how many ticks to run now.
    pub fn advance(&mut self, frame_time: f64) -> u32 {
        if frame_time.is_finite() && frame_time > 0.0 {
            self.accumulator += frame_time;
        }
        let due = (self.accumulator / self.tick_duration).floor();
        let max = f64::from(self.max_ticks_per_frame);
        let ticks = if due > max {
            let dropped = due - max;
            warn!(
                due = due as u64,
                max = self.max_ticks_per_frame,
                dropped = dropped as u64,
                "tick backlog exceeds per-frame cap, dropping it"
            );
            self.dropped_ticks += dropped as u64;
            self.accumulator -= due * self.tick_duration;
            self.max_ticks_per_frame
        } else {
            self.accumulator -= due * self.tick_duration;
            due as u32
        };
        self.accumulator = self.accumulator.max(0.0);
        self.tick_count += u64::from(ticks);
        ticks
    }

    /// Runs `update_fn` once per due tick, then returns the alpha.
    pub fn run(&mut self, frame_time: f64, mut update_fn: impl FnMut()) -> f64 {
        for _ in 0..self.advance(frame_time) {
            update_fn();
        }
        self.alpha()
    }

    /// Fraction of a tick left in the accumulator, in `[0, 1)`.
    pub fn alpha(&self) -> f64 {
        if self.accumulator > 0.0 {
            (self.accumulator / self.tick_duration).min(1.0)
        } else {
            0.0
        }
    }

    /// Ticks run since creation.
    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    /// Ticks skipped by the per-frame cap.
    pub fn dropped_ticks(&self) -> u64 {
        self.dropped_ticks
    }
}

impl Default for FixedTimestep {
    fn default() -> Self {
        Self::from_config(&SimulationConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DT: f64 = 1.0 / 60.0;

    #[test]
    fn test_single_tick() {
        let mut step = FixedTimestep::new(60, 5);
        assert_eq!(step.advance(DT), 1);
        assert_eq!(step.tick_count(), 1);
    }

    #[test]
    fn test_partial_frames_accumulate() {
        let mut step = FixedTimestep::new(60, 5);
        assert_eq!(step.advance(DT * 0.6), 0);
        assert!((step.alpha() - 0.6).abs() < 1e-9);
        assert_eq!(step.advance(DT * 0.6), 1);
        assert!((step.alpha() - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_backlog_capped() {
        let mut step = FixedTimestep::new(60, 5);
        assert_eq!(step.advance(DT * 12.5), 5);
        assert_eq!(step.dropped_ticks(), 7);
        // The fraction of a tick survives; the dropped whole ticks do not.
        assert!((step.alpha() - 0.5).abs() < 1e-6);
        assert_eq!(step.advance(0.0), 0);
    }

    #[test]
    fn test_bad_frame_times_ignored() {
        let mut step = FixedTimestep::new(60, 5);
        assert_eq!(step.advance(-1.0), 0);
        assert_eq!(step.advance(f64::NAN), 0);
        assert_eq!(step.alpha(), 0.0);
    }

    #[test]
    fn test_run_calls_update_per_tick() {
        let mut step = FixedTimestep::new(10, 10);
        let mut ran = 0;
        let alpha = step.run(0.35, || ran += 1);
        assert_eq!(ran, 3);
        assert!((alpha - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_from_config() {
        let config = SimulationConfig {
            tick_rate: 20,
            ..SimulationConfig::default()
        };
        let step = FixedTimestep::from_config(&config);
        assert!((step.tick_duration() - 0.05).abs() < f64::EPSILON);
    }
}

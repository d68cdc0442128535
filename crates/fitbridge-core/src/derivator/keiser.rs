//! Keiser M3i derivator
//!
//! The bike broadcasts cumulative time, calories and distance. Speed comes
//! from a ring buffer of recent distance/time deltas. Console resets are
//! detected when the broadcast time goes backwards, after which the last
//! emitted totals become offsets added to every later broadcast.

use std::collections::VecDeque;

use tracing::debug;

use super::{Derivator, StepState};
use crate::config::DerivatorConfig;
use crate::model::{KeiserM3iOutput, Sample};

const MS_PER_HOUR: f64 = 3_600_000.0;
const KM_PER_MILE: f64 = 1.60934;

/// Convert the broadcast odometer to km
///
/// Bit 15 marks a metric reading; otherwise the value is tenths of a mile.
pub fn keiser_distance_km(raw: i64) -> f64 {
    if raw & 0x8000 != 0 {
        (raw & 0x7FFF) as f64 * 0.1
    } else {
        raw as f64 * 0.1 * KM_PER_MILE
    }
}

#[derive(Debug, Clone, Default)]
struct Emitted {
    time: i64,
    calorie: i64,
    distance: f64,
    speed: f64,
    speed_mean: f64,
    rpm_mean: f64,
    pulse_mean: f64,
    watt_mean: f64,
    distance_rel: f64,
}

#[derive(Debug, Clone)]
pub struct KeiserDerivator {
    buffer_size: usize,
    pause_threshold_ms: i64,
    equal_time_limit: u32,
    ring: VecDeque<(f64, i64)>,
    dist_acc: f64,
    time_ms_acc: i64,
    time_o: i64,
    calorie_o: i64,
    distance_o: f64,
    equal_time: u32,
    old_time_orig: i64,
    last_update_ms: i64,
    prev_distance: f64,
    n_updates: i64,
    speed_sum: f64,
    rpm_sum: i64,
    watt_sum: i64,
    pulse_sum: i64,
    n_pulse: i64,
    sum_time_ms: i64,
    last: Emitted,
}

impl KeiserDerivator {
    pub fn new(config: &DerivatorConfig) -> Self {
        Self {
            buffer_size: config.buffer_size.max(1),
            pause_threshold_ms: config.pause_threshold_ms,
            equal_time_limit: config.keiser_equal_time_limit,
            ring: VecDeque::with_capacity(config.buffer_size.max(1)),
            dist_acc: 0.0,
            time_ms_acc: 0,
            time_o: 0,
            calorie_o: 0,
            distance_o: 0.0,
            equal_time: 0,
            old_time_orig: -1,
            last_update_ms: -1,
            prev_distance: 0.0,
            n_updates: 0,
            speed_sum: 0.0,
            rpm_sum: 0,
            watt_sum: 0,
            pulse_sum: 0,
            n_pulse: 0,
            sum_time_ms: 0,
            last: Emitted::default(),
        }
    }

    /// Offsets currently added to time, calories and distance
    pub fn offsets(&self) -> (i64, i64, f64) {
        (self.time_o, self.calorie_o, self.distance_o)
    }

    /// Deltas currently in the speed window
    pub fn window(&self) -> impl Iterator<Item = &(f64, i64)> {
        self.ring.iter()
    }

    fn push_delta(&mut self, distance: f64, time_ms: i64) {
        self.ring.push_back((distance, time_ms));
        self.dist_acc += distance;
        self.time_ms_acc += time_ms;
        while self.ring.len() > self.buffer_size {
            if let Some((d, t)) = self.ring.pop_front() {
                self.dist_acc -= d;
                self.time_ms_acc -= t;
            }
        }
    }

    fn window_speed(&self) -> f64 {
        if self.time_ms_acc > 0 {
            self.dist_acc / (self.time_ms_acc as f64 / MS_PER_HOUR)
        } else {
            0.0
        }
    }

    fn step_keiser(&mut self, sample: &mut KeiserM3iOutput, now_ms: i64) -> StepState {
        let raw_time = sample.time;

        if self.old_time_orig >= 0 && self.old_time_orig > raw_time {
            self.time_o = self.last.time;
            self.calorie_o = self.last.calorie;
            self.distance_o = self.last.distance;
            self.last_update_ms = -1;
            debug!(
                "Keiser console reset, offsets now time={} cal={} dist={:.3}",
                self.time_o, self.calorie_o, self.distance_o
            );
        }
        if self.old_time_orig == raw_time {
            self.equal_time += 1;
        } else {
            self.equal_time = 0;
        }
        let gap = self.last_update_ms >= 0 && now_ms - self.last_update_ms >= self.pause_threshold_ms;
        self.old_time_orig = raw_time;

        let time = raw_time + self.time_o;
        let calorie = sample.calorie + self.calorie_o;
        let distance = keiser_distance_km(sample.distance_raw) + self.distance_o;
        let paused = self.equal_time >= self.equal_time_limit || gap;

        let state = if paused {
            self.last_update_ms = -1;
            self.last.speed = 0.0;
            StepState::DPause
        } else {
            if self.last_update_ms >= 0 {
                let dt = now_ms - self.last_update_ms;
                if dt > 0 {
                    self.push_delta(distance - self.prev_distance, dt);
                    self.sum_time_ms += dt;
                }
            }
            let speed = self.window_speed();
            self.n_updates += 1;
            self.speed_sum += speed;
            self.rpm_sum += sample.rpm;
            self.watt_sum += sample.watt;
            if sample.pulse > 50 {
                self.pulse_sum += sample.pulse;
                self.n_pulse += 1;
            }
            let n = self.n_updates as f64;
            self.last.speed = speed;
            self.last.speed_mean = self.speed_sum / n;
            self.last.rpm_mean = self.rpm_sum as f64 / n / 10.0;
            self.last.watt_mean = self.watt_sum as f64 / n;
            if self.n_pulse > 0 {
                self.last.pulse_mean = self.pulse_sum as f64 / self.n_pulse as f64 / 10.0;
            }
            self.last.distance_rel = self.last.speed_mean * (self.sum_time_ms as f64 / MS_PER_HOUR);
            self.last_update_ms = now_ms;
            self.prev_distance = distance;
            StepState::Online
        };

        self.last.time = time;
        self.last.calorie = calorie;
        self.last.distance = distance;

        sample.time = time;
        sample.calorie = calorie;
        sample.distance = distance;
        sample.rpm /= 10;
        sample.pulse /= 10;
        sample.speed = self.last.speed;
        sample.speed_mean = self.last.speed_mean;
        sample.rpm_mean = self.last.rpm_mean;
        sample.pulse_mean = self.last.pulse_mean;
        sample.watt_mean = self.last.watt_mean;
        sample.distance_rel = self.last.distance_rel;
        state
    }
}

impl Derivator for KeiserDerivator {
    fn step(&mut self, sample: &mut Sample, now_ms: i64) -> StepState {
        match sample {
            Sample::Keiser(k) => self.step_keiser(k, now_ms),
            Sample::Hr(_) => StepState::InvalidStep,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn bike(rpm: i64, pulse: i64, time: i64, distance_raw: i64) -> Sample {
        Sample::Keiser(KeiserM3iOutput {
            rpm,
            pulse,
            time,
            distance_raw,
            ..KeiserM3iOutput::default()
        })
    }

    fn out(s: &Sample) -> &KeiserM3iOutput {
        match s {
            Sample::Keiser(k) => k,
            Sample::Hr(_) => panic!("not a keiser sample"),
        }
    }

    #[test]
    fn single_broadcast_is_post_processed() {
        let mut d = KeiserDerivator::new(&DerivatorConfig::default());
        let mut s = bike(18, 150, 10, 0x28);
        assert_eq!(d.step(&mut s, 0), StepState::Online);
        let k = out(&s);
        assert_eq!(k.rpm, 1);
        assert!((k.rpm_mean - 1.8).abs() < 1e-9);
        assert_eq!(k.pulse, 15);
        assert_eq!(k.time, 10);
        assert!((k.distance - 40.0 * 0.1 * 1.60934).abs() < 1e-9);
    }

    #[test]
    fn metric_flag_skips_mile_conversion() {
        assert!((keiser_distance_km(0x8000 | 25) - 2.5).abs() < 1e-9);
        assert!((keiser_distance_km(10) - 1.60934).abs() < 1e-9);
    }

    #[test]
    fn console_reset_continues_from_last_emitted() {
        let mut d = KeiserDerivator::new(&DerivatorConfig::default());
        let mut now = 0;
        for time in [100, 200] {
            let mut s = bike(600, 0, time, 0x8000 | 10);
            d.step(&mut s, now);
            now += 1000;
        }
        // first reset: offsets become 200
        let mut s = bike(600, 0, 50, 0x8000 | 1);
        d.step(&mut s, now);
        now += 1000;
        assert_eq!(d.offsets().0, 200);

        let mut s = bike(600, 0, 3000, 0x8000 | 5);
        d.step(&mut s, now);
        now += 1000;
        assert_eq!(out(&s).time, 3200);

        let mut s = bike(600, 0, 10, 0x8000 | 1);
        d.step(&mut s, now);
        let (time_o, _, distance_o) = d.offsets();
        assert_eq!(time_o, 3200);
        assert_eq!(out(&s).time, time_o + 10);
        assert!((out(&s).distance - (distance_o + 0.1)).abs() < 1e-9);
    }

    #[test]
    fn repeated_time_enters_pause() {
        let mut d = KeiserDerivator::new(&DerivatorConfig::default());
        let mut s = bike(600, 0, 10, 0);
        assert_eq!(d.step(&mut s, 0), StepState::Online);
        let mut states = Vec::new();
        for i in 1..=9 {
            let mut s = bike(600, 0, 10, 0);
            states.push(d.step(&mut s, i * 1000));
        }
        assert!(states[..7].iter().all(|s| *s == StepState::Online));
        assert_eq!(states[7], StepState::DPause);
        assert_eq!(states[8], StepState::DPause);

        let mut resumed = bike(600, 0, 11, 0);
        assert_eq!(d.step(&mut resumed, 10_000), StepState::Online);
    }

    #[test]
    fn long_gap_pauses_then_resumes() {
        let mut d = KeiserDerivator::new(&DerivatorConfig::default());
        let mut s = bike(600, 0, 10, 0);
        d.step(&mut s, 0);
        let mut late = bike(600, 0, 11, 0);
        assert_eq!(d.step(&mut late, 15_000), StepState::DPause);
        let mut next = bike(600, 0, 12, 0);
        assert_eq!(d.step(&mut next, 16_000), StepState::Online);
        assert_eq!(d.window().count(), 0);
    }

    #[test]
    fn pulse_mean_ignores_low_readings() {
        let mut d = KeiserDerivator::new(&DerivatorConfig::default());
        let mut a = bike(0, 0, 1, 0);
        d.step(&mut a, 0);
        let mut b = bike(0, 1200, 2, 0);
        d.step(&mut b, 1000);
        assert!((out(&b).pulse_mean - 120.0).abs() < 1e-9);
    }

    #[test]
    fn ring_evicts_oldest_delta() {
        let config = DerivatorConfig::default().with_buffer_size(2);
        let mut d = KeiserDerivator::new(&config);
        for (i, raw) in [0i64, 10, 30, 60].iter().enumerate() {
            let mut s = bike(600, 0, i as i64 + 1, 0x8000 | raw);
            d.step(&mut s, i as i64 * 1000);
        }
        let window: Vec<_> = d.window().cloned().collect();
        assert_eq!(window.len(), 2);
        assert!((window[0].0 - 2.0).abs() < 1e-9);
        assert!((window[1].0 - 3.0).abs() < 1e-9);
    }

    proptest! {
        #[test]
        fn speed_matches_window_sums(
            steps in prop::collection::vec((1i64..5_000, 0i64..20), 2..40),
            buffer in 1usize..20,
        ) {
            let config = DerivatorConfig::default().with_buffer_size(buffer);
            let mut d = KeiserDerivator::new(&config);
            let mut now = 0;
            let mut raw = 0i64;
            let mut last_speed = 0.0;
            for (i, (dt, dd)) in steps.iter().enumerate() {
                now += dt;
                raw += dd;
                let mut s = bike(600, 0, i as i64 + 1, 0x8000 | (raw & 0x7FFF));
                prop_assert_eq!(d.step(&mut s, now), StepState::Online);
                last_speed = out(&s).speed;
            }
            let (dist, time) = d
                .window()
                .fold((0.0, 0i64), |(ad, at), (dd, dt)| (ad + dd, at + dt));
            prop_assert!(d.window().count() <= buffer);
            let expected = dist / (time as f64 / 3_600_000.0);
            prop_assert!((last_speed - expected).abs() < 1e-6 * expected.abs().max(1.0));
        }
    }
}

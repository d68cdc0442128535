//! Heart-rate derivator
//!
//! Tracks active spans of a chest strap. A sample is active when it carries a
//! pulse and the strap does not report lost skin contact. Time inside a span
//! accumulates into `time_rel_ms`; a gap of at least the pause threshold
//! freezes the span and the next active sample starts a new one.

use super::{Derivator, StepState};
use crate::config::DerivatorConfig;
use crate::model::{HrDeviceOutput, Sample};

/// Derived values repeated on inactive steps
#[derive(Debug, Clone, Default, PartialEq)]
struct Emitted {
    pulse_mean: f64,
    joule_mean: Option<f64>,
    n_beats: i64,
    time_rel_ms: i64,
    time_abs_ms: i64,
    time_rel_s: i64,
}

#[derive(Debug, Clone)]
pub struct HeartRateDerivator {
    pause_threshold_ms: i64,
    last_start: i64,
    time_tot_ms: i64,
    session_start_ms: i64,
    n_beats: f64,
    pulse_sum: i64,
    joule_sum: i64,
    n_joule: i64,
    last_time_tot: i64,
    was_active: bool,
    last_update_ms: i64,
    last_pulse: i64,
    n_active_updates: i64,
    last_emitted: Emitted,
}

impl HeartRateDerivator {
    pub fn new(config: &DerivatorConfig) -> Self {
        Self {
            pause_threshold_ms: config.pause_threshold_ms,
            last_start: -1,
            time_tot_ms: 0,
            session_start_ms: -1,
            n_beats: 0.0,
            pulse_sum: 0,
            joule_sum: 0,
            n_joule: 0,
            last_time_tot: 0,
            was_active: false,
            last_update_ms: -1,
            last_pulse: 0,
            n_active_updates: 0,
            last_emitted: Emitted::default(),
        }
    }

    /// Time accumulated in spans that have already ended
    pub fn frozen_time_ms(&self) -> i64 {
        self.last_time_tot
    }

    /// Start of the current span, -1 outside a span
    pub fn span_start_ms(&self) -> i64 {
        self.last_start
    }

    fn freeze_span(&mut self) {
        self.last_time_tot += self.time_tot_ms;
        self.time_tot_ms = 0;
        self.last_start = -1;
        self.last_update_ms = -1;
    }

    fn accumulate(&mut self, sample: &HrDeviceOutput) {
        self.n_active_updates += 1;
        self.pulse_sum += sample.pulse;
        if sample.joule >= 0 {
            self.joule_sum += sample.joule;
            self.n_joule += 1;
        }
        self.last_pulse = sample.pulse;
    }

    fn step_hr(&mut self, sample: &mut HrDeviceOutput, now_ms: i64) -> StepState {
        let active = sample.pulse > 0 && sample.worn != 0;

        if active && self.last_start >= 0 && now_ms - self.last_update_ms >= self.pause_threshold_ms {
            self.freeze_span();
        }

        if !active {
            if !self.was_active {
                return StepState::InvalidStep;
            }
            if self.last_start >= 0 {
                self.freeze_span();
            }
            self.apply(sample);
            return StepState::DPause;
        }

        if self.last_start < 0 {
            if self.session_start_ms < 0 {
                self.session_start_ms = now_ms;
            }
            self.last_start = now_ms;
            self.last_update_ms = now_ms;
            self.time_tot_ms = 0;
            self.accumulate(sample);
        } else {
            let delta = now_ms - self.last_update_ms;
            if delta > 0 {
                self.n_beats += self.last_pulse as f64 * (delta as f64 / 60_000.0);
                self.time_tot_ms = now_ms - self.last_start;
                self.last_update_ms = now_ms;
                self.accumulate(sample);
            }
        }
        self.was_active = true;

        let time_rel_ms = self.last_time_tot + self.time_tot_ms;
        self.last_emitted = Emitted {
            pulse_mean: self.pulse_sum as f64 / self.n_active_updates.max(1) as f64,
            joule_mean: if sample.joule >= 0 && self.n_joule > 0 {
                Some(self.joule_sum as f64 / self.n_joule as f64)
            } else {
                None
            },
            n_beats: self.n_beats.round() as i64,
            time_rel_ms,
            time_abs_ms: now_ms - self.session_start_ms,
            time_rel_s: (time_rel_ms as f64 / 1000.0).round() as i64,
        };
        self.apply(sample);
        StepState::Online
    }

    fn apply(&self, sample: &mut HrDeviceOutput) {
        let e = &self.last_emitted;
        sample.pulse_mean = e.pulse_mean;
        sample.joule_mean = e.joule_mean;
        sample.n_beats = e.n_beats;
        sample.time_rel_ms = e.time_rel_ms;
        sample.time_abs_ms = e.time_abs_ms;
        sample.time_rel_s = e.time_rel_s;
    }
}

impl Derivator for HeartRateDerivator {
    fn step(&mut self, sample: &mut Sample, now_ms: i64) -> StepState {
        match sample {
            Sample::Hr(hr) => self.step_hr(hr, now_ms),
            Sample::Keiser(_) => StepState::InvalidStep,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample(pulse: i64, joule: i64) -> Sample {
        Sample::Hr(HrDeviceOutput::new(pulse, 1, joule))
    }

    fn hr(s: &Sample) -> &HrDeviceOutput {
        match s {
            Sample::Hr(h) => h,
            Sample::Keiser(_) => panic!("not a heart-rate sample"),
        }
    }

    #[test]
    fn happy_path_means_and_beats() {
        let mut d = HeartRateDerivator::new(&DerivatorConfig::default());
        let inputs = [(0, 60, 10), (1000, 62, 20), (2000, 64, 30), (3000, 66, 40)];
        let mut last = None;
        for (t, pulse, joule) in inputs {
            let mut s = sample(pulse, joule);
            assert_eq!(d.step(&mut s, t), StepState::Online);
            last = Some(s);
        }
        let last = last.unwrap();
        let out = hr(&last);
        assert_eq!(out.pulse_mean, 63.0);
        assert_eq!(out.n_beats, 3);
        assert_eq!(out.time_rel_s, 3);
        assert_eq!(out.time_abs_ms, 3000);
        assert_eq!(out.joule_mean, Some(25.0));
    }

    #[test]
    fn pause_gap_starts_new_span() {
        let mut d = HeartRateDerivator::new(&DerivatorConfig::default());
        for (t, pulse) in [(0, 60), (1000, 62), (2000, 64)] {
            let mut s = sample(pulse, -1);
            assert_eq!(d.step(&mut s, t), StepState::Online);
        }
        let mut resumed = sample(66, -1);
        assert_eq!(d.step(&mut resumed, 20_000), StepState::Online);
        assert_eq!(d.frozen_time_ms(), 2000);
        assert_eq!(d.span_start_ms(), 20_000);
        assert_eq!(hr(&resumed).time_rel_ms, 2000);
        assert_eq!(hr(&resumed).time_abs_ms, 20_000);
    }

    #[test]
    fn inactive_before_activity_is_invalid() {
        let mut d = HeartRateDerivator::new(&DerivatorConfig::default());
        let mut s = Sample::Hr(HrDeviceOutput::new(0, 1, -1));
        assert_eq!(d.step(&mut s, 0), StepState::InvalidStep);
        let mut off = Sample::Hr(HrDeviceOutput::new(70, 0, -1));
        assert_eq!(d.step(&mut off, 10), StepState::InvalidStep);
    }

    #[test]
    fn inactive_after_activity_pauses_with_last_values() {
        let mut d = HeartRateDerivator::new(&DerivatorConfig::default());
        let mut a = sample(60, -1);
        d.step(&mut a, 0);
        let mut b = sample(60, -1);
        d.step(&mut b, 1000);
        let mut off = Sample::Hr(HrDeviceOutput::new(60, 0, -1));
        assert_eq!(d.step(&mut off, 2000), StepState::DPause);
        assert_eq!(hr(&off).time_rel_ms, 1000);
        assert_eq!(d.frozen_time_ms(), 1000);
        assert!(hr(&off).joule_mean.is_none());
    }

    #[test]
    fn unsupported_contact_counts_as_worn() {
        let mut d = HeartRateDerivator::new(&DerivatorConfig::default());
        let mut s = Sample::Hr(HrDeviceOutput::new(80, -1, -1));
        assert_eq!(d.step(&mut s, 0), StepState::Online);
    }

    proptest! {
        #[test]
        fn time_rel_is_monotonic(
            steps in prop::collection::vec((0i64..25_000, 0i64..200, -1i64..2), 1..60)
        ) {
            let mut d = HeartRateDerivator::new(&DerivatorConfig::default());
            let mut now = 0;
            let mut last_rel = i64::MIN;
            for (delta, pulse, worn) in steps {
                now += delta;
                let mut s = Sample::Hr(HrDeviceOutput::new(pulse, worn, -1));
                if d.step(&mut s, now) == StepState::Online {
                    let rel = hr(&s).time_rel_ms;
                    prop_assert!(rel >= last_rel);
                    last_rel = rel;
                }
            }
        }
    }
}

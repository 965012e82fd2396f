//! Scalar One Euro filter for keypoint coordinates.
//!
//! The cutoff rises with the smoothed speed of the signal, so a still point
//! is heavily smoothed while a fast limb follows with little lag.

use std::f64::consts::TAU;

#[derive(Debug, Clone, Copy)]
struct State {
    raw: f64,
    value: f64,
    derivative: f64,
}

/// Blend weight of a new sample for a first-order low-pass at `cutoff` Hz.
fn alpha(dt: f64, cutoff: f64) -> f64 {
    if dt <= 0.0 || !dt.is_finite() {
        return 0.0;
    }
    let tau = 1.0 / (TAU * cutoff.max(f64::EPSILON));
    1.0 / (1.0 + tau / dt)
}

fn lerp(from: f64, to: f64, t: f64) -> f64 {
    from + t * (to - from)
}

#[derive(Debug, Clone)]
pub struct OneEuroFilter {
    min_cutoff: f64,
    beta: f64,
    d_cutoff: f64,
    state: Option<State>,
}

impl OneEuroFilter {
    pub fn new(min_cutoff: f64, beta: f64, d_cutoff: f64) -> Self {
        Self {
            min_cutoff,
            beta,
            d_cutoff,
            state: None,
        }
    }

    /// Feeds `value` observed `dt` seconds after the previous sample.
    ///
    /// The first sample is returned as is. A non-positive `dt` leaves the
    /// state alone and repeats the previous output.
    pub fn filter(&mut self, value: f64, dt: f64) -> f64 {
        let Some(prev) = self.state else {
            self.state = Some(State {
                raw: value,
                value,
                derivative: 0.0,
            });
            return value;
        };
        if dt <= 0.0 || !dt.is_finite() {
            return prev.value;
        }

        let speed = (value - prev.raw) / dt;
        let derivative = lerp(prev.derivative, speed, alpha(dt, self.d_cutoff));
        let cutoff = self.min_cutoff + self.beta * derivative.abs();
        let filtered = lerp(prev.value, value, alpha(dt, cutoff));

        self.state = Some(State {
            raw: value,
            value: filtered,
            derivative,
        });
        filtered
    }

    /// Most recent output, `None` before the first sample.
    pub fn last(&self) -> Option<f64> {
        self.state.map(|s| s.value)
    }
}

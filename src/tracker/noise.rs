//! Keypoint stabilization for the selected subject.
//!
//! Each of the 17 keypoints gets its own pair of One Euro filters, created on
//! the first observation. The filtered frame is then blended with a short
//! moving average over the most recent filtered frames.

use serde::Serialize;
use std::collections::VecDeque;

use super::one_euro::OneEuroFilter;
use crate::config::FilterConfig;
use crate::pose::{Keypoint, KeypointIndex};

struct PointFilter {
    x: OneEuroFilter,
    y: OneEuroFilter,
    last_timestamp: f64,
}

impl PointFilter {
    fn new(config: &FilterConfig, timestamp: f64) -> Self {
        Self {
            x: OneEuroFilter::new(config.min_cutoff, config.beta, config.d_cutoff),
            y: OneEuroFilter::new(config.min_cutoff, config.beta, config.d_cutoff),
            last_timestamp: timestamp,
        }
    }

    fn previous(&self) -> Option<(f64, f64)> {
        Some((self.x.last()?, self.y.last()?))
    }
}

/// Snapshot of the filter configuration and state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FilterStats {
    pub freq: f64,
    pub min_cutoff: f64,
    pub beta: f64,
    pub d_cutoff: f64,
    pub window_size: usize,
    pub active_filters: usize,
    pub history_len: usize,
}

pub struct NoiseFilter {
    config: FilterConfig,
    points: Vec<Option<PointFilter>>,
    /// Recent filtered frames (pre-blend), newest last
    history: VecDeque<[Keypoint; KeypointIndex::COUNT]>,
}

impl NoiseFilter {
    pub fn new(config: FilterConfig) -> Self {
        Self {
            points: (0..KeypointIndex::COUNT).map(|_| None).collect(),
            history: VecDeque::with_capacity(config.window_size + 1),
            config,
        }
    }

    /// 全キーポイントの状態と履歴をクリア
    pub fn reset(&mut self) {
        for p in &mut self.points {
            *p = None;
        }
        self.history.clear();
    }

    pub fn stats(&self) -> FilterStats {
        FilterStats {
            freq: self.config.freq,
            min_cutoff: self.config.min_cutoff,
            beta: self.config.beta,
            d_cutoff: self.config.d_cutoff,
            window_size: self.config.window_size,
            active_filters: self.points.iter().filter(|p| p.is_some()).count(),
            history_len: self.history.len(),
        }
    }

    /// Filters one frame of keypoints sampled at `timestamp` (seconds).
    ///
    /// Input with fewer than 17 keypoints comes back unchanged. Rows past the
    /// 17th are passed through.
    pub fn filter(&mut self, keypoints: &[Keypoint], timestamp: f64) -> Vec<Keypoint> {
        if keypoints.len() < KeypointIndex::COUNT {
            return keypoints.to_vec();
        }

        let mut filtered = [Keypoint::default(); KeypointIndex::COUNT];
        let mut blend = [false; KeypointIndex::COUNT];

        for (i, kp) in keypoints.iter().take(KeypointIndex::COUNT).enumerate() {
            let (out, observed) = self.filter_point(i, *kp, timestamp);
            filtered[i] = out;
            blend[i] = observed;
        }

        self.history.push_back(filtered);
        while self.history.len() > self.config.window_size.max(1) {
            self.history.pop_front();
        }

        let mut output: Vec<Keypoint> = filtered.to_vec();
        if self.history.len() >= 2 {
            let w = self.config.filtered_weight;
            for (i, kp) in output.iter_mut().enumerate() {
                if !blend[i] {
                    continue;
                }
                if let Some((ax, ay)) = self.history_average(i) {
                    kp.x = w * kp.x + (1.0 - w) * ax;
                    kp.y = w * kp.y + (1.0 - w) * ay;
                }
            }
        }

        output.extend_from_slice(&keypoints[KeypointIndex::COUNT..]);
        output
    }

    /// Returns the filtered point and whether it took part in filtering.
    fn filter_point(&mut self, i: usize, kp: Keypoint, timestamp: f64) -> (Keypoint, bool) {
        // Unobserved: pass through, scrubbing non-finite values
        if !kp.confidence.is_finite() || kp.confidence <= 0.0 {
            let out = if kp.is_finite() { kp } else { Keypoint::default() };
            return (out, false);
        }

        if !kp.x.is_finite() || !kp.y.is_finite() {
            return match self.points[i].as_ref().and_then(|p| p.previous()) {
                Some((x, y)) => (Keypoint::new(x, y, kp.confidence), false),
                None => (Keypoint::default(), false),
            };
        }

        let nominal_dt = 1.0 / self.config.freq.max(f64::EPSILON);
        let point = self.points[i].get_or_insert_with(|| PointFilter::new(&self.config, timestamp));
        let mut dt = timestamp - point.last_timestamp;
        if dt <= 0.0 || dt.is_nan() {
            dt = nominal_dt;
        }
        point.last_timestamp = timestamp;

        let x = point.x.filter(kp.x, dt);
        let y = point.y.filter(kp.y, dt);
        (Keypoint::new(x, y, kp.confidence), true)
    }

    /// Mean position of keypoint `i` over history frames where it was observed.
    fn history_average(&self, i: usize) -> Option<(f64, f64)> {
        let mut n = 0usize;
        let (mut sx, mut sy) = (0.0, 0.0);
        for frame in &self.history {
            let kp = frame[i];
            if kp.is_observed() {
                sx += kp.x;
                sy += kp.y;
                n += 1;
            }
        }
        if n == 0 {
            None
        } else {
            Some((sx / n as f64, sy / n as f64))
        }
    }
}

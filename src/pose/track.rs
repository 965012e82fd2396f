//! Box-overlap tracker that gives detections persistent ids.
//!
//! Each inference cycle, detections are matched to live tracks greedily by
//! descending IoU. Unmatched detections open new tracks; tracks that go
//! unmatched for more than `max_age` cycles are dropped.

use anyhow::Result;
use tracing::debug;

use super::{BBox, DetectionResult, InferenceEngine, Subject};
use crate::camera::Frame;
use crate::config::InferenceConfig;

#[derive(Debug, Clone)]
struct Track {
    id: i64,
    bbox: BBox,
    missed: u32,
}

pub struct IouTracker {
    min_iou: f64,
    max_age: u32,
    tracks: Vec<Track>,
    next_id: i64,
}

impl IouTracker {
    pub fn new(min_iou: f64, max_age: u32) -> Self {
        Self {
            min_iou,
            max_age,
            tracks: Vec::new(),
            next_id: 1,
        }
    }

    pub fn from_config(config: &InferenceConfig) -> Self {
        Self::new(config.track_iou, config.track_max_age)
    }

    /// Sets `track_id` on every subject that has a box. Subjects without a
    /// box cannot be associated and come out with no id.
    pub fn update(&mut self, subjects: &mut [Subject]) {
        let mut pairs: Vec<(usize, usize, f64)> = Vec::new();
        for (t, track) in self.tracks.iter().enumerate() {
            for (d, subject) in subjects.iter().enumerate() {
                if let Some(bbox) = subject.bbox {
                    let overlap = track.bbox.iou(&bbox);
                    if overlap >= self.min_iou && overlap > 0.0 {
                        pairs.push((t, d, overlap));
                    }
                }
            }
        }
        pairs.sort_by(|a, b| b.2.total_cmp(&a.2));

        let mut track_used = vec![false; self.tracks.len()];
        let mut assigned: Vec<Option<usize>> = vec![None; subjects.len()];
        for (t, d, _) in pairs {
            if track_used[t] || assigned[d].is_some() {
                continue;
            }
            track_used[t] = true;
            assigned[d] = Some(t);
        }

        for (t, track) in self.tracks.iter_mut().enumerate() {
            if !track_used[t] {
                track.missed += 1;
            }
        }

        for (subject, slot) in subjects.iter_mut().zip(&assigned) {
            let Some(bbox) = subject.bbox else {
                subject.track_id = None;
                continue;
            };
            let id = match slot {
                Some(t) => {
                    let track = &mut self.tracks[*t];
                    track.bbox = bbox;
                    track.missed = 0;
                    track.id
                }
                None => {
                    let id = self.next_id;
                    self.next_id += 1;
                    debug!(track_id = id, "new track");
                    self.tracks.push(Track { id, bbox, missed: 0 });
                    id
                }
            };
            subject.track_id = Some(id);
        }

        let max_age = self.max_age;
        self.tracks.retain(|t| t.missed <= max_age);
    }

    pub fn live_tracks(&self) -> usize {
        self.tracks.len()
    }
}

/// Wraps an engine and numbers its subjects with an [`IouTracker`].
pub struct TrackingEngine<E> {
    inner: E,
    tracker: IouTracker,
}

impl<E: InferenceEngine> TrackingEngine<E> {
    pub fn new(inner: E, tracker: IouTracker) -> Self {
        Self { inner, tracker }
    }
}

impl<E: InferenceEngine> InferenceEngine for TrackingEngine<E> {
    fn infer(&mut self, frame: &Frame) -> Result<DetectionResult> {
        let mut result = self.inner.infer(frame)?;
        self.tracker.update(&mut result.subjects);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pose::Pose;
    use std::collections::VecDeque;

    fn person(x: f64, y: f64) -> Subject {
        Subject::new(Pose::default()).with_bbox(BBox::new(x, y, x + 100.0, y + 200.0))
    }

    fn ids(subjects: &[Subject]) -> Vec<Option<i64>> {
        subjects.iter().map(|s| s.track_id).collect()
    }

    #[test]
    fn test_moving_subject_keeps_id() {
        let mut tracker = IouTracker::new(0.3, 30);
        let mut first = None;
        for i in 0..50 {
            let mut subjects = vec![person(10.0 * i as f64, 50.0)];
            tracker.update(&mut subjects);
            let id = subjects[0].track_id;
            assert!(id.is_some());
            if i == 0 {
                first = id;
            }
            assert_eq!(id, first, "id changed at frame {}", i);
        }
        assert_eq!(tracker.live_tracks(), 1);
    }

    #[test]
    fn test_two_subjects_keep_distinct_ids() {
        let mut tracker = IouTracker::new(0.3, 30);
        let mut subjects = vec![person(0.0, 0.0), person(500.0, 0.0)];
        tracker.update(&mut subjects);
        assert_eq!(ids(&subjects), vec![Some(1), Some(2)]);

        // Reported in the opposite order and slightly moved
        let mut subjects = vec![person(505.0, 5.0), person(8.0, 0.0)];
        tracker.update(&mut subjects);
        assert_eq!(ids(&subjects), vec![Some(2), Some(1)]);
    }

    #[test]
    fn test_short_gap_keeps_id() {
        let mut tracker = IouTracker::new(0.3, 3);
        let mut subjects = vec![person(0.0, 0.0)];
        tracker.update(&mut subjects);
        for _ in 0..3 {
            tracker.update(&mut []);
        }
        let mut subjects = vec![person(5.0, 0.0)];
        tracker.update(&mut subjects);
        assert_eq!(ids(&subjects), vec![Some(1)]);
    }

    #[test]
    fn test_expired_or_jumping_subject_gets_new_id() {
        let mut tracker = IouTracker::new(0.3, 2);
        let mut subjects = vec![person(0.0, 0.0)];
        tracker.update(&mut subjects);
        for _ in 0..3 {
            tracker.update(&mut []);
        }
        assert_eq!(tracker.live_tracks(), 0);
        let mut subjects = vec![person(0.0, 0.0)];
        tracker.update(&mut subjects);
        assert_eq!(ids(&subjects), vec![Some(2)]);

        let mut subjects = vec![person(800.0, 400.0)];
        tracker.update(&mut subjects);
        assert_eq!(ids(&subjects), vec![Some(3)]);
    }

    #[test]
    fn test_subject_without_box_has_no_id() {
        let mut tracker = IouTracker::new(0.3, 30);
        let mut subjects = vec![Subject::new(Pose::default()).with_track_id(9), person(0.0, 0.0)];
        tracker.update(&mut subjects);
        assert_eq!(ids(&subjects), vec![None, Some(1)]);
    }

    struct ScriptedEngine {
        results: VecDeque<DetectionResult>,
    }

    impl InferenceEngine for ScriptedEngine {
        fn infer(&mut self, _frame: &Frame) -> Result<DetectionResult> {
            self.results
                .pop_front()
                .ok_or_else(|| anyhow::anyhow!("script exhausted"))
        }
    }

    #[test]
    fn test_tracking_engine_numbers_results() {
        let script = (0..3)
            .map(|i| DetectionResult::new(640, 480, vec![person(20.0 * i as f64, 0.0)]))
            .collect();
        let mut engine = TrackingEngine::new(
            ScriptedEngine { results: script },
            IouTracker::from_config(&InferenceConfig::default()),
        );
        let frame = Frame::placeholder(640, 480);
        for _ in 0..3 {
            let result = engine.infer(&frame).unwrap();
            assert!(result.has_track_ids());
            assert_eq!(result.subjects[0].track_id, Some(1));
        }
        assert!(engine.infer(&frame).is_err());
    }
}

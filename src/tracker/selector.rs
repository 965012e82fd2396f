use tracing::{debug, info};

use crate::config::TrackingConfig;
use crate::pose::{DetectionResult, Pose};

/// Identity the selector is currently following.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackState {
    pub primary_track_id: Option<i64>,
    /// Consecutive cycles the primary id has been absent
    pub missing_frames: u32,
}

/// The subject picked for one cycle. `pose` is a copy; the detection result
/// it came from is left untouched.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Selection {
    pub index: usize,
    pub pose: Pose,
    /// A new primary identity was assigned this cycle
    pub reassigned: bool,
}

/// 主被写体の選択（トラックIDの継続性を優先し、なければ最大面積）
pub struct TrackSelector {
    state: TrackState,
    reset_threshold: u32,
    person_class_id: u32,
}

impl TrackSelector {
    pub fn new(reset_threshold: u32, person_class_id: u32) -> Self {
        Self {
            state: TrackState::default(),
            reset_threshold,
            person_class_id,
        }
    }

    pub fn from_config(config: &TrackingConfig) -> Self {
        Self::new(config.missing_reset_threshold, config.person_class_id)
    }

    pub fn state(&self) -> TrackState {
        self.state
    }

    pub fn select(&mut self, detection: &DetectionResult) -> Option<Selection> {
        let subjects = &detection.subjects;
        if subjects.is_empty() {
            return None;
        }

        // Plain detection: no tracker ids at all
        if !detection.has_track_ids() {
            return Some(Selection {
                index: 0,
                pose: subjects[0].pose,
                reassigned: false,
            });
        }

        if let Some(primary) = self.state.primary_track_id {
            if let Some(index) = subjects.iter().position(|s| s.track_id == Some(primary)) {
                self.state.missing_frames = 0;
                return Some(Selection {
                    index,
                    pose: subjects[index].pose,
                    reassigned: false,
                });
            }

            self.state.missing_frames += 1;
            if self.state.missing_frames < self.reset_threshold {
                debug!(
                    track_id = primary,
                    missing = self.state.missing_frames,
                    "primary track missing"
                );
                return None;
            }
            info!(
                track_id = primary,
                missing = self.state.missing_frames,
                "primary track lost, reselecting"
            );
            self.state.primary_track_id = None;
        }

        let index = self.largest_candidate(detection)?;
        self.state.primary_track_id = subjects[index].track_id;
        self.state.missing_frames = 0;
        info!(track_id = ?self.state.primary_track_id, "primary track assigned");

        Some(Selection {
            index,
            pose: subjects[index].pose,
            reassigned: true,
        })
    }

    /// Largest box among tracked person-class subjects, or among all tracked
    /// subjects when none is flagged as a person. Ties keep the first.
    fn largest_candidate(&self, detection: &DetectionResult) -> Option<usize> {
        let tracked: Vec<usize> = detection
            .subjects
            .iter()
            .enumerate()
            .filter(|(_, s)| s.track_id.is_some())
            .map(|(i, _)| i)
            .collect();

        let persons: Vec<usize> = tracked
            .iter()
            .copied()
            .filter(|&i| detection.subjects[i].class_id == Some(self.person_class_id))
            .collect();

        let candidates = if persons.is_empty() { tracked } else { persons };

        let mut best: Option<(usize, f64)> = None;
        for i in candidates {
            let area = detection.subjects[i].area();
            match best {
                Some((_, best_area)) if area <= best_area => {}
                _ => best = Some((i, area)),
            }
        }
        best.map(|(i, _)| i)
    }
}

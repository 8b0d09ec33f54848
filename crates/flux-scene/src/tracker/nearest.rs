//! 内置最近邻追踪器：常速度预测 + 贪心最近邻关联

use super::{DistanceType, TrackState, Tracker, TrackerFactory, TrackerInput, TrackerParams};
use crate::object::SPEED_THRESHOLD;
use flux_scene_core::Result;
use nalgebra::{Point3, Vector3};

/// 速度平滑系数
const VELOCITY_ALPHA: f64 = 0.5;

#[derive(Debug, Clone)]
struct Track {
    id: u64,
    position: Point3<f64>,
    velocity: Vector3<f64>,
    hits: u32,
    last_measured: f64,
    submission_id: usize,
}

pub struct NearestNeighborTracker {
    params: TrackerParams,
    frame_rate: f64,
    tracks: Vec<Track>,
    next_id: u64,
    last_time: Option<f64>,
}

impl NearestNeighborTracker {
    pub fn new(params: TrackerParams) -> Self {
        Self {
            params,
            frame_rate: 30.0,
            tracks: Vec::new(),
            next_id: 1,
            last_time: None,
        }
    }

    fn predict(&mut self, dt: f64) {
        for track in &mut self.tracks {
            track.position += track.velocity * dt;
        }
    }

    /// 贪心匹配：按距离升序取未占用的 (测量, 轨迹) 对
    fn associate(
        &self,
        inputs: &[TrackerInput],
        distance: DistanceType,
        threshold: f64,
    ) -> Vec<(usize, usize)> {
        let mut pairs: Vec<(f64, usize, usize)> = Vec::new();
        for (i, input) in inputs.iter().enumerate() {
            for (t, track) in self.tracks.iter().enumerate() {
                let d = distance.distance(&input.position, &track.position);
                if d <= threshold {
                    pairs.push((d, i, t));
                }
            }
        }
        pairs.sort_by(|a, b| a.0.total_cmp(&b.0));

        let mut used_inputs = vec![false; inputs.len()];
        let mut used_tracks = vec![false; self.tracks.len()];
        let mut matches = Vec::new();
        for (_, i, t) in pairs {
            if used_inputs[i] || used_tracks[t] {
                continue;
            }
            used_inputs[i] = true;
            used_tracks[t] = true;
            matches.push((i, t));
        }
        matches
    }

    fn expired(&self, track: &Track, now: f64) -> bool {
        let idle = now - track.last_measured;
        if track.hits < self.params.reliable_frames {
            return idle > self.params.max_unreliable_time;
        }
        let limit = if track.velocity.xy().norm() > SPEED_THRESHOLD {
            self.params.non_measurement_time_dynamic
        } else {
            self.params.non_measurement_time_static
        };
        idle > limit
    }
}

impl Tracker for NearestNeighborTracker {
    fn update_params(&mut self, frame_rate: f64) {
        if frame_rate > 0.0 {
            self.frame_rate = frame_rate;
        }
    }

    fn track(
        &mut self,
        inputs: Vec<TrackerInput>,
        timestamp: f64,
        distance: DistanceType,
        threshold: f64,
    ) -> Result<()> {
        let dt = match self.last_time {
            Some(last) if timestamp > last => timestamp - last,
            Some(_) => 1.0 / self.frame_rate,
            None => 0.0,
        };
        self.last_time = Some(timestamp);

        let before: Vec<Point3<f64>> = self.tracks.iter().map(|t| t.position).collect();
        self.predict(dt);

        let matches = self.associate(&inputs, distance, threshold);
        let mut matched_inputs = vec![false; inputs.len()];
        for (i, t) in matches {
            matched_inputs[i] = true;
            let input = &inputs[i];
            let track = &mut self.tracks[t];
            if dt > 0.0 {
                let measured = (input.position - before[t]) / dt;
                track.velocity = track.velocity * (1.0 - VELOCITY_ALPHA) + measured * VELOCITY_ALPHA;
            }
            track.position = input.position;
            track.hits += 1;
            track.last_measured = timestamp;
            track.submission_id = input.submission_id;
        }

        for (i, input) in inputs.iter().enumerate() {
            if matched_inputs[i] {
                continue;
            }
            self.tracks.push(Track {
                id: self.next_id,
                position: input.position,
                velocity: Vector3::zeros(),
                hits: 1,
                last_measured: timestamp,
                submission_id: input.submission_id,
            });
            self.next_id += 1;
        }

        let tracks = std::mem::take(&mut self.tracks);
        let kept: Vec<Track> = tracks.into_iter().filter(|t| !self.expired(t, timestamp)).collect();
        self.tracks = kept;
        Ok(())
    }

    fn reliable_tracks(&self) -> Vec<TrackState> {
        self.tracks
            .iter()
            .filter(|t| t.hits >= self.params.reliable_frames)
            .map(|t| TrackState {
                id: t.id,
                submission_id: t.submission_id,
                last_measured: t.last_measured,
                position: t.position,
                velocity: t.velocity,
            })
            .collect()
    }
}

/// 最近邻追踪器工厂
pub struct NearestNeighborFactory;

impl TrackerFactory for NearestNeighborFactory {
    fn name(&self) -> &str {
        "nearest"
    }

    fn create(&self, params: &TrackerParams) -> Box<dyn Tracker> {
        Box::new(NearestNeighborTracker::new(params.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(id: usize, x: f64, y: f64) -> TrackerInput {
        TrackerInput {
            submission_id: id,
            position: Point3::new(x, y, 0.0),
            size: [0.5, 0.5, 1.8],
            yaw: 0.0,
            confidence: 0.9,
        }
    }

    fn params(reliable_frames: u32) -> TrackerParams {
        TrackerParams { reliable_frames, ..Default::default() }
    }

    #[test]
    fn test_track_becomes_reliable() {
        let mut tracker = NearestNeighborTracker::new(params(3));
        for frame in 0..3 {
            let t = frame as f64 * 0.1;
            tracker.track(vec![input(frame, t, 0.0)], t, DistanceType::Euclidean, 1.0).unwrap();
            if frame < 2 {
                assert!(tracker.reliable_tracks().is_empty());
            }
        }
        let tracks = tracker.reliable_tracks();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].submission_id, 2);
        assert!((tracks[0].velocity.x - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_two_objects_keep_ids() {
        let mut tracker = NearestNeighborTracker::new(params(1));
        tracker
            .track(vec![input(0, 0.0, 0.0), input(1, 10.0, 0.0)], 0.0, DistanceType::Euclidean, 2.0)
            .unwrap();
        let first: Vec<u64> = tracker.reliable_tracks().iter().map(|t| t.id).collect();
        tracker
            .track(vec![input(0, 10.2, 0.0), input(1, 0.1, 0.0)], 0.1, DistanceType::Euclidean, 2.0)
            .unwrap();
        let tracks = tracker.reliable_tracks();
        assert_eq!(tracks.len(), 2);
        let near_origin = tracks.iter().find(|t| t.position.x < 1.0).unwrap();
        assert_eq!(near_origin.id, first[0]);
        assert_eq!(near_origin.submission_id, 1);
    }

    #[test]
    fn test_unmeasured_track_expires() {
        let mut tracker = NearestNeighborTracker::new(params(1));
        tracker.track(vec![input(0, 0.0, 0.0)], 0.0, DistanceType::Euclidean, 1.0).unwrap();
        tracker.track(vec![], 0.3, DistanceType::Euclidean, 1.0).unwrap();
        assert_eq!(tracker.reliable_tracks().len(), 1);
        tracker.track(vec![], 1.0, DistanceType::Euclidean, 1.0).unwrap();
        assert!(tracker.reliable_tracks().is_empty());
    }
}

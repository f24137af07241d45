//! Gaze and head-pose model.
//!
//! Produces one reading per cycle: gaze direction with short-term coherence,
//! head pose, visible face count, detection confidence and a stability score
//! over the recent gaze history.

use super::{Analyzer, ProducerError};
use crate::event::EventType;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;

/// Rolling gaze history retention.
pub const HISTORY_WINDOW_MS: i64 = 30_000;

/// Samples considered by the stability score.
const STABILITY_SAMPLES: usize = 5;

/// Below this many samples the gaze counts as fully stable.
const MIN_STABILITY_SAMPLES: usize = 3;

/// Chance of holding a non-center gaze for another cycle.
const REPEAT_PROBABILITY: f64 = 0.3;

const CONFIDENCE_PENALTY: f64 = 0.3;
const CONFIDENCE_FLOOR: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GazeDirection {
    Center,
    Left,
    Right,
    Up,
    Down,
}

impl GazeDirection {
    pub const ALL: [GazeDirection; 5] = [
        GazeDirection::Center,
        GazeDirection::Left,
        GazeDirection::Right,
        GazeDirection::Up,
        GazeDirection::Down,
    ];

    /// Base draw weights, aligned with [`GazeDirection::ALL`].
    pub const WEIGHTS: [f64; 5] = [0.6, 0.1, 0.1, 0.1, 0.1];

    pub fn as_str(&self) -> &'static str {
        match self {
            GazeDirection::Center => "center",
            GazeDirection::Left => "left",
            GazeDirection::Right => "right",
            GazeDirection::Up => "up",
            GazeDirection::Down => "down",
        }
    }
}

/// Head orientation in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeadPose {
    pub pitch: f64,
    pub yaw: f64,
    pub roll: f64,
}

/// Payload of a gaze event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GazeReading {
    pub gaze_direction: GazeDirection,
    pub head_pose: HeadPose,
    pub face_count: u32,
    pub confidence: f64,
    pub gaze_stability: f64,
    pub eye_aspect_ratio: f64,
    pub blink_rate: f64,
    pub landmarks_detected: bool,
}

/// Draw the next gaze direction.
///
/// A non-center previous gaze is repeated with 30% probability before
/// falling back to the weighted draw.
pub fn next_direction<R: Rng + ?Sized>(
    rng: &mut R,
    previous: Option<GazeDirection>,
) -> GazeDirection {
    if let Some(prev) = previous {
        if prev != GazeDirection::Center && rng.gen_bool(REPEAT_PROBABILITY) {
            return prev;
        }
    }
    // Weights are constant and positive.
    match WeightedIndex::new(GazeDirection::WEIGHTS) {
        Ok(dist) => GazeDirection::ALL[dist.sample(rng)],
        Err(_) => GazeDirection::Center,
    }
}

/// Pitch ±5°, yaw ±10°, roll ±5°, uniform around zero.
pub fn head_pose<R: Rng + ?Sized>(rng: &mut R) -> HeadPose {
    HeadPose {
        pitch: rng.gen_range(-5.0..=5.0),
        yaw: rng.gen_range(-10.0..=10.0),
        roll: rng.gen_range(-5.0..=5.0),
    }
}

/// 5% no face, 90% one face, 5% two to four faces.
pub fn face_count<R: Rng + ?Sized>(rng: &mut R) -> u32 {
    let roll: f64 = rng.gen();
    if roll < 0.05 {
        0
    } else if roll < 0.95 {
        1
    } else {
        rng.gen_range(2..=4)
    }
}

/// Detection confidence for a cycle whose face count is already known.
pub fn confidence<R: Rng + ?Sized>(rng: &mut R, faces: u32) -> f64 {
    let base: f64 = rng.gen_range(0.85..=0.95);
    if faces == 1 {
        base
    } else {
        (base - CONFIDENCE_PENALTY).max(CONFIDENCE_FLOOR)
    }
}

/// Share of `center` among the last five samples; 1.0 below three samples.
pub fn gaze_stability<'a, I>(history: I) -> f64
where
    I: DoubleEndedIterator<Item = &'a GazeDirection> + ExactSizeIterator,
{
    if history.len() < MIN_STABILITY_SAMPLES {
        return 1.0;
    }
    let recent: Vec<&GazeDirection> = history.rev().take(STABILITY_SAMPLES).collect();
    let centered = recent
        .iter()
        .filter(|d| ***d == GazeDirection::Center)
        .count();
    centered as f64 / recent.len() as f64
}

/// Eye aspect ratio; 5% of cycles land in the blink band.
fn eye_aspect_ratio<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    if rng.gen_bool(0.05) {
        rng.gen_range(0.05..=0.10)
    } else {
        rng.gen_range(0.25..=0.30)
    }
}

/// Gaze/head-pose analyzer with a 30-second rolling history.
#[derive(Debug, Default)]
pub struct GazeAnalyzer {
    history: VecDeque<(i64, GazeDirection)>,
}

impl GazeAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    fn record(&mut self, now_ms: i64, direction: GazeDirection) {
        self.history.push_back((now_ms, direction));
        while let Some(&(ts, _)) = self.history.front() {
            if now_ms - ts > HISTORY_WINDOW_MS {
                self.history.pop_front();
            } else {
                break;
            }
        }
    }

    /// Compute one reading.
    pub fn read<R: Rng + ?Sized>(&mut self, rng: &mut R, now_ms: i64) -> GazeReading {
        let previous = self.history.back().map(|&(_, d)| d);
        let gaze_direction = next_direction(rng, previous);
        let head_pose = head_pose(rng);
        let faces = face_count(rng);
        let confidence = confidence(rng, faces);

        self.record(now_ms, gaze_direction);
        let gaze_stability = gaze_stability(self.history.iter().map(|(_, d)| d));

        GazeReading {
            gaze_direction,
            head_pose,
            face_count: faces,
            confidence,
            gaze_stability,
            eye_aspect_ratio: eye_aspect_ratio(rng),
            blink_rate: rng.gen_range(15.0..=25.0),
            landmarks_detected: faces > 0,
        }
    }
}

impl Analyzer for GazeAnalyzer {
    fn name(&self) -> &'static str {
        "gaze"
    }

    fn event_type(&self) -> EventType {
        EventType::Gaze
    }

    fn reset(&mut self) {
        self.history.clear();
    }

    fn analyze(&mut self, rng: &mut StdRng, now_ms: i64) -> Result<Value, ProducerError> {
        let reading = self.read(rng, now_ms);
        if !(0.0..=1.0).contains(&reading.confidence) {
            return Err(ProducerError::InvalidReading(format!(
                "confidence {} out of range",
                reading.confidence
            )));
        }
        Ok(serde_json::to_value(reading)?)
    }
}

//! Voice-activity model.
//!
//! Speech is sampled once per cycle and drives the audio level, silence
//! duration and activity score of that same reading.

use super::{Analyzer, ProducerError};
use crate::event::EventType;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use statrs::statistics::Statistics;
use std::collections::VecDeque;

/// Rolling speaker history retention.
pub const HISTORY_WINDOW_MS: i64 = 60_000;

const SPEECH_PROBABILITY: f64 = 0.15;
const MULTIPLE_VOICES_PROBABILITY: f64 = 0.03;
const ELEVATED_NOISE_PROBABILITY: f64 = 0.10;

/// Combined variance at which speaker consistency reaches zero.
const CONSISTENCY_SCALE: f64 = 10_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmotionalState {
    Neutral,
    Stressed,
    Calm,
    Excited,
    Focused,
}

impl EmotionalState {
    pub const ALL: [EmotionalState; 5] = [
        EmotionalState::Neutral,
        EmotionalState::Stressed,
        EmotionalState::Calm,
        EmotionalState::Excited,
        EmotionalState::Focused,
    ];

    pub const WEIGHTS: [f64; 5] = [0.6, 0.15, 0.15, 0.05, 0.05];
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VoiceCharacteristics {
    /// Hz
    pub pitch: f64,
    /// Words per minute
    pub tempo: f64,
    pub emotional_state: EmotionalState,
    pub clarity: f64,
}

/// Payload of an audio event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioReading {
    pub speech_detected: bool,
    pub multiple_voices: bool,
    pub audio_level: f64,
    pub background_noise_level: f64,
    /// Seconds
    pub silence_duration: f64,
    pub voice: VoiceCharacteristics,
    pub speaker_consistency: f64,
    pub voice_activity_score: f64,
}

/// Ambient level, boosted when speech is present. Capped at 100.
pub fn audio_level<R: Rng + ?Sized>(rng: &mut R, speech: bool) -> f64 {
    let ambient: f64 = rng.gen_range(20.0..=50.0);
    if speech {
        (ambient + rng.gen_range(30.0..=70.0)).min(100.0)
    } else {
        ambient
    }
}

/// Background noise with an occasional elevated spike.
pub fn background_noise<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    let base: f64 = rng.gen_range(15.0..=40.0);
    if rng.gen_bool(ELEVATED_NOISE_PROBABILITY) {
        base + rng.gen_range(30.0..=60.0)
    } else {
        base
    }
}

pub fn voice_characteristics<R: Rng + ?Sized>(rng: &mut R) -> VoiceCharacteristics {
    let emotional_state = match WeightedIndex::new(EmotionalState::WEIGHTS) {
        Ok(dist) => EmotionalState::ALL[dist.sample(rng)],
        Err(_) => EmotionalState::Neutral,
    };
    VoiceCharacteristics {
        pitch: rng.gen_range(100.0..=300.0),
        tempo: rng.gen_range(120.0..=180.0),
        emotional_state,
        clarity: rng.gen_range(0.7..=1.0),
    }
}

/// `1 - min(1, (var(pitch) + var(tempo)) / 10000)` using population
/// variance; 1.0 with fewer than two samples.
pub fn speaker_consistency(samples: &[(f64, f64)]) -> f64 {
    if samples.len() < 2 {
        return 1.0;
    }
    let pitch_var = samples.iter().map(|s| s.0).population_variance();
    let tempo_var = samples.iter().map(|s| s.1).population_variance();
    1.0 - ((pitch_var + tempo_var) / CONSISTENCY_SCALE).min(1.0)
}

/// +0.6 speech, +0.4 multiple voices, +0.2 loud; capped at 1.0.
pub fn voice_activity_score(speech: bool, multiple_voices: bool, audio_level: f64) -> f64 {
    let mut score = 0.0;
    if speech {
        score += 0.6;
    }
    if multiple_voices {
        score += 0.4;
    }
    if audio_level > 60.0 {
        score += 0.2;
    }
    f64::min(score, 1.0)
}

/// Audio analyzer with a 60-second rolling (pitch, tempo) history.
#[derive(Debug, Default)]
pub struct AudioAnalyzer {
    history: VecDeque<(i64, f64, f64)>,
}

impl AudioAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    fn record(&mut self, now_ms: i64, voice: &VoiceCharacteristics) {
        self.history.push_back((now_ms, voice.pitch, voice.tempo));
        while let Some(&(ts, _, _)) = self.history.front() {
            if now_ms - ts > HISTORY_WINDOW_MS {
                self.history.pop_front();
            } else {
                break;
            }
        }
    }

    /// Compute one reading.
    pub fn read<R: Rng + ?Sized>(&mut self, rng: &mut R, now_ms: i64) -> AudioReading {
        let speech_detected = rng.gen_bool(SPEECH_PROBABILITY);
        let multiple_voices = rng.gen_bool(MULTIPLE_VOICES_PROBABILITY);
        let audio_level = audio_level(rng, speech_detected);
        let background_noise_level = background_noise(rng);
        let silence_duration = if speech_detected {
            0.0
        } else {
            rng.gen_range(1.0..=30.0)
        };
        let voice = voice_characteristics(rng);

        self.record(now_ms, &voice);
        let samples: Vec<(f64, f64)> = self.history.iter().map(|&(_, p, t)| (p, t)).collect();

        AudioReading {
            speech_detected,
            multiple_voices,
            audio_level,
            background_noise_level,
            silence_duration,
            voice,
            speaker_consistency: speaker_consistency(&samples),
            voice_activity_score: voice_activity_score(speech_detected, multiple_voices, audio_level),
        }
    }
}

impl Analyzer for AudioAnalyzer {
    fn name(&self) -> &'static str {
        "audio"
    }

    fn event_type(&self) -> EventType {
        EventType::Audio
    }

    fn reset(&mut self) {
        self.history.clear();
    }

    fn analyze(&mut self, rng: &mut StdRng, now_ms: i64) -> Result<Value, ProducerError> {
        let reading = self.read(rng, now_ms);
        if !reading.speaker_consistency.is_finite() {
            return Err(ProducerError::InvalidReading(
                "speaker consistency is not finite".into(),
            ));
        }
        Ok(serde_json::to_value(reading)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::producer::seeded_rng;

    #[test]
    fn test_consistency_with_few_samples() {
        assert_eq!(speaker_consistency(&[]), 1.0);
        assert_eq!(speaker_consistency(&[(180.0, 150.0)]), 1.0);
        assert_eq!(speaker_consistency(&[(180.0, 150.0), (180.0, 150.0)]), 1.0);
    }

    #[test]
    fn test_consistency_uses_population_variance() {
        // pitch var = 100^2, tempo var = 0
        let value = speaker_consistency(&[(100.0, 150.0), (300.0, 150.0)]);
        assert!((value - 0.0).abs() < 1e-12);

        // pitch var = 25^2 = 625, tempo var = 5^2 = 25
        let value = speaker_consistency(&[(150.0, 140.0), (200.0, 150.0)]);
        assert!((value - (1.0 - 650.0 / 10_000.0)).abs() < 1e-12);
    }

    #[test]
    fn test_consistency_decreases_with_variance() {
        let mut previous = 1.0;
        for spread in [5.0, 10.0, 20.0, 40.0, 60.0, 80.0] {
            let samples = [(200.0 - spread, 150.0), (200.0 + spread, 150.0 + spread / 4.0)];
            let value = speaker_consistency(&samples);
            assert!(value < previous, "spread {spread}: {value} !< {previous}");
            assert!((0.0..=1.0).contains(&value));
            previous = value;
        }
    }

    #[test]
    fn test_activity_score_weights() {
        assert_eq!(voice_activity_score(false, false, 10.0), 0.0);
        assert!((voice_activity_score(true, false, 10.0) - 0.6).abs() < 1e-12);
        assert!((voice_activity_score(false, true, 61.0) - 0.6).abs() < 1e-12);
        assert_eq!(voice_activity_score(true, true, 90.0), 1.0);
    }

    #[test]
    fn test_reading_invariants_hold_over_many_cycles() {
        let mut rng = seeded_rng(Some(21));
        let mut analyzer = AudioAnalyzer::new();
        let mut speech = 0;

        for i in 0..5_000 {
            let r = analyzer.read(&mut rng, i * 2_000);
            if r.speech_detected {
                speech += 1;
                assert_eq!(r.silence_duration, 0.0);
                assert!(r.audio_level >= 50.0 && r.audio_level <= 100.0);
            } else {
                assert!((1.0..=30.0).contains(&r.silence_duration));
                assert!((20.0..=50.0).contains(&r.audio_level));
            }
            assert!((15.0..=100.0).contains(&r.background_noise_level));
            assert!((100.0..=300.0).contains(&r.voice.pitch));
            assert!((120.0..=180.0).contains(&r.voice.tempo));
            assert!((0.7..=1.0).contains(&r.voice.clarity));
            assert!((0.0..=1.0).contains(&r.speaker_consistency));
            assert!((0.0..=1.0).contains(&r.voice_activity_score));
        }

        let share = speech as f64 / 5_000.0;
        assert!((0.12..0.18).contains(&share), "speech share {share}");
    }

    #[test]
    fn test_history_keeps_sixty_seconds() {
        let mut rng = seeded_rng(Some(4));
        let mut analyzer = AudioAnalyzer::new();
        for i in 0..100 {
            analyzer.read(&mut rng, i * 2_000);
        }
        // samples within 60s of t=198s: 138s..=198s
        assert_eq!(analyzer.history_len(), 31);
    }
}

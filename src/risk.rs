//! Incremental risk scoring.
//!
//! [`score_event`] maps one event to a score delta; [`RiskLedger`] folds
//! deltas into a per-session running total and maps it to a status through
//! independently configurable [`RiskThresholds`].
//!
//! A ledger built [`with_patterns`](RiskLedger::with_patterns) also scores
//! sequences that no single event shows: rapid gaze switching and a tab
//! change followed closely by copy or paste.

use crate::event::{Event, EventType};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;

/// Score added per trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreWeights {
    /// Gaze left, right or down
    pub gaze_away: u32,
    pub speech: u32,
    pub multiple_voices: u32,
    pub tab_change: u32,
    /// Copy or paste
    pub clipboard: u32,
    /// More than one face
    pub multiple_faces: u32,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            gaze_away: 2,
            speech: 3,
            multiple_voices: 5,
            tab_change: 5,
            clipboard: 7,
            multiple_faces: 10,
        }
    }
}

/// Gaze readings a window needs before rapid switching is judged.
pub const RAPID_GAZE_MIN_READINGS: usize = 6;

/// Direction changes (not back to center) that count as rapid switching.
pub const RAPID_GAZE_MIN_CHANGES: usize = 4;

/// Gaze directions kept per session for pattern detection.
const GAZE_HISTORY: usize = 30;

/// A clipboard action closer than this to a tab change completes the pattern.
pub const TAB_CLIPBOARD_GAP_MS: i64 = 5_000;

/// Score added per detected sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternWeights {
    /// Scored at most once per window
    pub rapid_gaze_switching: u32,
    /// Scored for every tab change directly followed by copy or paste
    pub tab_then_clipboard: u32,
}

impl Default for PatternWeights {
    fn default() -> Self {
        Self {
            rapid_gaze_switching: 3,
            tab_then_clipboard: 5,
        }
    }
}

/// Lower bounds of the elevated statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskThresholds {
    pub suspicious: u32,
    pub flagged: u32,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            suspicious: 6,
            flagged: 11,
        }
    }
}

impl RiskThresholds {
    pub fn classify(&self, score: u32) -> RiskStatus {
        if score >= self.flagged {
            RiskStatus::Flagged
        } else if score >= self.suspicious {
            RiskStatus::Suspicious
        } else {
            RiskStatus::Normal
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskStatus {
    Normal,
    Suspicious,
    Flagged,
}

impl fmt::Display for RiskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RiskStatus::Normal => "NORMAL",
            RiskStatus::Suspicious => "SUSPICIOUS",
            RiskStatus::Flagged => "FLAGGED",
        })
    }
}

/// Score contribution of one event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScoreDelta {
    pub points: u32,
    pub reasons: Vec<&'static str>,
}

impl ScoreDelta {
    fn add(&mut self, points: u32, reason: &'static str) {
        self.points += points;
        self.reasons.push(reason);
    }

    fn merge(&mut self, other: ScoreDelta) {
        self.points += other.points;
        self.reasons.extend(other.reasons);
    }
}

/// Score a single event. Events without a recognizable payload score zero.
pub fn score_event(event: &Event, weights: &ScoreWeights) -> ScoreDelta {
    let mut delta = ScoreDelta::default();
    let flag = |key: &str| {
        event
            .field(key)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    };

    match event.event_type() {
        EventType::Gaze => {
            let direction = event.field("gaze_direction").and_then(|v| v.as_str());
            if matches!(direction, Some("left" | "right" | "down")) {
                delta.add(weights.gaze_away, "Gaze away from screen");
            }
            let faces = event
                .field("face_count")
                .and_then(|v| v.as_u64())
                .unwrap_or(1);
            if faces > 1 {
                delta.add(weights.multiple_faces, "Multiple faces detected");
            }
        }
        EventType::Audio => {
            if flag("speech_detected") {
                delta.add(weights.speech, "Speech detected");
            }
            if flag("multiple_voices") {
                delta.add(weights.multiple_voices, "Multiple voices detected");
            }
        }
        EventType::Screen => match event.field("trigger").and_then(|v| v.as_str()) {
            Some("tab_change") => delta.add(weights.tab_change, "Tab switching detected"),
            Some("copy" | "paste") => delta.add(weights.clipboard, "Copy/paste activity"),
            _ => {}
        },
        EventType::System | EventType::Other(_) => {}
    }
    delta
}

/// Result of folding one event into a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub session_id: String,
    pub score: u32,
    pub status: RiskStatus,
    pub delta: u32,
    /// Reasons accumulated in the current window, deduplicated
    pub flags: Vec<String>,
}

#[derive(Debug, Clone)]
struct SessionRisk {
    window_start: i64,
    score: u32,
    flags: Vec<String>,
    gaze: VecDeque<String>,
    rapid_gaze_scored: bool,
    /// Previous screen trigger and its timestamp
    last_screen: Option<(String, i64)>,
}

impl SessionRisk {
    fn new(window_start: i64) -> Self {
        Self {
            window_start,
            score: 0,
            flags: Vec::new(),
            gaze: VecDeque::new(),
            rapid_gaze_scored: false,
            last_screen: None,
        }
    }

    fn reset(&mut self, window_start: i64) {
        *self = Self::new(window_start);
    }

    /// Track the event's sequence position and score completed patterns.
    fn detect_patterns(&mut self, event: &Event, weights: &PatternWeights) -> ScoreDelta {
        let mut delta = ScoreDelta::default();
        match event.event_type() {
            EventType::Gaze => {
                let direction = event
                    .field("gaze_direction")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown");
                self.gaze.push_back(direction.to_string());
                if self.gaze.len() > GAZE_HISTORY {
                    self.gaze.pop_front();
                }
                if !self.rapid_gaze_scored && self.gaze.len() >= RAPID_GAZE_MIN_READINGS {
                    let changes = self
                        .gaze
                        .iter()
                        .zip(self.gaze.iter().skip(1))
                        .filter(|(prev, cur)| cur != prev && cur.as_str() != "center")
                        .count();
                    if changes >= RAPID_GAZE_MIN_CHANGES {
                        self.rapid_gaze_scored = true;
                        delta.add(
                            weights.rapid_gaze_switching,
                            "Rapid gaze switching pattern detected",
                        );
                    }
                }
            }
            EventType::Screen => {
                let Some(trigger) = event.field("trigger").and_then(|v| v.as_str()) else {
                    return delta;
                };
                if matches!(trigger, "copy" | "paste") {
                    if let Some((prev, at)) = &self.last_screen {
                        if prev == "tab_change" && event.timestamp() - at < TAB_CLIPBOARD_GAP_MS {
                            delta.add(
                                weights.tab_then_clipboard,
                                "Suspicious tab-change followed by copy/paste",
                            );
                        }
                    }
                }
                self.last_screen = Some((trigger.to_string(), event.timestamp()));
            }
            _ => {}
        }
        delta
    }
}

/// Running per-session totals.
#[derive(Debug, Clone, Default)]
pub struct RiskLedger {
    weights: ScoreWeights,
    thresholds: RiskThresholds,
    window: Option<Duration>,
    patterns: Option<PatternWeights>,
    sessions: HashMap<String, SessionRisk>,
}

impl RiskLedger {
    pub fn new(weights: ScoreWeights, thresholds: RiskThresholds) -> Self {
        Self {
            weights,
            thresholds,
            window: None,
            patterns: None,
            sessions: HashMap::new(),
        }
    }

    /// Reset a session's total once an event falls outside `window`,
    /// measured from the first event of the current window.
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = Some(window);
        self
    }

    /// Also score multi-event sequences.
    pub fn with_patterns(mut self, weights: PatternWeights) -> Self {
        self.patterns = Some(weights);
        self
    }

    pub fn thresholds(&self) -> &RiskThresholds {
        &self.thresholds
    }

    /// Fold an event into its session's total.
    pub fn record(&mut self, event: &Event) -> RiskAssessment {
        let mut delta = score_event(event, &self.weights);
        let window = self.window;
        let session = self
            .sessions
            .entry(event.session_id().to_string())
            .or_insert_with(|| SessionRisk::new(event.timestamp()));

        if let Some(window) = window {
            if event.timestamp() - session.window_start >= window.as_millis() as i64 {
                session.reset(event.timestamp());
            }
        }
        if let Some(patterns) = &self.patterns {
            delta.merge(session.detect_patterns(event, patterns));
        }

        session.score = session.score.saturating_add(delta.points);
        for reason in &delta.reasons {
            if !session.flags.iter().any(|f| f == reason) {
                session.flags.push(reason.to_string());
            }
        }

        RiskAssessment {
            session_id: event.session_id().to_string(),
            score: session.score,
            status: self.thresholds.classify(session.score),
            delta: delta.points,
            flags: session.flags.clone(),
        }
    }

    pub fn score(&self, session_id: &str) -> u32 {
        self.sessions.get(session_id).map_or(0, |s| s.score)
    }

    pub fn status(&self, session_id: &str) -> RiskStatus {
        self.thresholds.classify(self.score(session_id))
    }

    pub fn forget(&mut self, session_id: &str) {
        self.sessions.remove(session_id);
    }
}

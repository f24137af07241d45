//! Live event feed: a bounded, arrival-ordered window with a display filter.

use crate::event::{Event, EventType};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

/// Default number of events kept in the window.
pub const DEFAULT_MAX_EVENTS: usize = 100;

/// Which events the feed presents.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FeedFilter {
    #[default]
    All,
    Only(EventType),
}

impl FeedFilter {
    pub fn matches(&self, event: &Event) -> bool {
        match self {
            FeedFilter::All => true,
            FeedFilter::Only(kind) => event.event_type() == kind,
        }
    }
}

impl FromStr for FeedFilter {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "all" | "" => FeedFilter::All,
            other => FeedFilter::Only(EventType::from(other.to_string())),
        })
    }
}

impl fmt::Display for FeedFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedFilter::All => f.write_str("all"),
            FeedFilter::Only(kind) => write!(f, "{kind}"),
        }
    }
}

/// Most-recent-first window over the arriving events.
#[derive(Debug, Clone)]
pub struct LiveFeed {
    window: VecDeque<Event>,
    max_events: usize,
    filter: FeedFilter,
    total_ingested: u64,
}

impl Default for LiveFeed {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_EVENTS)
    }
}

impl LiveFeed {
    pub fn new(max_events: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(max_events),
            max_events,
            filter: FeedFilter::All,
            total_ingested: 0,
        }
    }

    /// Accept an arriving event, evicting the oldest past `max_events`.
    pub fn ingest(&mut self, event: Event) {
        self.total_ingested += 1;
        self.window.push_front(event);
        self.window.truncate(self.max_events);
    }

    /// Change what is presented; the window itself is untouched.
    pub fn set_filter(&mut self, filter: FeedFilter) {
        self.filter = filter;
    }

    pub fn filter(&self) -> &FeedFilter {
        &self.filter
    }

    /// Presented events, newest first.
    pub fn presented(&self) -> impl Iterator<Item = &Event> {
        self.window.iter().filter(|e| self.filter.matches(e))
    }

    pub fn presented_len(&self) -> usize {
        self.presented().count()
    }

    /// Events held in the window regardless of filter.
    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    pub fn total_ingested(&self) -> u64 {
        self.total_ingested
    }

    pub fn max_events(&self) -> usize {
        self.max_events
    }

    pub fn clear(&mut self) {
        self.window.clear();
    }
}

fn str_field<'a>(event: &'a Event, key: &str) -> Option<&'a str> {
    event.field(key).and_then(|v| v.as_str())
}

/// One-line synopsis of an event for display. Never fails.
pub fn describe(event: &Event) -> String {
    if event.data().is_object() {
        match event.event_type() {
            EventType::Gaze => {
                let direction = str_field(event, "gaze_direction").unwrap_or("unknown");
                let faces = event
                    .field("face_count")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(1);
                return format!("Gaze: {direction}, Faces: {faces}");
            }
            EventType::Audio => {
                let speech = event
                    .field("speech_detected")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                let level = event
                    .field("audio_level")
                    .and_then(|v| v.as_f64())
                    .unwrap_or(0.0)
                    .round();
                let speech = if speech { "Speech detected" } else { "Silent" };
                return format!("Audio: {speech}, Level: {level}");
            }
            EventType::Screen => {
                let trigger = str_field(event, "trigger").unwrap_or("activity");
                return match event.field("visible").and_then(|v| v.as_bool()) {
                    Some(true) => format!("Screen: {trigger} (visible)"),
                    Some(false) => format!("Screen: {trigger} (hidden)"),
                    None => format!("Screen: {trigger}"),
                };
            }
            EventType::System => {
                if let Some(message) = str_field(event, "message") {
                    return format!("System: {message}");
                }
            }
            EventType::Other(_) => {}
        }
    }
    format!("{} event", event.event_type())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(kind: EventType, seq: i64) -> Event {
        Event::new(kind, "S-feed", seq, json!({ "seq": seq }))
    }

    #[test]
    fn test_window_keeps_most_recent() {
        let mut feed = LiveFeed::new(100);
        for i in 0..150 {
            feed.ingest(event(EventType::Audio, i));
        }

        assert_eq!(feed.presented_len(), 100);
        assert_eq!(feed.total_ingested(), 150);
        let seqs: Vec<i64> = feed.presented().map(|e| e.timestamp()).collect();
        assert_eq!(seqs.first(), Some(&149));
        assert_eq!(seqs.last(), Some(&50));
    }

    #[test]
    fn test_filter_narrows_without_touching_window() {
        let mut feed = LiveFeed::default();
        for i in 0..30 {
            let kind = if i % 3 == 0 {
                EventType::Gaze
            } else {
                EventType::Screen
            };
            feed.ingest(event(kind, i));
        }

        feed.set_filter("eye_tracking".parse().unwrap());
        assert_eq!(feed.presented_len(), 10);
        assert!(feed.presented().all(|e| e.event_type() == &EventType::Gaze));
        assert_eq!(feed.window_len(), 30);
        assert_eq!(feed.total_ingested(), 30);

        feed.set_filter(FeedFilter::All);
        assert_eq!(feed.presented_len(), 30);
    }

    #[test]
    fn test_arrival_order_not_timestamp_order() {
        let mut feed = LiveFeed::default();
        feed.ingest(event(EventType::Gaze, 500));
        feed.ingest(event(EventType::Audio, 100));
        let stamps: Vec<i64> = feed.presented().map(|e| e.timestamp()).collect();
        assert_eq!(stamps, vec![100, 500]);
    }

    #[test]
    fn test_describe_known_types() {
        let gaze = Event::new(
            EventType::Gaze,
            "S",
            0,
            json!({"gaze_direction": "left", "face_count": 2}),
        );
        assert_eq!(describe(&gaze), "Gaze: left, Faces: 2");

        let audio = Event::new(
            EventType::Audio,
            "S",
            0,
            json!({"speech_detected": true, "audio_level": 71.6}),
        );
        assert_eq!(describe(&audio), "Audio: Speech detected, Level: 72");

        let screen = Event::new(
            EventType::Screen,
            "S",
            0,
            json!({"trigger": "tab_change", "visible": false}),
        );
        assert_eq!(describe(&screen), "Screen: tab_change (hidden)");

        let system = Event::new(
            EventType::System,
            "S",
            0,
            json!({"message": "gaze monitoring started"}),
        );
        assert_eq!(describe(&system), "System: gaze monitoring started");
    }

    #[test]
    fn test_describe_falls_back() {
        let sparse_gaze = Event::new(EventType::Gaze, "S", 0, json!({}));
        assert_eq!(describe(&sparse_gaze), "Gaze: unknown, Faces: 1");

        let sparse_audio = Event::new(EventType::Audio, "S", 0, json!({"audio_level": "loud"}));
        assert_eq!(describe(&sparse_audio), "Audio: Silent, Level: 0");

        let odd_shape = Event::new(EventType::Screen, "S", 0, json!([1, 2, 3]));
        assert_eq!(describe(&odd_shape), "screen event");

        let unknown = Event::new(EventType::Other("heartbeat".into()), "S", 0, json!({}));
        assert_eq!(describe(&unknown), "heartbeat event");

        let quiet_system = Event::new(EventType::System, "S", 0, json!({"status": "x"}));
        assert_eq!(describe(&quiet_system), "system event");
    }
}

//! Screen and input-behavior monitor.
//!
//! Unlike the interval producers this one is driven by discrete triggers
//! from the environment: tab visibility, clipboard, focus, fullscreen,
//! context menu and a filtered subset of keystrokes.

use super::{device_name, status_event, SharedSink};
use crate::event::{Event, EventClock, EventType};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// History is truncated once it grows past this many events...
pub const HISTORY_LIMIT: usize = 1000;
/// ...down to this many of the most recent ones.
pub const HISTORY_RETAIN: usize = 500;

/// Default look-back window for [`ScreenMonitor::summary`].
pub const DEFAULT_SUMMARY_WINDOW: Duration = Duration::from_secs(60);

/// Keys reported on their own: developer tools, refresh, application switch.
pub const SUSPICIOUS_KEYS: [&str; 4] = ["F12", "F5", "Alt", "Tab"];

/// Letters reported with Ctrl/Cmd: copy, paste, new tab, close tab, refresh,
/// find, view source, inspector.
pub const SHORTCUT_LETTERS: [char; 8] = ['c', 'v', 't', 'w', 'r', 'f', 'u', 'i'];

/// A keystroke as seen by the page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyInput {
    pub key: String,
    pub ctrl: bool,
    pub meta: bool,
    pub alt: bool,
    pub shift: bool,
}

impl KeyInput {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Self::default()
        }
    }

    pub fn with_ctrl(mut self) -> Self {
        self.ctrl = true;
        self
    }

    pub fn with_meta(mut self) -> Self {
        self.meta = true;
        self
    }

    /// Whether this keystroke is worth reporting. Key names match
    /// case-insensitively.
    pub fn is_suspicious(&self) -> bool {
        if SUSPICIOUS_KEYS
            .iter()
            .any(|k| k.eq_ignore_ascii_case(&self.key))
        {
            return true;
        }
        if !(self.ctrl || self.meta) {
            return false;
        }
        let mut chars = self.key.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => SHORTCUT_LETTERS.contains(&c.to_ascii_lowercase()),
            _ => false,
        }
    }

    /// Human-readable combination, e.g. `Ctrl+Shift+I`.
    pub fn combination(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        if self.ctrl {
            parts.push("Ctrl".into());
        }
        if self.meta {
            parts.push("Meta".into());
        }
        if self.alt && !self.key.eq_ignore_ascii_case("Alt") {
            parts.push("Alt".into());
        }
        if self.shift {
            parts.push("Shift".into());
        }
        let key = if self.key.chars().count() == 1 {
            self.key.to_uppercase()
        } else {
            self.key.clone()
        };
        parts.push(key);
        parts.join("+")
    }
}

/// Spelling of a named key as the page reports it (`f12` becomes `F12`).
fn canonical_key(name: &str) -> String {
    SUSPICIOUS_KEYS
        .iter()
        .find(|k| k.eq_ignore_ascii_case(name))
        .map_or_else(|| name.to_string(), |k| k.to_string())
}

/// A discrete environmental trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScreenTrigger {
    VisibilityChange { visible: bool },
    Copy { has_selection: bool },
    Paste,
    Focus,
    Blur,
    FullscreenChange { fullscreen: bool },
    ContextMenu,
    Key(KeyInput),
}

impl ScreenTrigger {
    /// Trigger kind as carried in the payload.
    pub fn kind(&self) -> &'static str {
        match self {
            ScreenTrigger::VisibilityChange { .. } => "tab_change",
            ScreenTrigger::Copy { .. } => "copy",
            ScreenTrigger::Paste => "paste",
            ScreenTrigger::Focus => "window_focus",
            ScreenTrigger::Blur => "window_blur",
            ScreenTrigger::FullscreenChange { .. } => "fullscreen_change",
            ScreenTrigger::ContextMenu => "context_menu",
            ScreenTrigger::Key(_) => "keyboard_shortcut",
        }
    }

    pub fn is_relevant(&self) -> bool {
        match self {
            ScreenTrigger::Key(input) => input.is_suspicious(),
            _ => true,
        }
    }

    fn activity(&self) -> ScreenActivity {
        let mut activity = ScreenActivity {
            trigger: self.kind().to_string(),
            ..ScreenActivity::default()
        };
        match self {
            ScreenTrigger::VisibilityChange { visible } => activity.visible = Some(*visible),
            ScreenTrigger::Copy { has_selection } => activity.has_selection = Some(*has_selection),
            ScreenTrigger::FullscreenChange { fullscreen } => {
                activity.fullscreen = Some(*fullscreen)
            }
            ScreenTrigger::Key(input) => {
                activity.key = Some(input.key.clone());
                activity.combination = Some(input.combination());
            }
            ScreenTrigger::Paste
            | ScreenTrigger::Focus
            | ScreenTrigger::Blur
            | ScreenTrigger::ContextMenu => {}
        }
        activity
    }
}

/// Error parsing a trigger line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseTriggerError(String);

impl fmt::Display for ParseTriggerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Unrecognized trigger: {}", self.0)
    }
}

impl std::error::Error for ParseTriggerError {}

impl FromStr for ScreenTrigger {
    type Err = ParseTriggerError;

    /// Parses lines like `tab hidden`, `copy selected`, `fullscreen off`,
    /// `key ctrl+c` or `key F12`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut words = s.split_whitespace();
        let head = words.next().map(str::to_lowercase);
        let arg = words.next();
        let flag = arg.map(str::to_lowercase);

        let trigger = match (head.as_deref(), flag.as_deref()) {
            (Some("tab"), Some("hidden")) => ScreenTrigger::VisibilityChange { visible: false },
            (Some("tab"), Some("visible")) => ScreenTrigger::VisibilityChange { visible: true },
            (Some("copy"), None) => ScreenTrigger::Copy { has_selection: false },
            (Some("copy"), Some("selected")) => ScreenTrigger::Copy { has_selection: true },
            (Some("paste"), None) => ScreenTrigger::Paste,
            (Some("focus"), None) => ScreenTrigger::Focus,
            (Some("blur"), None) => ScreenTrigger::Blur,
            (Some("fullscreen"), Some("on")) => ScreenTrigger::FullscreenChange { fullscreen: true },
            (Some("fullscreen"), Some("off")) => {
                ScreenTrigger::FullscreenChange { fullscreen: false }
            }
            (Some("contextmenu"), None) => ScreenTrigger::ContextMenu,
            (Some("key"), Some(_)) => {
                let combo = arg.unwrap_or_default();
                let mut input = KeyInput::default();
                for part in combo.split('+') {
                    match part.to_lowercase().as_str() {
                        "ctrl" => input.ctrl = true,
                        "cmd" | "meta" => input.meta = true,
                        "alt" if !combo.eq_ignore_ascii_case("alt") => input.alt = true,
                        "shift" => input.shift = true,
                        _ => input.key = canonical_key(part),
                    }
                }
                if input.key.is_empty() {
                    return Err(ParseTriggerError(s.to_string()));
                }
                ScreenTrigger::Key(input)
            }
            _ => return Err(ParseTriggerError(s.to_string())),
        };
        Ok(trigger)
    }
}

/// Payload of a screen event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScreenActivity {
    pub trigger: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visible: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_selection: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fullscreen: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub combination: Option<String>,
}

/// Counts of screen events by trigger within a window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivitySummary {
    pub counts: BTreeMap<String, usize>,
    pub total: usize,
    pub window_secs: u64,
}

/// Event-driven screen monitor.
pub struct ScreenMonitor {
    session_id: String,
    sink: SharedSink,
    clock: EventClock,
    active: bool,
    history: Vec<Event>,
    produced: u64,
}

impl ScreenMonitor {
    pub fn new(session_id: impl Into<String>, sink: SharedSink) -> Self {
        Self {
            session_id: session_id.into(),
            sink,
            clock: EventClock::new(),
            active: false,
            history: Vec::new(),
            produced: 0,
        }
    }

    /// Begin reacting to triggers. No-op if already active.
    pub fn start(&mut self) {
        if self.active {
            return;
        }
        self.active = true;
        self.history.clear();
        self.produced = 0;

        let now = self.clock.stamp();
        self.sink.emit(status_event(
            &self.session_id,
            now,
            "screen",
            "monitoring_started",
            "screen monitoring started".to_string(),
            json!({ "device": device_name() }),
        ));
        tracing::info!("screen monitor started for session {}", self.session_id);
    }

    /// Stop reacting to triggers. No-op if not active.
    pub fn stop(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        self.history.clear();

        let now = self.clock.stamp();
        self.sink.emit(status_event(
            &self.session_id,
            now,
            "screen",
            "monitoring_stopped",
            "screen monitoring stopped".to_string(),
            json!({ "events_produced": self.produced }),
        ));
        tracing::info!("screen monitor stopped after {} events", self.produced);
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// React to a trigger. Returns the emitted event, if any.
    pub fn observe(&mut self, trigger: ScreenTrigger) -> Option<Event> {
        if !self.active || !trigger.is_relevant() {
            return None;
        }
        let now = self.clock.stamp();
        let data = match serde_json::to_value(trigger.activity()) {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!("Failed to encode screen activity: {}", e);
                return None;
            }
        };
        let event = Event::new(EventType::Screen, self.session_id.as_str(), now, data);
        tracing::debug!("screen trigger {}", trigger.kind());

        self.history.push(event.clone());
        if self.history.len() > HISTORY_LIMIT {
            let excess = self.history.len() - HISTORY_RETAIN;
            self.history.drain(..excess);
        }
        self.produced += 1;
        self.sink.emit(event.clone());
        Some(event)
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn history(&self) -> &[Event] {
        &self.history
    }

    /// Counts over the last `window` of wall-clock time.
    pub fn summary(&self, window: Duration) -> ActivitySummary {
        self.summary_at(crate::event::now_millis(), window)
    }

    pub fn summary_at(&self, now_ms: i64, window: Duration) -> ActivitySummary {
        let cutoff = now_ms - window.as_millis() as i64;
        let mut summary = ActivitySummary {
            window_secs: window.as_secs(),
            ..ActivitySummary::default()
        };
        for event in self.history.iter().filter(|e| e.timestamp() >= cutoff) {
            let trigger = event
                .field("trigger")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown");
            *summary.counts.entry(trigger.to_string()).or_insert(0) += 1;
            summary.total += 1;
        }
        summary
    }
}
